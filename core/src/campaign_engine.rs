//! Campaign Engine: `campaign_run` → `campaign_avm_create` →
//! `campaign_containers_create` → `campaign_runtest`, plus
//! `testsource_compile` and `campaign_delete`. Grounded on
//! `original_source/ats/kyaraben/worker/tasks.py`.

use crate::broker::{Task, TaskBroker};
use crate::config::{AmqpConfig, OpenstackConfig, PlacementConfig, QuotaConfig};
use crate::drivers::amqp_admin::{event_queue_name, AmqpAdmin, EVENT_TOPICS};
use crate::drivers::container::ContainerRunner;
use crate::drivers::heat::HeatClient;
use crate::errors::{DispatchOutcome, PermanentError};
use crate::model::avm::AndroidVm;
use crate::model::campaign::Campaign;
use crate::model::command::Command;
use crate::model::testsource::Testsource;
use crate::model::Entity;
use crate::otp::generate_amqp_password;
use crate::provisioner::{adb_container, stack_name_for};
use sqlx::SqlitePool;
use std::collections::HashMap;

fn apk_path(apk_id: &str) -> String {
    format!("/data/project/apk/{apk_id}.apk")
}

/// The Android sample instrumentation excluded from `pm list
/// instrumentation` package discovery (SPEC_FULL.md §4.5).
const EXCLUDED_INSTRUMENTATION: &str = "com.example.android.apis/.app.LocalSampleInstrumentation";

/// Path of the signed APK inside the Java-compile container, staged into
/// `prjdata` once compilation succeeds.
const TESTCC_OUTPUT_PATH: &str = "/home/developer/signed.apk";

/// Parses `pm list instrumentation` output (`instrumentation:pkg/.Runner
/// (target=...)` lines) into package names, dropping the excluded sample.
pub fn parse_instrumentation_packages(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.strip_prefix("instrumentation:")?;
            let entry = rest.split_whitespace().next()?;
            Some(entry.to_string())
        })
        .filter(|entry| entry != EXCLUDED_INSTRUMENTATION)
        .collect()
}

pub struct CampaignEngine<B, C, A, H> {
    broker: B,
    container: C,
    amqp_admin: A,
    heat: H,
    amqp: AmqpConfig,
    openstack: OpenstackConfig,
    placement: PlacementConfig,
    quota: QuotaConfig,
}

impl<B, C, A, H> CampaignEngine<B, C, A, H>
where
    B: TaskBroker,
    C: ContainerRunner,
    A: AmqpAdmin,
    H: HeatClient,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: B,
        container: C,
        amqp_admin: A,
        heat: H,
        amqp: AmqpConfig,
        openstack: OpenstackConfig,
        placement: PlacementConfig,
        quota: QuotaConfig,
    ) -> Self {
        CampaignEngine { broker, container, amqp_admin, heat, amqp, openstack, placement, quota }
    }

    /// Fans out one `campaign_avm_create` per testrun; does not wait for
    /// any of them before returning `Done` — the campaign's `READY` state
    /// is a rollup over Command status, not a synchronous completion.
    pub async fn campaign_run(
        &self,
        pool: &SqlitePool,
        campaign_id: &str,
        userid: &str,
        project_id: &str,
    ) -> DispatchOutcome {
        let campaign = Campaign { campaign_id: campaign_id.to_string() };
        let testruns = match campaign.testruns(pool).await {
            Ok(t) => t,
            Err(e) => return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())),
        };

        if let Err(e) = campaign.set_status(pool, "RUNNING", "").await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }

        for testrun in testruns {
            let task = Task::CampaignAvmCreate {
                campaign_id: campaign_id.to_string(),
                testrun_id: testrun.testrun_id,
                userid: userid.to_string(),
                project_id: project_id.to_string(),
            };
            if let Err(e) = self.broker.publish(&task, 0).await {
                return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
            }
        }
        DispatchOutcome::Done
    }

    /// Enforces the async VM quota before creating a VM for a campaign
    /// testrun: over quota requests a retry delay rather than failing the
    /// campaign (SPEC_FULL.md §4.5, "async quota enforcement via
    /// TaskDelay"). Inserts the AVM row (status `CREATING`, linked to its
    /// testrun), creates its AMQP account directly (a dedicated pipeline,
    /// not a delegation to `avm_create` — the campaign path needs
    /// `apk_ids`/`packages`/`testrun_id` carried through to
    /// `campaign_runtest`, which the generic AVM pipeline has no channel
    /// for), creates the Heat stack, then publishes
    /// `campaign_containers_create`.
    pub async fn campaign_avm_create(
        &self,
        pool: &SqlitePool,
        userid: &str,
        project_id: &str,
        campaign_id: &str,
        testrun_id: &str,
    ) -> DispatchOutcome {
        let counts = match AndroidVm::count(pool, userid).await {
            Ok(c) => c,
            Err(e) => return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())),
        };
        if counts.async_current >= self.quota.vm_async_max as i64 {
            return DispatchOutcome::Retry("async VM quota exceeded".to_string());
        }

        let campaign = Campaign { campaign_id: campaign_id.to_string() };
        let testruns = match campaign.testruns(pool).await {
            Ok(t) => t,
            Err(e) => return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())),
        };
        let testrun = match testruns.into_iter().find(|t| t.testrun_id == testrun_id) {
            Some(t) => t,
            None => return DispatchOutcome::Done,
        };

        let avm_id = uuid::Uuid::new_v4().simple().to_string();
        let vnc_secret = crate::otp::generate_vnc_secret();
        if let Err(e) = AndroidVm::insert(
            pool,
            &avm_id,
            None,
            userid,
            project_id,
            &testrun.image,
            &testrun.hwconfig,
            &vnc_secret,
            Some(testrun_id),
        )
        .await
        {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }

        let amqp_password = generate_amqp_password();
        for topic in EVENT_TOPICS {
            let queue = event_queue_name(&avm_id, topic);
            if let Err(e) = self.amqp_admin.create_user(&queue, &amqp_password).await {
                return DispatchOutcome::PermanentError(PermanentError::from(e));
            }
        }
        if let Err(e) = self.amqp_admin.create_user(&avm_id, &amqp_password).await {
            return DispatchOutcome::PermanentError(PermanentError::from(e));
        }
        if let Err(e) = self.amqp_admin.set_user_permissions("/", &avm_id, &avm_id).await {
            return DispatchOutcome::PermanentError(PermanentError::from(e));
        }

        let avm = AndroidVm { avm_id: avm_id.clone() };
        if let Err(e) = avm.set_status(pool, "CREATING", "").await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }

        let stack_name = stack_name_for(&self.placement.stackprefix, userid, &avm_id);
        if let Err(e) = avm.update_stack_name(pool, &stack_name).await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }

        let image_row = match crate::model::image::lookup(pool, &testrun.image).await {
            Ok(r) => r,
            Err(e) => return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())),
        };

        let mut params = HashMap::new();
        params.insert("system_image".to_string(), image_row.system_image);
        params.insert("data_image".to_string(), image_row.data_image);
        params.insert("floating_net".to_string(), self.openstack.floating_net.clone());

        let stack_id = match self.heat.stack_create(&stack_name, &params, &self.openstack.template).await {
            Ok(id) => id,
            Err(e) => return DispatchOutcome::PermanentError(PermanentError::from(e)),
        };

        let task = Task::CampaignContainersCreate {
            campaign_id: campaign_id.to_string(),
            testrun_id: testrun_id.to_string(),
            avm_id,
            userid: userid.to_string(),
            project_id: project_id.to_string(),
            amqp_password,
            android_version: image_row.android_version,
            stack_name,
            stack_id,
            vnc_secret,
        };
        if let Err(e) = self.broker.publish(&task, 0).await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }
        DispatchOutcome::Done
    }

    /// `campaign_containers_create`: waits for the stack's `instance_ip`
    /// output, brings up the player container, starts billing, marks the
    /// AVM `READY`, then publishes `campaign_runtest` to drive the actual
    /// install/instrument run (SPEC_FULL.md §4.5).
    #[allow(clippy::too_many_arguments)]
    pub async fn campaign_containers_create(
        &self,
        pool: &SqlitePool,
        campaign_id: &str,
        testrun_id: &str,
        avm_id: &str,
        stack_name: &str,
        stack_id: &str,
        amqp_password: &str,
        android_version: &str,
        vnc_secret: &str,
    ) -> DispatchOutcome {
        let avm = AndroidVm { avm_id: avm_id.to_string() };
        let detail = match avm.select(pool).await {
            Ok(d) => d,
            Err(e) => return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())),
        };

        let outputs = match self.heat.stack_output(stack_name, stack_id).await {
            Ok(Some(o)) => o,
            Ok(None) => return DispatchOutcome::Retry("stack outputs not ready".to_string()),
            Err(e) => return DispatchOutcome::PermanentError(PermanentError::from(e)),
        };
        let instance_ip = outputs.get("instance_ip").cloned().unwrap_or_default();
        if instance_ip.is_empty() {
            return DispatchOutcome::Retry("stack outputs not ready".to_string());
        }
        let hwconfig = crate::model::HwConfig::default();

        if let Err(e) = self
            .container
            .player_up(
                &detail.project_id,
                avm_id,
                &instance_ip,
                &hwconfig,
                &self.amqp.hostname,
                avm_id,
                amqp_password,
                android_version,
                vnc_secret,
            )
            .await
        {
            return DispatchOutcome::PermanentError(PermanentError::from(e));
        }

        if let Err(e) = avm.start_billing(pool).await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }
        if let Err(e) = avm.set_status(pool, "READY", "").await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }

        let task = Task::CampaignRuntest {
            campaign_id: campaign_id.to_string(),
            testrun_id: testrun_id.to_string(),
            avm_id: avm_id.to_string(),
        };
        if let Err(e) = self.broker.publish(&task, 0).await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }
        DispatchOutcome::Done
    }

    /// Probes `adb shell getprop dev.bootcomplete`; anything other than
    /// `"1"` asks for a retry. The probe is advisory/TOCTOU by design
    /// (SPEC_FULL.md §7) — a later install failure is an ordinary Command
    /// `ERROR`, not evidence the probe lied.
    pub async fn wait_for_bootcomplete(&self, avm_id: &str) -> DispatchOutcome {
        match self
            .container
            .exec(&adb_container(avm_id), &["adb", "shell", "getprop", "dev.bootcomplete"])
            .await
        {
            Ok((0, stdout, _)) if stdout.trim() == "1" => DispatchOutcome::Done,
            Ok(_) => DispatchOutcome::Retry("boot not complete".to_string()),
            Err(e) => DispatchOutcome::PermanentError(PermanentError::from(e)),
        }
    }

    /// Runs one adb command against `avm_id`'s adb container as a tracked
    /// Command: inserts the row, records the quoted command line with the
    /// `RUNNING` transition, executes, then records the process output.
    /// Status (`READY`/`ERROR`) is left to the caller, matching
    /// `command_engine::CommandEngine::run_adb_command`.
    async fn run_tracked_command(
        &self,
        pool: &SqlitePool,
        avm_id: &str,
        argv: &[&str],
    ) -> Result<(String, String), DispatchOutcome> {
        let command_id = uuid::Uuid::new_v4().simple().to_string();
        let quoted = crate::drivers::process::quoted_cmdline(argv);

        if let Err(e) = Command::insert(pool, &command_id, avm_id, &quoted).await {
            return Err(DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())));
        }
        let command = Command { command_id: command_id.clone() };
        if let Err(e) = command.begin(pool, &quoted).await {
            return Err(DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())));
        }

        let (code, stdout, stderr) = match self.container.exec(&adb_container(avm_id), argv).await {
            Ok(r) => r,
            Err(e) => return Err(DispatchOutcome::PermanentError(PermanentError::from(e))),
        };
        if let Err(e) = command.record_result(pool, code, &stdout, &stderr).await {
            return Err(DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())));
        }
        Ok((command_id, stdout))
    }

    /// `campaign_runtest`: probes `dev.bootcomplete`, uninstalls (ignoring
    /// errors) then installs each APK in declared order (recording a
    /// Command per install, failing the task if the adb output doesn't
    /// contain `Success`), falls back to
    /// `pm list instrumentation` discovery when no packages were declared,
    /// runs `am instrument` for each package (recording a Command per run,
    /// always settling `READY`), tears the VM down via the `avm_delete`
    /// sequence, then promotes the campaign to `READY` once every one of
    /// its commands is `READY` (SPEC_FULL.md §4.5).
    pub async fn campaign_runtest(
        &self,
        pool: &SqlitePool,
        campaign_id: &str,
        testrun_id: &str,
        avm_id: &str,
    ) -> DispatchOutcome {
        let campaign = Campaign { campaign_id: campaign_id.to_string() };
        let testruns = match campaign.testruns(pool).await {
            Ok(t) => t,
            Err(e) => return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())),
        };
        let testrun = match testruns.into_iter().find(|t| t.testrun_id == testrun_id) {
            Some(t) => t,
            None => return DispatchOutcome::Done,
        };

        match self.wait_for_bootcomplete(avm_id).await {
            DispatchOutcome::Done => {}
            other => return other,
        }

        for apk_id in &testrun.apk_ids {
            let apk = crate::model::apk::Apk { apk_id: apk_id.clone() };
            let detail = match apk.select(pool).await {
                Ok(d) => d,
                Err(e) => return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())),
            };
            let _ = self
                .container
                .exec(&adb_container(avm_id), &["adb", "shell", "pm", "uninstall", &detail.package])
                .await;

            let argv = ["adb", "install", "-r", &apk_path(apk_id)];
            let (command_id, stdout) = match self.run_tracked_command(pool, avm_id, &argv).await {
                Ok(r) => r,
                Err(outcome) => return outcome,
            };
            if let Err(e) = Campaign::link_apk_command(pool, testrun_id, apk_id, &command_id).await {
                return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
            }
            if !stdout.contains("Success") {
                return DispatchOutcome::PermanentError(PermanentError::classified("install failed"));
            }
            let command = Command { command_id };
            if let Err(e) = command.set_status(pool, "READY", "").await {
                return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
            }
        }

        let mut packages = testrun.packages.clone();
        if packages.is_empty() {
            let (_, stdout, _) = match self
                .container
                .exec(&adb_container(avm_id), &["adb", "shell", "pm", "list", "instrumentation"])
                .await
            {
                Ok(r) => r,
                Err(e) => return DispatchOutcome::PermanentError(PermanentError::from(e)),
            };
            packages = parse_instrumentation_packages(&stdout);
            for package in &packages {
                if let Err(e) = Campaign::add_discovered_package(pool, testrun_id, package).await {
                    return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
                }
            }
        }

        for package in &packages {
            let argv = ["adb", "shell", "am", "instrument", "-r", "-w", package];
            let (command_id, _) = match self.run_tracked_command(pool, avm_id, &argv).await {
                Ok(r) => r,
                Err(outcome) => return outcome,
            };
            if let Err(e) = Campaign::link_package_command(pool, testrun_id, package, &command_id).await {
                return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
            }
            let command = Command { command_id };
            if let Err(e) = command.set_status(pool, "READY", "").await {
                return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
            }
        }

        let avm = AndroidVm { avm_id: avm_id.to_string() };
        let project_id = match avm.get_project_id(pool).await {
            Ok(id) => id,
            Err(e) => return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())),
        };
        let _ = self.container.player_down(avm_id, &project_id).await;
        let _ = avm.stop_billing(pool).await;
        let _ = self.amqp_admin.delete_user(avm_id).await;
        for topic in EVENT_TOPICS {
            let queue = event_queue_name(avm_id, topic);
            let _ = self.amqp_admin.delete_user(&queue).await;
        }
        if let Ok(Some(stack_name)) = avm.get_stack_name(pool).await {
            match self.heat.stack_delete(&stack_name).await {
                Ok(()) | Err(crate::errors::DriverError::AvmNotFound(_)) => {}
                Err(e) => return DispatchOutcome::PermanentError(PermanentError::from(e)),
            }
        }
        if let Err(e) = avm.set_status(pool, "DELETED", "").await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }

        match campaign.is_ready(pool).await {
            Ok(true) => {
                if let Err(e) = campaign.set_status(pool, "READY", "").await {
                    return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
                }
            }
            Ok(false) => {}
            Err(e) => return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())),
        }

        DispatchOutcome::Done
    }

    /// Compiles a DSL test source through two throwaway containers (`DSL`
    /// then `Java`), driving the backing APK — not the testsource itself —
    /// through `COMPILING DSL` → `COMPILING JAVA` → `READY`/`ERROR`, then
    /// stages the compiled APK into the project's `prjdata` container and
    /// records its package name (SPEC_FULL.md §4.5), matching
    /// `original_source/ats/kyaraben/worker/tasks.py::testsource_compile`.
    pub async fn testsource_compile(
        &self,
        pool: &SqlitePool,
        userid: &str,
        project_id: &str,
        testsource_id: &str,
    ) -> DispatchOutcome {
        if match crate::model::project::Project::get(pool, project_id, userid).await {
            Ok(p) => p,
            Err(e) => return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())),
        }
        .is_none()
        {
            return DispatchOutcome::PermanentError(PermanentError::classified(format!(
                "user {userid} has no permission for project {project_id}"
            )));
        }

        let testsource = match Testsource::get(pool, testsource_id, project_id, userid).await {
            Ok(Some(t)) => t,
            Ok(None) => {
                return DispatchOutcome::PermanentError(PermanentError::classified(format!(
                    "testsource {testsource_id} not found"
                )))
            }
            Err(e) => return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())),
        };

        let apk_id = match testsource.apk_id(pool).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                return DispatchOutcome::PermanentError(PermanentError::classified(format!(
                    "testsource {testsource_id} has no backing apk"
                )))
            }
            Err(e) => return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())),
        };
        let content = match testsource.content(pool).await {
            Ok(c) => c,
            Err(e) => return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())),
        };

        let apk = match crate::model::apk::Apk::get(pool, &apk_id, project_id, userid).await {
            Ok(Some(a)) => a,
            Ok(None) => {
                return DispatchOutcome::PermanentError(PermanentError::classified(format!(
                    "apk not found: {apk_id}"
                )))
            }
            Err(e) => return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())),
        };

        if let Err(e) = apk.set_status(pool, "COMPILING DSL", "").await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }

        let dsl_container = format!("dsl-compile-{testsource_id}");
        let java_container = format!("java-compile-{testsource_id}");
        let result = self.compile_pipeline(pool, &apk, &dsl_container, &java_container, &content).await;

        let _ = self.container.project_down(&dsl_container).await;
        let _ = self.container.project_down(&java_container).await;

        let package_name = match result {
            Ok(name) => name,
            Err(reason) => {
                if let Err(e) = apk.set_status(pool, "ERROR", &reason).await {
                    return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
                }
                return DispatchOutcome::PermanentError(PermanentError::unclassified(reason));
            }
        };

        if let Err(e) = self
            .container
            .cp(&java_container, TESTCC_OUTPUT_PATH, &crate::provisioner::prj_container(project_id), &apk_path(&apk_id))
            .await
        {
            let _ = apk.set_status(pool, "ERROR", &e.to_string()).await;
            return DispatchOutcome::PermanentError(PermanentError::from(e));
        }
        if let Err(e) = apk.set_package_name(pool, &package_name).await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }
        if let Err(e) = apk.set_status(pool, "READY", "").await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }
        DispatchOutcome::Done
    }

    /// Runs the DSL container against `content`'s stdin, feeding its
    /// compiled Java source into the Java container's stdin in turn, and
    /// returns the package name read off the last line of its stdout
    /// (`proc.out_lines[-1]` in the original).
    async fn compile_pipeline(
        &self,
        pool: &SqlitePool,
        apk: &crate::model::apk::Apk,
        dsl_container: &str,
        java_container: &str,
        content: &str,
    ) -> Result<String, String> {
        self.container
            .project_up(dsl_container)
            .await
            .map_err(|e| format!("dsl compile setup failed: {e}"))?;
        let (_, testing_java, _) = self
            .container
            .exec_with_stdin(dsl_container, &["compile-dsl"], content.as_bytes())
            .await
            .map_err(|e| format!("dsl compile failed: {e}"))?;

        if let Err(e) = apk.set_status(pool, "COMPILING JAVA", "").await {
            return Err(e.to_string());
        }

        self.container
            .project_up(java_container)
            .await
            .map_err(|e| format!("java compile setup failed: {e}"))?;
        let (_, stdout, _) = self
            .container
            .exec_with_stdin(java_container, &["compile-java"], testing_java.as_bytes())
            .await
            .map_err(|e| format!("java compile failed: {e}"))?;

        stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(str::to_string)
            .ok_or_else(|| "java compile produced no package name".to_string())
    }

    /// Publishes one `avm_delete` task per live AVM found among the
    /// campaign's testruns, transitions those AVMs to `DELETING`
    /// immediately, then sets the campaign `DELETED` without waiting for
    /// teardown to finish (SPEC_FULL.md §4.5, fire-and-forget cascade).
    pub async fn campaign_delete(&self, pool: &SqlitePool, campaign_id: &str) -> DispatchOutcome {
        let campaign = Campaign { campaign_id: campaign_id.to_string() };
        let avm_ids = match campaign.live_avm_ids(pool).await {
            Ok(ids) => ids,
            Err(e) => return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())),
        };

        for avm_id in &avm_ids {
            let avm = AndroidVm { avm_id: avm_id.clone() };
            let userid = match avm.get_owner(pool).await {
                Ok(u) => u,
                Err(e) => return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())),
            };
            if let Err(e) = avm.set_status(pool, "DELETING", "").await {
                return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
            }
            let task = Task::AvmDelete { avm_id: avm_id.clone(), userid };
            if let Err(e) = self.broker.publish(&task, 0).await {
                return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
            }
        }

        if let Err(e) = campaign.set_status(pool, "DELETED", "").await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }
        DispatchOutcome::Done
    }
}

/// Routes a `Task` to the matching campaign pipeline; the VM Provisioner
/// (`handle_avm_task`) handles everything else.
pub async fn handle_campaign_task<B, C, A, H>(
    engine: &CampaignEngine<B, C, A, H>,
    pool: &SqlitePool,
    task: &Task,
) -> Option<DispatchOutcome>
where
    B: TaskBroker,
    C: ContainerRunner,
    A: AmqpAdmin,
    H: HeatClient,
{
    match task {
        Task::CampaignRun { campaign_id, userid, project_id } => {
            Some(engine.campaign_run(pool, campaign_id, userid, project_id).await)
        }
        Task::CampaignAvmCreate { campaign_id, testrun_id, userid, project_id } => {
            Some(engine.campaign_avm_create(pool, userid, project_id, campaign_id, testrun_id).await)
        }
        Task::CampaignContainersCreate {
            campaign_id,
            testrun_id,
            avm_id,
            amqp_password,
            android_version,
            stack_name,
            stack_id,
            vnc_secret,
            ..
        } => Some(
            engine
                .campaign_containers_create(
                    pool,
                    campaign_id,
                    testrun_id,
                    avm_id,
                    stack_name,
                    stack_id,
                    amqp_password,
                    android_version,
                    vnc_secret,
                )
                .await,
        ),
        Task::CampaignRuntest { campaign_id, testrun_id, avm_id } => {
            Some(engine.campaign_runtest(pool, campaign_id, testrun_id, avm_id).await)
        }
        Task::CampaignDelete { campaign_id } => Some(engine.campaign_delete(pool, campaign_id).await),
        Task::TestsourceCompile { testsource_id, project_id, userid } => {
            Some(engine.testsource_compile(pool, userid, project_id, testsource_id).await)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excludes_android_sample_instrumentation() {
        let output = "instrumentation:com.example.android.apis/.app.LocalSampleInstrumentation (target=com.example.android.apis)\ninstrumentation:com.acme.tests/.Runner (target=com.acme.app)\n";
        let packages = parse_instrumentation_packages(output);
        assert_eq!(packages, vec!["com.acme.tests/.Runner".to_string()]);
    }

    #[test]
    fn empty_output_yields_no_packages() {
        assert!(parse_instrumentation_packages("").is_empty());
    }
}
