//! Command Engine: single-AVM command execution (`apk_install`,
//! `avm_monkey`, `avm_test_run`) and project file management (`apk_upload`,
//! `apk_delete`, `camera_upload`, `camera_delete`). Grounded on
//! `original_source/ats/kyaraben/worker/tasks.py`. The `avm_commands` row
//! these reference is inserted by the out-of-scope HTTP layer before the
//! task is published (SPEC_FULL.md §1 collaborator contract); the engine
//! only drives it through RUNNING → READY/ERROR.

use crate::broker::Task;
use crate::drivers::container::ContainerRunner;
use crate::drivers::process::quoted_cmdline;
use crate::errors::{DispatchOutcome, PermanentError};
use crate::model::apk::Apk;
use crate::model::avm::AndroidVm;
use crate::model::camera::Camera;
use crate::model::command::Command;
use crate::model::Entity;
use crate::provisioner::{adb_container, prj_container};
use sqlx::SqlitePool;

fn apk_path(apk_id: &str) -> String {
    format!("/data/project/apk/{apk_id}.apk")
}

fn camera_path(camera_id: &str) -> String {
    format!("/data/project/camera/{camera_id}")
}

macro_rules! try_store {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())),
        }
    };
}

pub struct CommandEngine<C> {
    container: C,
}

impl<C: ContainerRunner> CommandEngine<C> {
    pub fn new(container: C) -> Self {
        CommandEngine { container }
    }

    /// Runs `argv` against `avm_id`'s adb container, recording the quoted
    /// command line and `RUNNING` transition up front and the process
    /// output on return, mirroring every `*_command` task in the original:
    /// command text + `ts_begin` go in together, `ts_end`/returncode/stdout/
    /// stderr land once the process exits, and status is left to the
    /// caller (`apk_install` conditions it on the adb output; the others
    /// mark `READY` unconditionally).
    async fn run_adb_command(
        &self,
        pool: &SqlitePool,
        avm_id: &str,
        command_id: &str,
        argv: &[&str],
    ) -> Result<(i32, String, String), DispatchOutcome> {
        let command = Command { command_id: command_id.to_string() };
        let quoted = quoted_cmdline(argv);
        if let Err(e) = command.begin(pool, &quoted).await {
            return Err(DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())));
        }

        let result = self.container.exec(&adb_container(avm_id), argv).await;
        match result {
            Ok((code, stdout, stderr)) => {
                if let Err(e) = command.record_result(pool, code, &stdout, &stderr).await {
                    return Err(DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())));
                }
                Ok((code, stdout, stderr))
            }
            Err(e) => Err(DispatchOutcome::PermanentError(PermanentError::from(e))),
        }
    }

    /// `apk_install`: force-uninstalls (ignoring failure), relaxes the
    /// non-market-apps/package-verifier settings, then `adb install -r`s the
    /// staged APK; a returned output without `Success` is a failed install
    /// (SPEC_FULL.md §4.5 "uninstall-then-install").
    pub async fn apk_install(
        &self,
        pool: &SqlitePool,
        userid: &str,
        project_id: &str,
        avm_id: &str,
        apk_id: &str,
        command_id: &str,
    ) -> DispatchOutcome {
        if try_store!(AndroidVm::get(pool, avm_id, userid).await).is_none() {
            return DispatchOutcome::PermanentError(PermanentError::classified(format!(
                "user {userid} has no permission for avm {avm_id}"
            )));
        }
        let apk = match try_store!(Apk::get(pool, apk_id, project_id, userid).await) {
            Some(apk) => apk,
            None => {
                return DispatchOutcome::PermanentError(PermanentError::classified(format!(
                    "apk {apk_id} not found"
                )))
            }
        };
        let detail = try_store!(apk.select(pool).await);

        let adb = adb_container(avm_id);
        // Force uninstall in case of changed signature; failure is expected
        // when the package was never installed.
        let _ = self.container.exec(&adb, &["adb", "shell", "pm", "uninstall", &detail.package]).await;
        if let Err(e) = self
            .container
            .exec(&adb, &["adb", "shell", "settings", "put", "global", "install_non_market_apps", "1"])
            .await
        {
            return DispatchOutcome::PermanentError(PermanentError::from(e));
        }
        if let Err(e) = self
            .container
            .exec(&adb, &["adb", "shell", "settings", "put", "global", "package_verifier_enable", "0"])
            .await
        {
            return DispatchOutcome::PermanentError(PermanentError::from(e));
        }

        let path = apk_path(apk_id);
        let argv = ["adb", "install", "-r", &path];
        let (_, stdout, _) = match self.run_adb_command(pool, avm_id, command_id, &argv).await {
            Ok(r) => r,
            Err(outcome) => return outcome,
        };

        if !stdout.contains("Success") {
            return DispatchOutcome::PermanentError(PermanentError::classified("install failed"));
        }

        let command = Command { command_id: command_id.to_string() };
        if let Err(e) = command.set_status(pool, "READY", "").await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }
        DispatchOutcome::Done
    }

    /// `avm_monkey`: runs `adb shell monkey -p <pkg>... [--throttle N] <count>`
    /// and always settles `READY` — monkey's own exit status is informational,
    /// not a task failure signal (SPEC_FULL.md §4.4 surface, extended).
    pub async fn avm_monkey(
        &self,
        pool: &SqlitePool,
        userid: &str,
        avm_id: &str,
        command_id: &str,
        packages: &[String],
        event_count: u32,
        throttle: Option<u32>,
    ) -> DispatchOutcome {
        if try_store!(AndroidVm::get(pool, avm_id, userid).await).is_none() {
            return DispatchOutcome::PermanentError(PermanentError::classified(format!(
                "user {userid} has no permission for avm {avm_id}"
            )));
        }

        let mut argv: Vec<String> = vec!["adb".into(), "shell".into(), "monkey".into()];
        for package in packages {
            argv.push("-p".into());
            argv.push(package.clone());
        }
        if let Some(throttle) = throttle {
            argv.push("--throttle".into());
            argv.push(throttle.to_string());
        }
        argv.push(event_count.to_string());
        let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();

        if let Err(outcome) = self.run_adb_command(pool, avm_id, command_id, &argv_refs).await {
            return outcome;
        }

        let command = Command { command_id: command_id.to_string() };
        if let Err(e) = command.set_status(pool, "READY", "").await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }
        DispatchOutcome::Done
    }

    /// `avm_test_run`: `adb shell am instrument -r -w <package>`, settling
    /// `READY` regardless of the instrumentation's own pass/fail summary.
    pub async fn avm_test_run(
        &self,
        pool: &SqlitePool,
        userid: &str,
        avm_id: &str,
        package: &str,
        command_id: &str,
    ) -> DispatchOutcome {
        if try_store!(AndroidVm::get(pool, avm_id, userid).await).is_none() {
            return DispatchOutcome::PermanentError(PermanentError::classified(format!(
                "user {userid} has no permission for avm {avm_id}"
            )));
        }

        let argv = ["adb", "shell", "am", "instrument", "-r", "-w", package];
        if let Err(outcome) = self.run_adb_command(pool, avm_id, command_id, &argv).await {
            return outcome;
        }

        let command = Command { command_id: command_id.to_string() };
        if let Err(e) = command.set_status(pool, "READY", "").await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }
        DispatchOutcome::Done
    }

    /// `camera_upload`: pipes the uploaded file's bytes into
    /// `video_create.sh` inside the project container, finalizes the Camera
    /// row `READY`, and cleans up the host temp file.
    pub async fn camera_upload(
        &self,
        pool: &SqlitePool,
        userid: &str,
        project_id: &str,
        camera_id: &str,
        filename: &str,
        tmppath: &str,
    ) -> DispatchOutcome {
        use crate::model::project::Project;
        if try_store!(Project::get(pool, project_id, userid).await).is_none() {
            return DispatchOutcome::PermanentError(PermanentError::classified(format!(
                "user {userid} has no permission for project {project_id}"
            )));
        }

        let bytes = match std::fs::read(tmppath) {
            Ok(b) => b,
            Err(e) => return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())),
        };

        let container = prj_container(project_id);
        let dest = camera_path(camera_id);
        if let Err(e) = self
            .container
            .exec_with_stdin(&container, &["/root/video_create.sh", filename, &dest], &bytes)
            .await
        {
            return DispatchOutcome::PermanentError(PermanentError::from(e));
        }

        if let Err(e) = Camera::insert(pool, camera_id, filename, project_id).await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }
        let _ = std::fs::remove_file(tmppath);
        DispatchOutcome::Done
    }

    /// `camera_delete`: removes the staged file from the project container
    /// and marks the Camera row `DELETED`.
    pub async fn camera_delete(
        &self,
        pool: &SqlitePool,
        userid: &str,
        project_id: &str,
        camera_id: &str,
    ) -> DispatchOutcome {
        use crate::model::project::Project;
        if try_store!(Project::get(pool, project_id, userid).await).is_none() {
            return DispatchOutcome::PermanentError(PermanentError::classified(format!(
                "user {userid} has no permission for project {project_id}"
            )));
        }

        let camera = match try_store!(Camera::get(pool, camera_id, project_id, userid).await) {
            Some(camera) => camera,
            None => {
                return DispatchOutcome::PermanentError(PermanentError::classified(format!(
                    "camera {camera_id} not found"
                )))
            }
        };

        let container = prj_container(project_id);
        let _ = self.container.exec(&container, &["rm", "-f", &camera_path(camera_id)]).await;

        if let Err(e) = camera.set_status(pool, "DELETED", "").await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }
        DispatchOutcome::Done
    }

    /// `apk_upload`: stages the uploaded APK into the project container,
    /// makes it world-readable for the player containers, finalizes the APK
    /// row `READY`, and cleans up the host temp file.
    pub async fn apk_upload(
        &self,
        pool: &SqlitePool,
        userid: &str,
        project_id: &str,
        apk_id: &str,
        filename: &str,
        tmppath: &str,
    ) -> DispatchOutcome {
        use crate::model::project::Project;
        if try_store!(Project::get(pool, project_id, userid).await).is_none() {
            return DispatchOutcome::PermanentError(PermanentError::classified(format!(
                "user {userid} has no permission for project {project_id}"
            )));
        }

        let container = prj_container(project_id);
        let path = apk_path(apk_id);
        if let Err(e) = self.container.cp_from_host(tmppath, &container, &path).await {
            return DispatchOutcome::PermanentError(PermanentError::from(e));
        }
        if let Err(e) = self.container.exec(&container, &["chmod", "644", &path]).await {
            return DispatchOutcome::PermanentError(PermanentError::from(e));
        }

        if let Err(e) = Apk::insert(pool, apk_id, filename, project_id, "").await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }
        let _ = std::fs::remove_file(tmppath);
        DispatchOutcome::Done
    }

    /// `apk_delete`: removes the staged APK from the project container,
    /// detaches it from any testsource, and marks the APK row `DELETED`.
    pub async fn apk_delete(
        &self,
        pool: &SqlitePool,
        userid: &str,
        project_id: &str,
        apk_id: &str,
    ) -> DispatchOutcome {
        use crate::model::project::Project;
        if try_store!(Project::get(pool, project_id, userid).await).is_none() {
            return DispatchOutcome::PermanentError(PermanentError::classified(format!(
                "user {userid} has no permission for project {project_id}"
            )));
        }

        let apk = match try_store!(Apk::get(pool, apk_id, project_id, userid).await) {
            Some(apk) => apk,
            None => {
                return DispatchOutcome::PermanentError(PermanentError::classified(format!(
                    "apk {apk_id} not found"
                )))
            }
        };

        let container = prj_container(project_id);
        let _ = self.container.exec(&container, &["rm", "-f", &apk_path(apk_id)]).await;

        if let Err(e) = sqlx::query("UPDATE testsources SET apk_id = NULL WHERE apk_id = ?")
            .bind(apk_id)
            .execute(pool)
            .await
        {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }

        if let Err(e) = apk.set_status(pool, "DELETED", "").await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }
        DispatchOutcome::Done
    }
}

/// Routes a `Task` to the matching command-engine pipeline; the VM
/// Provisioner and Campaign Engine handle everything else.
pub async fn handle_command_task<C>(
    engine: &CommandEngine<C>,
    pool: &SqlitePool,
    task: &Task,
) -> Option<DispatchOutcome>
where
    C: ContainerRunner,
{
    match task {
        Task::ApkInstall { avm_id, userid, project_id, apk_id, command_id } => {
            Some(engine.apk_install(pool, userid, project_id, avm_id, apk_id, command_id).await)
        }
        Task::AvmMonkey { avm_id, userid, command_id, packages, event_count, throttle } => Some(
            engine.avm_monkey(pool, userid, avm_id, command_id, packages, *event_count, *throttle).await,
        ),
        Task::AvmTestRun { avm_id, userid, package, command_id } => {
            Some(engine.avm_test_run(pool, userid, avm_id, package, command_id).await)
        }
        Task::CameraUpload { camera_id, project_id, userid, filename, tmppath } => {
            Some(engine.camera_upload(pool, userid, project_id, camera_id, filename, tmppath).await)
        }
        Task::CameraDelete { camera_id, project_id, userid } => {
            Some(engine.camera_delete(pool, userid, project_id, camera_id).await)
        }
        Task::ApkUpload { apk_id, project_id, userid, filename, tmppath } => {
            Some(engine.apk_upload(pool, userid, project_id, apk_id, filename, tmppath).await)
        }
        Task::ApkDelete { apk_id, project_id, userid } => {
            Some(engine.apk_delete(pool, userid, project_id, apk_id).await)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apk_path_matches_template() {
        assert_eq!(apk_path("a1"), "/data/project/apk/a1.apk");
    }

    #[test]
    fn camera_path_matches_template() {
        assert_eq!(camera_path("c1"), "/data/project/camera/c1");
    }
}
