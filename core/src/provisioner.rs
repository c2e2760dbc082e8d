//! VM Provisioner: `avm_create` / `avm_containers_create` / `avm_delete`
//! pipelines, grounded on `original_source/ats/kyaraben/worker/tasks.py`.

use crate::broker::{Task, TaskBroker};
use crate::config::{AmqpConfig, OpenstackConfig, PlacementConfig};
use crate::drivers::amqp_admin::{event_queue_name, AmqpAdmin, EVENT_TOPICS};
use crate::drivers::container::ContainerRunner;
use crate::drivers::heat::HeatClient;
use crate::errors::{DispatchOutcome, PermanentError};
use crate::model::avm::AndroidVm;
use crate::model::Entity;
use crate::otp::generate_amqp_password;
use sqlx::SqlitePool;
use std::collections::HashMap;

/// Stack name convention shared by the standalone and campaign AVM
/// pipelines: `{stackprefix}-{userid}-{avm_id}` (original's
/// `new_stack_name`).
pub fn stack_name_for(stackprefix: &str, userid: &str, avm_id: &str) -> String {
    format!("{stackprefix}-{userid}-{avm_id}")
}

/// Container naming conventions shared across the provisioner, campaign
/// engine, and command engine (original's `adb_container`/`prj_container`).
pub fn adb_container(avm_id: &str) -> String {
    format!("{avm_id}_adb")
}

pub fn prj_container(project_id: &str) -> String {
    format!("{project_id}_prjdata")
}

/// `avm_create`/`avm_containers_create`/`avm_delete` wired against the
/// driver traits; unit-testable with fakes, used by the worker binary with
/// the `Http*`/real implementations.
pub struct VmProvisioner<A, H, C, B> {
    amqp_admin: A,
    heat: H,
    container: C,
    broker: B,
    amqp: AmqpConfig,
    openstack: OpenstackConfig,
    placement: PlacementConfig,
}

impl<A, H, C, B> VmProvisioner<A, H, C, B>
where
    A: AmqpAdmin,
    H: HeatClient,
    C: ContainerRunner,
    B: TaskBroker,
{
    pub fn new(
        amqp_admin: A,
        heat: H,
        container: C,
        broker: B,
        amqp: AmqpConfig,
        openstack: OpenstackConfig,
        placement: PlacementConfig,
    ) -> Self {
        VmProvisioner { amqp_admin, heat, container, broker, amqp, openstack, placement }
    }

    /// `avm_create` (SPEC_FULL.md §4.4): declares the seven per-topic event
    /// queues, creates the AMQP account, grants read-only permissions on
    /// its event namespace, resolves `image` to its Heat glance images via
    /// the `images` reference table, creates the Heat stack, then chains
    /// into `avm_containers_create` carrying the freshly generated AMQP
    /// password and the stack's real id — mirroring
    /// `original_source/worker/tasks.py::avm_create`, which threads
    /// `amqp_password`/`android_version` through the task payload rather
    /// than persisting them.
    pub async fn avm_create(
        &self,
        pool: &SqlitePool,
        avm_id: &str,
        userid: &str,
        image: &str,
        stack_name: &str,
        vnc_secret: &str,
    ) -> DispatchOutcome {
        if match AndroidVm::get(pool, avm_id, userid).await {
            Ok(v) => v,
            Err(e) => return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())),
        }
        .is_none()
        {
            return DispatchOutcome::PermanentError(PermanentError::classified(format!(
                "user {userid} has no permission for avm {avm_id}"
            )));
        }

        let password = generate_amqp_password();

        for topic in EVENT_TOPICS {
            let queue = event_queue_name(avm_id, topic);
            if let Err(e) = self.amqp_admin.create_user(&queue, &password).await {
                return DispatchOutcome::PermanentError(PermanentError::from(e));
            }
        }

        if let Err(e) = self.amqp_admin.create_user(avm_id, &password).await {
            return DispatchOutcome::PermanentError(PermanentError::from(e));
        }
        if let Err(e) = self.amqp_admin.set_user_permissions("/", avm_id, avm_id).await {
            return DispatchOutcome::PermanentError(PermanentError::from(e));
        }

        let avm = AndroidVm { avm_id: avm_id.to_string() };
        if let Err(e) = avm.update_stack_name(pool, stack_name).await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }

        let image_row = match crate::model::image::lookup(pool, image).await {
            Ok(r) => r,
            Err(e) => return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())),
        };

        let mut params = HashMap::new();
        params.insert("system_image".to_string(), image_row.system_image);
        params.insert("data_image".to_string(), image_row.data_image);
        params.insert("floating_net".to_string(), self.openstack.floating_net.clone());

        let stack_id = match self.heat.stack_create(stack_name, &params, &self.openstack.template).await {
            Ok(id) => id,
            Err(e) => return DispatchOutcome::PermanentError(PermanentError::from(e)),
        };

        let task = Task::AvmContainersCreate {
            avm_id: avm_id.to_string(),
            userid: userid.to_string(),
            stack_name: stack_name.to_string(),
            stack_id,
            amqp_password: password,
            android_version: image_row.android_version,
            vnc_secret: vnc_secret.to_string(),
        };
        if let Err(e) = self.broker.publish(&task, 0).await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }
        DispatchOutcome::Done
    }

    /// `avm_containers_create`: waits for the stack's `instance_ip` output,
    /// then brings up the player container with the environment from
    /// `player_up_envvars` (SPEC_FULL.md §4.4).
    #[allow(clippy::too_many_arguments)]
    pub async fn avm_containers_create(
        &self,
        pool: &SqlitePool,
        avm_id: &str,
        userid: &str,
        stack_name: &str,
        stack_id: &str,
        amqp_password: &str,
        android_version: &str,
        vnc_secret: &str,
    ) -> DispatchOutcome {
        if match AndroidVm::get(pool, avm_id, userid).await {
            Ok(v) => v,
            Err(e) => return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())),
        }
        .is_none()
        {
            return DispatchOutcome::PermanentError(PermanentError::classified(format!(
                "user {userid} has no permission for avm {avm_id}"
            )));
        }

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
        if let Err(e) = avm.set_status(pool, "RUNNING", "").await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }
        DispatchOutcome::Done
    }

    /// `project_container_create`: brings up the project's shared compose
    /// project (media, prjdata) and marks it `READY`.
    pub async fn project_container_create(&self, pool: &SqlitePool, project_id: &str) -> DispatchOutcome {
        use crate::model::project::Project;
        let project = Project { project_id: project_id.to_string() };
        if let Err(e) = project.set_status(pool, "CREATING", "").await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }
        if let Err(e) = self.container.project_up(project_id).await {
            return DispatchOutcome::PermanentError(PermanentError::from(e));
        }
        if let Err(e) = project.set_status(pool, "READY", "").await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }
        DispatchOutcome::Done
    }

    /// `project_container_delete`: tears down the project's compose
    /// project, tolerating it already being gone, then marks `DELETED`.
    pub async fn project_container_delete(&self, pool: &SqlitePool, project_id: &str) -> DispatchOutcome {
        use crate::model::project::Project;
        let project = Project { project_id: project_id.to_string() };
        let _ = self.container.project_down(project_id).await;
        if let Err(e) = project.set_status(pool, "DELETED", "").await {
            return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string()));
        }
        DispatchOutcome::Done
    }

    /// `avm_delete`: tears down containers, closes billing, deletes the
    /// AMQP user (tolerating not-found), removes the event queues, deletes
    /// the Heat stack (tolerating `AvmNotFound`), then marks `DELETED`.
    pub async fn avm_delete(&self, pool: &SqlitePool, avm_id: &str, userid: &str) -> DispatchOutcome {
        if match AndroidVm::get(pool, avm_id, userid).await {
            Ok(v) => v,
            Err(e) => return DispatchOutcome::PermanentError(PermanentError::unclassified(e.to_string())),
        }
        .is_none()
        {
            return DispatchOutcome::PermanentError(PermanentError::classified(format!(
                "user {userid} has no permission for avm {avm_id}"
            )));
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
        DispatchOutcome::Done
    }
}

/// Routes a `Task` to the matching provisioner pipeline; the Campaign
/// Engine handles everything else.
pub async fn handle_avm_task<A, H, C, B>(
    provisioner: &VmProvisioner<A, H, C, B>,
    pool: &SqlitePool,
    task: &Task,
) -> Option<DispatchOutcome>
where
    A: AmqpAdmin,
    H: HeatClient,
    C: ContainerRunner,
    B: TaskBroker,
{
    match task {
        Task::ProjectContainerCreate { project_id } => {
            Some(provisioner.project_container_create(pool, project_id).await)
        }
        Task::ProjectContainerDelete { project_id } => {
            Some(provisioner.project_container_delete(pool, project_id).await)
        }
        Task::AvmCreate { avm_id, userid, image, .. } => {
            let stack_name = stack_name_for(&provisioner.placement.stackprefix, userid, avm_id);
            let vnc_secret = crate::otp::generate_vnc_secret();
            Some(provisioner.avm_create(pool, avm_id, userid, image, &stack_name, &vnc_secret).await)
        }
        Task::AvmContainersCreate {
            avm_id,
            userid,
            stack_name,
            stack_id,
            amqp_password,
            android_version,
            vnc_secret,
        } => Some(
            provisioner
                .avm_containers_create(
                    pool,
                    avm_id,
                    userid,
                    stack_name,
                    stack_id,
                    amqp_password,
                    android_version,
                    vnc_secret,
                )
                .await,
        ),
        Task::AvmDelete { avm_id, userid } => Some(provisioner.avm_delete(pool, avm_id, userid).await),
        _ => None,
    }
}
