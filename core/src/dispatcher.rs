//! Task Dispatcher: binds a logging span, checks obsolescence, invokes the
//! handler for a task, and projects the outcome onto the right entity.
//! Grounded on `original_source/ats/kyaraben/worker/main.py`.

use crate::broker::{Delivery, EntityIds, Task, TaskBroker};
use crate::errors::{DispatchError, DispatchOutcome, DispatchResult, PermanentError};
use crate::model::apk::Apk;
use crate::model::avm::AndroidVm;
use crate::model::camera::Camera;
use crate::model::campaign::Campaign;
use crate::model::command::Command;
use crate::model::project::Project;
use crate::model::Entity;
use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::Instrument;

/// One handler per stable task name, invoked after the obsolescence check
/// passes. Implemented by the VM Provisioner and Campaign Engine.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, pool: &SqlitePool, task: &Task) -> DispatchOutcome;
}

pub struct Dispatcher<B: TaskBroker> {
    pool: SqlitePool,
    broker: B,
    handler: std::sync::Arc<dyn TaskHandler>,
    heat_poll_interval_ms: u64,
}

impl<B: TaskBroker> Dispatcher<B> {
    /// `heat_poll_interval` is `worker.heat_poll_interval` (seconds, SPEC_FULL.md
    /// §6) — the republish delay for a `Retry` outcome (spec.md §4.3: "delay
    /// = worker.heat_poll_interval · 1000 ms").
    pub fn new(
        pool: SqlitePool,
        broker: B,
        handler: std::sync::Arc<dyn TaskHandler>,
        heat_poll_interval: u64,
    ) -> Self {
        Dispatcher { pool, broker, handler, heat_poll_interval_ms: heat_poll_interval * 1000 }
    }

    /// Step sequence from SPEC_FULL.md §4.3: bind span, obsolescence check,
    /// invoke handler, project outcome, ack/nack.
    pub async fn dispatch(&self, delivery: Delivery) -> DispatchResult<()> {
        let span = tracing::info_span!(
            "dispatch",
            task = delivery.task.name(),
            message_id = %delivery.message_id,
            retries = delivery.retries,
        );
        self.dispatch_inner(delivery).instrument(span).await
    }

    async fn dispatch_inner(&self, delivery: Delivery) -> DispatchResult<()> {
        let ids = delivery.task.entity_ids();

        if is_obsolete(&self.pool, &ids).await? {
            tracing::info!("task obsolete, skipping");
            self.broker.ack(delivery.ack_token).await?;
            return Ok(());
        }

        let outcome = self.handler.handle(&self.pool, &delivery.task).await;

        match outcome {
            DispatchOutcome::Done => {
                self.broker.ack(delivery.ack_token).await?;
            }
            DispatchOutcome::Retry(reason) => {
                tracing::debug!(reason = %reason, "task requested retry delay");
                self.broker.ack(delivery.ack_token).await?;
                self.broker.publish(&delivery.task, self.heat_poll_interval_ms).await?;
            }
            DispatchOutcome::PermanentError(err) => {
                self.project_error(&ids, &err).await?;
                if err.classified || project_target(&ids).is_some() {
                    self.broker.ack(delivery.ack_token).await?;
                } else {
                    tracing::error!(reason = %err.reason, "unclassified error with no projectable entity");
                    self.broker.nack_to_dead_letter(delivery.ack_token).await?;
                }
            }
        }
        Ok(())
    }

    /// Error-projection priority order from SPEC_FULL.md §4.3:
    /// `command_id → avm_commands, apk_id → project_apks,
    /// camera_id → project_camera, avm_id → avms, project_id → projects`.
    async fn project_error(&self, ids: &EntityIds, err: &PermanentError) -> DispatchResult<()> {
        let status = "ERROR";
        if let Some(command_id) = &ids.command_id {
            let command = Command { command_id: command_id.clone() };
            command.set_status(&self.pool, status, &err.reason).await?;
        } else if let Some(apk_id) = &ids.apk_id {
            let apk = Apk { apk_id: apk_id.clone() };
            apk.set_status(&self.pool, status, &err.reason).await?;
        } else if let Some(camera_id) = &ids.camera_id {
            let camera = Camera { camera_id: camera_id.clone() };
            camera.set_status(&self.pool, status, &err.reason).await?;
        } else if let Some(avm_id) = &ids.avm_id {
            let avm = AndroidVm { avm_id: avm_id.clone() };
            avm.set_status(&self.pool, status, &err.reason).await?;
        } else if let Some(project_id) = &ids.project_id {
            let project = Project { project_id: project_id.clone() };
            project.set_status(&self.pool, status, &err.reason).await?;
        }
        Ok(())
    }
}

fn project_target(ids: &EntityIds) -> Option<&str> {
    if ids.command_id.is_some() {
        Some("avm_commands")
    } else if ids.apk_id.is_some() {
        Some("project_apks")
    } else if ids.camera_id.is_some() {
        Some("project_camera")
    } else if ids.avm_id.is_some() {
        Some("avms")
    } else if ids.project_id.is_some() {
        Some("projects")
    } else {
        None
    }
}

/// An AVM/project/apk/camera id present in the payload that now points at a
/// `DELETED` row makes the task a no-op (`command_id` is deliberately
/// excluded: commands have no deleted state, per `Command::is_deleted`).
async fn is_obsolete(pool: &SqlitePool, ids: &EntityIds) -> Result<bool, DispatchError> {
    if let Some(avm_id) = &ids.avm_id {
        if AndroidVm::is_deleted(pool, avm_id).await? {
            return Ok(true);
        }
    }
    if let Some(project_id) = &ids.project_id {
        if Project::is_deleted(pool, project_id).await? {
            return Ok(true);
        }
    }
    if let Some(apk_id) = &ids.apk_id {
        if Apk::is_deleted(pool, apk_id).await? {
            return Ok(true);
        }
    }
    if let Some(camera_id) = &ids.camera_id {
        if Camera::is_deleted(pool, camera_id).await? {
            return Ok(true);
        }
    }
    if let Some(campaign_id) = &ids.campaign_id {
        if Campaign::is_deleted(pool, campaign_id).await? {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_target_follows_priority_order() {
        let ids = EntityIds {
            command_id: Some("c1".into()),
            apk_id: Some("a1".into()),
            ..Default::default()
        };
        assert_eq!(project_target(&ids), Some("avm_commands"));
    }

    #[test]
    fn project_target_falls_back_to_project() {
        let ids = EntityIds { project_id: Some("p1".into()), ..Default::default() };
        assert_eq!(project_target(&ids), Some("projects"));
    }

    #[test]
    fn project_target_none_when_payload_has_no_ids() {
        let ids = EntityIds::default();
        assert_eq!(project_target(&ids), None);
    }

    async fn setup_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE avms (avm_id TEXT PRIMARY KEY, status TEXT, status_ts TEXT, status_reason TEXT)",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn obsolescence_check_skips_deleted_avm() {
        let pool = setup_pool().await;
        sqlx::query("INSERT INTO avms (avm_id, status) VALUES ('a1', 'DELETED')")
            .execute(&pool)
            .await
            .unwrap();
        let ids = EntityIds { avm_id: Some("a1".into()), ..Default::default() };
        assert!(is_obsolete(&pool, &ids).await.unwrap());
    }

    #[tokio::test]
    async fn obsolescence_check_passes_live_avm() {
        let pool = setup_pool().await;
        sqlx::query("INSERT INTO avms (avm_id, status) VALUES ('a1', 'RUNNING')")
            .execute(&pool)
            .await
            .unwrap();
        let ids = EntityIds { avm_id: Some("a1".into()), ..Default::default() };
        assert!(!is_obsolete(&pool, &ids).await.unwrap());
    }
}
