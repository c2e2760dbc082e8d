//! Combines the VM Provisioner and Campaign Engine behind one
//! [`TaskHandler`], the shape the Task Dispatcher expects. Grounded on
//! `original_source/ats/kyaraben/worker/main.py`'s single task-name
//! dispatch table spanning both pipelines.

use async_trait::async_trait;
use orchestration_core::broker::{Task, TaskBroker};
use orchestration_core::campaign_engine::{self, CampaignEngine};
use orchestration_core::command_engine::{self, CommandEngine};
use orchestration_core::dispatcher::TaskHandler;
use orchestration_core::drivers::amqp_admin::AmqpAdmin;
use orchestration_core::drivers::container::ContainerRunner;
use orchestration_core::drivers::heat::HeatClient;
use orchestration_core::errors::{DispatchOutcome, PermanentError};
use orchestration_core::provisioner::{self, VmProvisioner};
use sqlx::SqlitePool;

pub struct CombinedHandler<B, C, A, H> {
    provisioner: VmProvisioner<A, H, C, B>,
    campaign: CampaignEngine<B, C, A, H>,
    command: CommandEngine<C>,
}

impl<B, C, A, H> CombinedHandler<B, C, A, H> {
    pub fn new(
        provisioner: VmProvisioner<A, H, C, B>,
        campaign: CampaignEngine<B, C, A, H>,
        command: CommandEngine<C>,
    ) -> Self {
        CombinedHandler { provisioner, campaign, command }
    }
}

#[async_trait]
impl<B, C, A, H> TaskHandler for CombinedHandler<B, C, A, H>
where
    B: TaskBroker + Send + Sync,
    C: ContainerRunner + Send + Sync,
    A: AmqpAdmin + Send + Sync,
    H: HeatClient + Send + Sync,
{
    async fn handle(&self, pool: &SqlitePool, task: &Task) -> DispatchOutcome {
        if let Some(outcome) = provisioner::handle_avm_task(&self.provisioner, pool, task).await {
            return outcome;
        }
        if let Some(outcome) = campaign_engine::handle_campaign_task(&self.campaign, pool, task).await {
            return outcome;
        }
        if let Some(outcome) = command_engine::handle_command_task(&self.command, pool, task).await {
            return outcome;
        }
        DispatchOutcome::PermanentError(PermanentError::unclassified(format!(
            "no handler registered for task {}",
            task.name()
        )))
    }
}
