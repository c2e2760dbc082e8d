//! Task Broker: durable publish/consume over a topic exchange supporting
//! delayed delivery. Grounded on
//! `original_source/ats/kyaraben/tasks.py::TaskBroker`.
//!
//! The duck-typed kwargs payload from the original collapses into one
//! discriminated enum, `Task`, with one variant per stable task name
//! (SPEC_FULL.md §9) — the registry the dispatcher consults is a function
//! table keyed by the enum's discriminant, not a string.

use crate::errors::{BrokerError, BrokerResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const EXCHANGE_MAIN: &str = "orchestration";
pub const EXCHANGE_RETRY: &str = "orchestration.retry";
pub const EXCHANGE_FAILED: &str = "orchestration.failed";
pub const QUEUE_MAIN: &str = "orchestration";
pub const QUEUE_RETRY: &str = "orchestration.retry";
pub const QUEUE_FAILED: &str = "orchestration.failed";
pub const HEADER_TASK: &str = "x-kyaraben-task";
pub const HEADER_RETRIES: &str = "x-kyaraben-retries";
pub const HEADER_DELAY: &str = "x-delay";

/// One variant per stable task name from SPEC_FULL.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "task", content = "payload")]
pub enum Task {
    ProjectContainerCreate { project_id: String },
    ProjectContainerDelete { project_id: String },
    AvmCreate { avm_id: String, project_id: String, userid: String, image: String },
    AvmContainersCreate {
        avm_id: String,
        userid: String,
        stack_name: String,
        stack_id: String,
        amqp_password: String,
        android_version: String,
        vnc_secret: String,
    },
    AvmDelete { avm_id: String, userid: String },
    AvmMonkey {
        avm_id: String,
        userid: String,
        command_id: String,
        packages: Vec<String>,
        event_count: u32,
        throttle: Option<u32>,
    },
    AvmTestRun { avm_id: String, userid: String, command_id: String, package: String },
    CameraUpload { camera_id: String, project_id: String, userid: String, filename: String, tmppath: String },
    CameraDelete { camera_id: String, project_id: String, userid: String },
    ApkUpload { apk_id: String, project_id: String, userid: String, filename: String, tmppath: String },
    ApkDelete { apk_id: String, project_id: String, userid: String },
    ApkInstall { avm_id: String, userid: String, project_id: String, apk_id: String, command_id: String },
    TestsourceCompile { testsource_id: String, project_id: String, userid: String },
    CampaignRun { campaign_id: String, userid: String, project_id: String },
    CampaignAvmCreate { campaign_id: String, testrun_id: String, userid: String, project_id: String },
    CampaignContainersCreate {
        campaign_id: String,
        testrun_id: String,
        avm_id: String,
        userid: String,
        project_id: String,
        amqp_password: String,
        android_version: String,
        stack_name: String,
        stack_id: String,
        vnc_secret: String,
    },
    CampaignRuntest { campaign_id: String, testrun_id: String, avm_id: String },
    CampaignDelete { campaign_id: String },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::ProjectContainerCreate { .. } => "project_container_create",
            Task::ProjectContainerDelete { .. } => "project_container_delete",
            Task::AvmCreate { .. } => "avm_create",
            Task::AvmContainersCreate { .. } => "avm_containers_create",
            Task::AvmDelete { .. } => "avm_delete",
            Task::AvmMonkey { .. } => "avm_monkey",
            Task::AvmTestRun { .. } => "avm_test_run",
            Task::CameraUpload { .. } => "camera_upload",
            Task::CameraDelete { .. } => "camera_delete",
            Task::ApkUpload { .. } => "apk_upload",
            Task::ApkDelete { .. } => "apk_delete",
            Task::ApkInstall { .. } => "apk_install",
            Task::TestsourceCompile { .. } => "testsource_compile",
            Task::CampaignRun { .. } => "campaign_run",
            Task::CampaignAvmCreate { .. } => "campaign_avm_create",
            Task::CampaignContainersCreate { .. } => "campaign_containers_create",
            Task::CampaignRuntest { .. } => "campaign_runtest",
            Task::CampaignDelete { .. } => "campaign_delete",
        }
    }

    /// IDs embedded in this task's payload among `{project_id, avm_id,
    /// apk_id, camera_id, command_id}`, used by the obsolescence check and
    /// the error-projection priority order (SPEC_FULL.md §4.3).
    pub fn entity_ids(&self) -> EntityIds {
        match self {
            Task::ProjectContainerCreate { project_id }
            | Task::ProjectContainerDelete { project_id } => {
                EntityIds { project_id: Some(project_id.clone()), ..Default::default() }
            }
            Task::AvmCreate { avm_id, project_id, .. } => EntityIds {
                avm_id: Some(avm_id.clone()),
                project_id: Some(project_id.clone()),
                ..Default::default()
            },
            Task::AvmContainersCreate { avm_id, .. } | Task::AvmDelete { avm_id, .. } => {
                EntityIds { avm_id: Some(avm_id.clone()), ..Default::default() }
            }
            Task::AvmMonkey { avm_id, command_id, .. } | Task::AvmTestRun { avm_id, command_id, .. } => {
                EntityIds {
                    avm_id: Some(avm_id.clone()),
                    command_id: Some(command_id.clone()),
                    ..Default::default()
                }
            }
            Task::CameraUpload { camera_id, project_id, .. } => EntityIds {
                camera_id: Some(camera_id.clone()),
                project_id: Some(project_id.clone()),
                ..Default::default()
            },
            Task::CameraDelete { camera_id, project_id, .. } => EntityIds {
                camera_id: Some(camera_id.clone()),
                project_id: Some(project_id.clone()),
                ..Default::default()
            },
            Task::ApkUpload { apk_id, project_id, .. } => EntityIds {
                apk_id: Some(apk_id.clone()),
                project_id: Some(project_id.clone()),
                ..Default::default()
            },
            Task::ApkDelete { apk_id, project_id, .. } => EntityIds {
                apk_id: Some(apk_id.clone()),
                project_id: Some(project_id.clone()),
                ..Default::default()
            },
            Task::ApkInstall { avm_id, apk_id, command_id, .. } => EntityIds {
                avm_id: Some(avm_id.clone()),
                apk_id: Some(apk_id.clone()),
                command_id: Some(command_id.clone()),
                ..Default::default()
            },
            Task::TestsourceCompile { project_id, .. } => {
                EntityIds { project_id: Some(project_id.clone()), ..Default::default() }
            }
            Task::CampaignRun { campaign_id, .. }
            | Task::CampaignAvmCreate { campaign_id, .. }
            | Task::CampaignDelete { campaign_id, .. } => {
                EntityIds { campaign_id: Some(campaign_id.clone()), ..Default::default() }
            }
            Task::CampaignContainersCreate { campaign_id, avm_id, .. } => EntityIds {
                campaign_id: Some(campaign_id.clone()),
                avm_id: Some(avm_id.clone()),
                ..Default::default()
            },
            Task::CampaignRuntest { campaign_id, avm_id, .. } => EntityIds {
                campaign_id: Some(campaign_id.clone()),
                avm_id: Some(avm_id.clone()),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct EntityIds {
    pub project_id: Option<String>,
    pub avm_id: Option<String>,
    pub apk_id: Option<String>,
    pub camera_id: Option<String>,
    pub command_id: Option<String>,
    pub campaign_id: Option<String>,
}

/// An envelope as handed to the dispatcher: the decoded task plus the
/// broker metadata it needs to ack/nack/republish.
pub struct Delivery {
    pub task: Task,
    pub message_id: String,
    pub timestamp: i64,
    pub retries: u32,
    pub ack_token: AckToken,
}

/// Opaque handle back to the broker implementation for acking this
/// specific delivery; kept separate from `Task` so handlers never see it.
pub enum AckToken {
    Amqp { delivery_tag: u64 },
    Memory { id: u64 },
}

#[async_trait]
pub trait TaskBroker: Send + Sync {
    async fn publish(&self, task: &Task, delay_ms: u64) -> BrokerResult<()>;

    /// Republishes a message the Retry Collector popped off `orchestration.retry`,
    /// carrying its identity forward: `message_id`, original `timestamp`, and
    /// `retries` (SPEC_FULL.md §4.2, "preserving message_id, timestamp, ...,
    /// headers with x-delay/x-kyaraben-retries updated"). Distinct from
    /// [`publish`](Self::publish), which always mints a fresh message for a
    /// brand-new task.
    async fn publish_retry(
        &self,
        task: &Task,
        delay_ms: u64,
        message_id: &str,
        timestamp: i64,
        retries: u32,
    ) -> BrokerResult<()>;

    async fn ack(&self, token: AckToken) -> BrokerResult<()>;
    async fn nack_to_dead_letter(&self, token: AckToken) -> BrokerResult<()>;
}

#[derive(Clone)]
pub struct AmqpTaskBroker {
    channel: Channel,
}

impl AmqpTaskBroker {
    pub async fn connect(url: &str) -> BrokerResult<Self> {
        let conn = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = conn.create_channel().await?;
        AmqpTaskBroker::declare_topology(&channel).await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;
        Ok(AmqpTaskBroker { channel })
    }

    async fn declare_topology(channel: &Channel) -> BrokerResult<()> {
        let mut delayed_args = FieldTable::default();
        delayed_args
            .insert(ShortString::from("x-delayed-type"), AMQPValue::LongString("direct".into()));

        channel
            .exchange_declare(
                EXCHANGE_MAIN,
                ExchangeKind::Custom("x-delayed-message".to_string()),
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                delayed_args,
            )
            .await?;

        let mut main_queue_args = FieldTable::default();
        main_queue_args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(EXCHANGE_RETRY.into()),
        );
        channel
            .queue_declare(
                QUEUE_MAIN,
                QueueDeclareOptions { durable: true, ..Default::default() },
                main_queue_args,
            )
            .await?;
        channel
            .queue_bind(
                QUEUE_MAIN,
                EXCHANGE_MAIN,
                EXCHANGE_MAIN,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        channel
            .exchange_declare(
                EXCHANGE_RETRY,
                ExchangeKind::Direct,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        let mut retry_queue_args = FieldTable::default();
        retry_queue_args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(EXCHANGE_FAILED.into()),
        );
        channel
            .queue_declare(
                QUEUE_RETRY,
                QueueDeclareOptions { durable: true, ..Default::default() },
                retry_queue_args,
            )
            .await?;
        channel
            .queue_bind(
                QUEUE_RETRY,
                EXCHANGE_RETRY,
                EXCHANGE_RETRY,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        channel
            .exchange_declare(
                EXCHANGE_FAILED,
                ExchangeKind::Direct,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_declare(
                QUEUE_FAILED,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                QUEUE_FAILED,
                EXCHANGE_FAILED,
                EXCHANGE_FAILED,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    /// Starts consuming `QUEUE_MAIN` and decodes each message into a
    /// [`Delivery`] on a background task, forwarding through an unbounded
    /// channel; a message that fails to decode as a [`Task`] is nacked
    /// without requeue rather than handed to the dispatcher.
    pub async fn consume(&self) -> BrokerResult<tokio::sync::mpsc::UnboundedReceiver<Delivery>> {
        self.consume_queue(QUEUE_MAIN, "orchestration-worker").await
    }

    /// Same decoding as [`consume`](Self::consume) but against
    /// `QUEUE_RETRY`, for the Retry Collector (SPEC_FULL.md §2) rather than
    /// the main dispatcher.
    pub async fn consume_retry(&self) -> BrokerResult<tokio::sync::mpsc::UnboundedReceiver<Delivery>> {
        self.consume_queue(QUEUE_RETRY, "orchestration-retry-collector").await
    }

    async fn consume_queue(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> BrokerResult<tokio::sync::mpsc::UnboundedReceiver<Delivery>> {
        let mut consumer = self
            .channel
            .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await?;
        let channel = self.channel.clone();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(Ok(delivery)) = consumer.next().await {
                let delivery_tag = delivery.delivery_tag;
                let task: Task = match serde_json::from_slice(&delivery.data) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::error!(error = %e, "undecodable task payload, dropping");
                        let _ = channel
                            .basic_nack(delivery_tag, BasicNackOptions { requeue: false, ..Default::default() })
                            .await;
                        continue;
                    }
                };
                let message_id = delivery
                    .properties
                    .message_id()
                    .as_ref()
                    .map(|s| s.to_string())
                    .unwrap_or_default();
                let timestamp = delivery.properties.timestamp().unwrap_or(0) as i64;
                let retries = delivery
                    .properties
                    .headers()
                    .as_ref()
                    .and_then(|h| h.inner().get(HEADER_RETRIES))
                    .and_then(|v| match v {
                        AMQPValue::LongUInt(n) => Some(*n),
                        _ => None,
                    })
                    .unwrap_or(0);

                let envelope = Delivery {
                    task,
                    message_id,
                    timestamp,
                    retries,
                    ack_token: AckToken::Amqp { delivery_tag },
                };
                if tx.send(envelope).is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }
}

impl AmqpTaskBroker {
    /// Shared by [`publish`](TaskBroker::publish) (fresh identity, `retries =
    /// 0`) and [`publish_retry`](TaskBroker::publish_retry) (identity carried
    /// forward from the delivery being reinjected).
    async fn publish_with_identity(
        &self,
        task: &Task,
        delay_ms: u64,
        message_id: &str,
        timestamp: i64,
        retries: u32,
    ) -> BrokerResult<()> {
        let payload = serde_json::to_vec(task)?;

        let mut headers = FieldTable::default();
        headers.insert(ShortString::from(HEADER_TASK), AMQPValue::LongString(task.name().into()));
        headers.insert(ShortString::from(HEADER_RETRIES), AMQPValue::LongUInt(retries));
        if delay_ms > 0 {
            headers.insert(ShortString::from(HEADER_DELAY), AMQPValue::LongUInt(delay_ms as u32));
        }

        let props = BasicProperties::default()
            .with_message_id(message_id.into())
            .with_timestamp(timestamp as u64)
            .with_content_type("application/json".into())
            .with_delivery_mode(2)
            .with_headers(headers);

        self.channel
            .basic_publish(
                EXCHANGE_MAIN,
                EXCHANGE_MAIN,
                BasicPublishOptions::default(),
                &payload,
                props,
            )
            .await?
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskBroker for AmqpTaskBroker {
    async fn publish(&self, task: &Task, delay_ms: u64) -> BrokerResult<()> {
        let message_id = Uuid::new_v4().simple().to_string();
        let timestamp = chrono::Utc::now().timestamp();
        self.publish_with_identity(task, delay_ms, &message_id, timestamp, 0).await
    }

    async fn publish_retry(
        &self,
        task: &Task,
        delay_ms: u64,
        message_id: &str,
        timestamp: i64,
        retries: u32,
    ) -> BrokerResult<()> {
        self.publish_with_identity(task, delay_ms, message_id, timestamp, retries).await
    }

    async fn ack(&self, token: AckToken) -> BrokerResult<()> {
        if let AckToken::Amqp { delivery_tag } = token {
            self.channel.basic_ack(delivery_tag, BasicAckOptions::default()).await?;
        }
        Ok(())
    }

    async fn nack_to_dead_letter(&self, token: AckToken) -> BrokerResult<()> {
        if let AckToken::Amqp { delivery_tag } = token {
            self.channel
                .basic_nack(delivery_tag, BasicNackOptions { requeue: false, ..Default::default() })
                .await?;
        }
        Ok(())
    }
}

/// In-memory broker backed by a channel plus a delay-aware scheduling task,
/// used to exercise the dispatcher end-to-end without a live RabbitMQ.
pub struct MemoryTaskBroker {
    inner: Arc<Mutex<MemoryBrokerState>>,
    tx: tokio::sync::mpsc::UnboundedSender<Delivery>,
}

struct MemoryBrokerState {
    next_id: u64,
    published: HashMap<String, (Task, u32)>,
}

impl MemoryTaskBroker {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (
            MemoryTaskBroker {
                inner: Arc::new(Mutex::new(MemoryBrokerState {
                    next_id: 0,
                    published: HashMap::new(),
                })),
                tx,
            },
            rx,
        )
    }
}

impl MemoryTaskBroker {
    async fn publish_with_identity(
        &self,
        task: &Task,
        delay_ms: u64,
        message_id: String,
        timestamp: i64,
        retries: u32,
    ) -> BrokerResult<()> {
        let mut state = self.inner.lock().await;
        let id = state.next_id;
        state.next_id += 1;
        state.published.insert(message_id.clone(), (task.clone(), retries));
        drop(state);

        let delivery = Delivery {
            task: task.clone(),
            message_id,
            timestamp,
            retries,
            ack_token: AckToken::Memory { id },
        };

        let tx = self.tx.clone();
        if delay_ms == 0 {
            let _ = tx.send(delivery);
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                let _ = tx.send(delivery);
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TaskBroker for MemoryTaskBroker {
    async fn publish(&self, task: &Task, delay_ms: u64) -> BrokerResult<()> {
        let id = {
            let state = self.inner.lock().await;
            state.next_id
        };
        let message_id = format!("mem-{id}");
        self.publish_with_identity(task, delay_ms, message_id, chrono::Utc::now().timestamp(), 0)
            .await
    }

    async fn publish_retry(
        &self,
        task: &Task,
        delay_ms: u64,
        message_id: &str,
        timestamp: i64,
        retries: u32,
    ) -> BrokerResult<()> {
        self.publish_with_identity(task, delay_ms, message_id.to_string(), timestamp, retries).await
    }

    async fn ack(&self, _token: AckToken) -> BrokerResult<()> {
        Ok(())
    }

    async fn nack_to_dead_letter(&self, _token: AckToken) -> BrokerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_names_match_spec_list() {
        let t = Task::AvmCreate {
            avm_id: "a".into(),
            project_id: "p".into(),
            userid: "u".into(),
            image: "i".into(),
        };
        assert_eq!(t.name(), "avm_create");
    }

    #[test]
    fn entity_ids_extract_avm_and_project() {
        let t = Task::AvmCreate {
            avm_id: "a1".into(),
            project_id: "p1".into(),
            userid: "u".into(),
            image: "i".into(),
        };
        let ids = t.entity_ids();
        assert_eq!(ids.avm_id.as_deref(), Some("a1"));
        assert_eq!(ids.project_id.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn memory_broker_delivers_published_task() {
        let (broker, mut rx) = MemoryTaskBroker::new();
        let task = Task::AvmDelete { avm_id: "a1".into(), userid: "u".into() };
        broker.publish(&task, 0).await.unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.task.name(), "avm_delete");
    }
}
