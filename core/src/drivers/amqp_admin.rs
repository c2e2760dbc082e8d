//! RabbitMQ management API client, grounded on
//! `original_source/ats/kyaraben/worker/amqp/admin.py` and `queues.py`.

use crate::config::AmqpConfig;
use crate::errors::{DriverError, DriverResult};
use async_trait::async_trait;
use reqwest::Client;

/// Fixed per-AVM event topics; `sensors` alone gets a wildcard routing-key
/// suffix (`original_source/worker/amqp/queues.py::queues_routing`).
pub const EVENT_TOPICS: &[&str] =
    &["sensors", "battery", "gps", "recording", "gsm", "camera", "nfc"];

pub fn event_queue_name(avm_id: &str, topic: &str) -> String {
    format!("android-events.{avm_id}.{topic}")
}

pub fn event_routing_key(avm_id: &str, topic: &str) -> String {
    if topic == "sensors" {
        format!("android-events.{avm_id}.sensors.*")
    } else {
        format!("android-events.{avm_id}.{topic}")
    }
}

#[async_trait]
pub trait AmqpAdmin: Send + Sync {
    async fn create_user(&self, username: &str, password: &str) -> DriverResult<()>;
    async fn delete_user(&self, username: &str) -> DriverResult<()>;
    /// Grants read-only access on `android-events.{avm_id}.*`: `configure`
    /// and `write` are set to the *empty string*, not omitted, which is how
    /// RabbitMQ's permission model expresses "no access" for those verbs.
    async fn set_user_permissions(&self, vhost: &str, username: &str, avm_id: &str) -> DriverResult<()>;
}

#[derive(Clone)]
pub struct HttpAmqpAdmin {
    http: Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpAmqpAdmin {
    pub fn new(config: &AmqpConfig) -> Self {
        HttpAmqpAdmin {
            http: Client::new(),
            base_url: format!("http://{}:15672/api", config.hostname),
            username: config.admin_username.clone(),
            password: config.admin_password.clone(),
        }
    }

    async fn check_status(&self, resp: reqwest::Response, expect: u16) -> DriverResult<()> {
        let status = resp.status().as_u16();
        if status == expect {
            return Ok(());
        }
        let reason = resp.text().await.unwrap_or_default();
        Err(DriverError::AmqpAdmin { status, reason })
    }
}

#[async_trait]
impl AmqpAdmin for HttpAmqpAdmin {
    async fn create_user(&self, username: &str, password: &str) -> DriverResult<()> {
        let resp = self
            .http
            .put(format!("{}/users/{}", self.base_url, username))
            .basic_auth(&self.username, Some(&self.password))
            .json(&serde_json::json!({"password": password, "tags": ""}))
            .send()
            .await?;
        self.check_status(resp, 204).await
    }

    async fn delete_user(&self, username: &str) -> DriverResult<()> {
        let resp = self
            .http
            .delete(format!("{}/users/{}", self.base_url, username))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        self.check_status(resp, 204).await
    }

    async fn set_user_permissions(
        &self,
        vhost: &str,
        username: &str,
        avm_id: &str,
    ) -> DriverResult<()> {
        let read_pattern = format!("android-events.{avm_id}.*");
        let resp = self
            .http
            .put(format!("{}/permissions/{}/{}", self.base_url, vhost, username))
            .basic_auth(&self.username, Some(&self.password))
            .json(&serde_json::json!({"configure": "", "write": "", "read": read_pattern}))
            .send()
            .await?;
        self.check_status(resp, 204).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensors_topic_gets_wildcard_routing_key() {
        assert_eq!(event_routing_key("a1", "sensors"), "android-events.a1.sensors.*");
    }

    #[test]
    fn other_topics_use_plain_routing_key() {
        assert_eq!(event_routing_key("a1", "battery"), "android-events.a1.battery");
    }

    #[test]
    fn seven_fixed_topics() {
        assert_eq!(EVENT_TOPICS.len(), 7);
    }
}
