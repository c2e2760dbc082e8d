//! Heat client, grounded on
//! `original_source/ats/kyaraben/worker/openstack/heatclient.py` and
//! `exceptions.py`. Regex-based error classification is encapsulated here —
//! the only place in the codebase that inspects Heat's error text
//! (SPEC_FULL.md §9).

use crate::drivers::openstack::OpenstackGateway;
use crate::errors::{DriverError, DriverResult};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

fn image_not_found_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"The Image (.*) could not be found").unwrap())
}

/// Returns the image name captured from a Heat error body if it matches the
/// "image could not be found" pattern.
pub fn classify_stack_create_error(error: &Value) -> Option<String> {
    let message = error.get("message")?.as_str()?;
    image_not_found_re().captures(message).map(|c| c[1].to_string())
}

#[async_trait]
pub trait HeatClient: Send + Sync {
    async fn stack_create(
        &self,
        stack_name: &str,
        stack_params: &HashMap<String, String>,
        template: &str,
    ) -> DriverResult<String>;

    async fn stack_output(
        &self,
        stack_name: &str,
        stack_id: &str,
    ) -> DriverResult<Option<HashMap<String, String>>>;

    async fn stack_delete(&self, stack_name: &str) -> DriverResult<()>;
}

#[derive(Clone)]
pub struct HttpHeatClient {
    gateway: std::sync::Arc<OpenstackGateway>,
}

impl HttpHeatClient {
    pub fn new(gateway: std::sync::Arc<OpenstackGateway>) -> Self {
        HttpHeatClient { gateway }
    }
}

#[async_trait]
impl HeatClient for HttpHeatClient {
    async fn stack_create(
        &self,
        stack_name: &str,
        stack_params: &HashMap<String, String>,
        template: &str,
    ) -> DriverResult<String> {
        let endpoint = self.gateway.endpoint("heat")?;
        let body = serde_json::json!({
            "stack_name": stack_name,
            "template": template,
            "parameters": stack_params,
        });
        let resp = self
            .gateway
            .http()
            .post(format!("{endpoint}/stacks"))
            .header("X-Auth-Token", self.gateway.token())
            .json(&body)
            .send()
            .await?;

        if resp.status() != reqwest::StatusCode::CREATED {
            let js: Value = resp.json().await.unwrap_or(Value::Null);
            if let Some(error) = js.get("error") {
                if let Some(image) = classify_stack_create_error(error) {
                    return Err(DriverError::AvmImageNotFound(image));
                }
            }
            return Err(DriverError::Heat(format!("stack create failed: {js}")));
        }

        let js: Value = resp.json().await?;
        let id = js["stack"]["id"].as_str().unwrap_or_default().to_string();
        Ok(id)
    }

    async fn stack_output(
        &self,
        stack_name: &str,
        stack_id: &str,
    ) -> DriverResult<Option<HashMap<String, String>>> {
        let endpoint = self.gateway.endpoint("heat")?;
        let resp = self
            .gateway
            .http()
            .get(format!("{endpoint}/stacks/{stack_name}/{stack_id}"))
            .header("X-Auth-Token", self.gateway.token())
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DriverError::AvmNotFound(stack_name.to_string()));
        }

        let js: Value = resp.json().await?;
        let outputs = js["stack"]["outputs"].as_array();
        match outputs {
            None => Ok(None),
            Some(outputs) => {
                let mut map = HashMap::new();
                for output in outputs {
                    if let (Some(k), Some(v)) =
                        (output["output_key"].as_str(), output["output_value"].as_str())
                    {
                        map.insert(k.to_string(), v.to_string());
                    }
                }
                Ok(Some(map))
            }
        }
    }

    async fn stack_delete(&self, stack_name: &str) -> DriverResult<()> {
        let endpoint = self.gateway.endpoint("heat")?;
        let lookup = self
            .gateway
            .http()
            .get(format!("{endpoint}/stacks/{stack_name}"))
            .header("X-Auth-Token", self.gateway.token())
            .send()
            .await?;

        if lookup.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DriverError::AvmNotFound(stack_name.to_string()));
        }
        let js: Value = lookup.json().await?;
        let stack_id = js["stack"]["id"].as_str().unwrap_or_default().to_string();

        let resp = self
            .gateway
            .http()
            .delete(format!("{endpoint}/stacks/{stack_name}/{stack_id}"))
            .header("X-Auth-Token", self.gateway.token())
            .send()
            .await?;

        match resp.status() {
            reqwest::StatusCode::NOT_FOUND => Err(DriverError::AvmNotFound(stack_name.to_string())),
            reqwest::StatusCode::NO_CONTENT => Ok(()),
            status => Err(DriverError::Heat(format!("unexpected status {status}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_image_not_found_message() {
        let error = serde_json::json!({"message": "The Image ghost could not be found"});
        assert_eq!(classify_stack_create_error(&error), Some("ghost".to_string()));
    }

    #[test]
    fn does_not_classify_unrelated_message() {
        let error = serde_json::json!({"message": "quota exceeded"});
        assert_eq!(classify_stack_create_error(&error), None);
    }
}
