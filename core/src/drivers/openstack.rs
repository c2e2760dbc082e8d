//! OpenStack Keystone authentication and service catalog lookup.
//!
//! `original_source` carries two gateway implementations that shadow each
//! other; the second never calls `get_catalog` and so never populates
//! endpoints, silently breaking every subsequent Heat call. This
//! implementation follows the first (catalog-fetching) one, resolving the
//! Open Question in SPEC_FULL.md §4.7 in its favor.

use crate::config::OpenstackConfig;
use crate::errors::{DriverError, DriverResult};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::RwLock;

pub struct OpenstackGateway {
    http: Client,
    auth_url: String,
    username: String,
    password: String,
    tenant_name: String,
    token: RwLock<String>,
    endpoints: RwLock<HashMap<String, String>>,
}

impl OpenstackGateway {
    pub fn new(config: &OpenstackConfig) -> DriverResult<Self> {
        let mut builder = Client::builder();
        if config.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(OpenstackGateway {
            http: builder.build()?,
            auth_url: config.os_auth_url.clone(),
            username: config.os_username.clone(),
            password: config.os_password.clone(),
            tenant_name: config.os_tenant_name.clone(),
            token: RwLock::new(String::new()),
            endpoints: RwLock::new(HashMap::new()),
        })
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn token(&self) -> String {
        self.token.read().unwrap().clone()
    }

    pub fn endpoint(&self, service_type: &str) -> DriverResult<String> {
        self.endpoints
            .read()
            .unwrap()
            .get(service_type)
            .cloned()
            .ok_or_else(|| DriverError::MissingEndpoint(service_type.to_string()))
    }

    /// Requests a scoped Keystone token, then fetches and caches the service
    /// catalog so `endpoint()` can resolve `heat` (and any other service)
    /// without a second round trip per call.
    pub async fn authenticate(&self) -> DriverResult<()> {
        let body = serde_json::json!({
            "auth": {
                "tenantName": self.tenant_name,
                "passwordCredentials": {
                    "username": self.username,
                    "password": self.password,
                }
            }
        });

        let resp = self.http.post(format!("{}/tokens", self.auth_url)).json(&body).send().await?;
        let js: serde_json::Value = resp.json().await?;

        let token = js["access"]["token"]["id"].as_str().unwrap_or_default().to_string();
        *self.token.write().unwrap() = token;

        let catalog = js["access"]["serviceCatalog"].as_array().cloned().unwrap_or_default();
        let mut endpoints = HashMap::new();
        for entry in catalog {
            let service_type = entry["type"].as_str().unwrap_or_default().to_string();
            if let Some(url) = entry["endpoints"]
                .as_array()
                .and_then(|eps| eps.first())
                .and_then(|ep| ep["publicURL"].as_str())
            {
                endpoints.insert(service_type, url.to_string());
            }
        }
        *self.endpoints.write().unwrap() = endpoints;
        Ok(())
    }
}
