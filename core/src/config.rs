//! Flat, namespaced configuration, loaded from a TOML file with environment
//! overrides. Namespaces mirror the sections in SPEC_FULL.md §6.

use crate::errors::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const ENV_PREFIX: &str = "ORCH_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    pub server: ServerConfig,
    pub amqp: AmqpConfig,
    pub orchestration: PlacementConfig,
    pub openstack: OpenstackConfig,
    pub db: DbConfig,
    pub quota: QuotaConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub media: MediaConfig,
    pub prjdata: PrjdataConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_address: String,
    pub listen_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig { listen_address: "127.0.0.1".to_string(), listen_port: 8084 }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AmqpConfig {
    pub hostname: String,
    pub admin_username: String,
    pub admin_password: String,
}

impl std::fmt::Debug for AmqpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpConfig")
            .field("hostname", &self.hostname)
            .field("admin_username", &self.admin_username)
            .field("admin_password", &"<redacted>")
            .finish()
    }
}

impl Default for AmqpConfig {
    fn default() -> Self {
        AmqpConfig {
            hostname: "127.0.0.1".to_string(),
            admin_username: "guest".to_string(),
            admin_password: "guest".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementConfig {
    pub novnc_host: String,
    #[serde(default)]
    pub stackprefix: String,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        PlacementConfig { novnc_host: String::new(), stackprefix: String::new() }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct OpenstackConfig {
    pub os_auth_url: String,
    pub os_username: String,
    pub os_password: String,
    pub os_tenant_name: String,
    #[serde(default = "default_floating_net")]
    pub floating_net: String,
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub os_cacert: Option<String>,
}

impl std::fmt::Debug for OpenstackConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenstackConfig")
            .field("os_auth_url", &self.os_auth_url)
            .field("os_username", &self.os_username)
            .field("os_password", &"<redacted>")
            .field("os_tenant_name", &self.os_tenant_name)
            .field("floating_net", &self.floating_net)
            .field("template", &self.template)
            .field("insecure", &self.insecure)
            .field("os_cacert", &self.os_cacert)
            .finish()
    }
}

fn default_floating_net() -> String {
    "net04_ext".to_string()
}

fn default_template() -> String {
    "android.yaml".to_string()
}

impl Default for OpenstackConfig {
    fn default() -> Self {
        OpenstackConfig {
            os_auth_url: String::new(),
            os_username: String::new(),
            os_password: String::new(),
            os_tenant_name: String::new(),
            floating_net: default_floating_net(),
            template: default_template(),
            insecure: false,
            os_cacert: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub dsn: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig { dsn: "sqlite://orchestration.db".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_vm_live_max")]
    pub vm_live_max: u32,
    #[serde(default = "default_vm_async_max")]
    pub vm_async_max: u32,
}

fn default_vm_live_max() -> u32 {
    3
}
fn default_vm_async_max() -> u32 {
    1
}

impl Default for QuotaConfig {
    fn default() -> Self {
        QuotaConfig { vm_live_max: default_vm_live_max(), vm_async_max: default_vm_async_max() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_heat_poll_interval")]
    pub heat_poll_interval: u64,
    #[serde(default = "default_docker_host")]
    pub docker_host: String,
    #[serde(default = "default_compose_file")]
    pub compose_file: String,
}

fn default_heat_poll_interval() -> u64 {
    5
}

fn default_docker_host() -> String {
    "unix:///var/run/docker.sock".to_string()
}

fn default_compose_file() -> String {
    "docker-compose.yml".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            heat_poll_interval: default_heat_poll_interval(),
            docker_host: default_docker_host(),
            compose_file: default_compose_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_delay_min")]
    pub delay_min: u64,
    #[serde(default = "default_delay_max")]
    pub delay_max: u64,
    #[serde(default = "default_fail_timeout")]
    pub fail_timeout: u64,
}

fn default_delay_min() -> u64 {
    1
}
fn default_delay_max() -> u64 {
    30
}
fn default_fail_timeout() -> u64 {
    60 * 60 * 24
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            delay_min: default_delay_min(),
            delay_max: default_delay_max(),
            fail_timeout: default_fail_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_tempdir")]
    pub tempdir: PathBuf,
}

fn default_tempdir() -> PathBuf {
    PathBuf::from("/tmp")
}

impl Default for MediaConfig {
    fn default() -> Self {
        MediaConfig { tempdir: default_tempdir() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrjdataConfig {
    #[serde(default = "default_apk_path")]
    pub apk_path: String,
    #[serde(default = "default_camera_path")]
    pub camera_path: String,
}

fn default_apk_path() -> String {
    "/data/project/apk/{apk_id}.apk".to_string()
}
fn default_camera_path() -> String {
    "/data/project/camera/{camera_id}".to_string()
}

impl Default for PrjdataConfig {
    fn default() -> Self {
        PrjdataConfig { apk_path: default_apk_path(), camera_path: default_camera_path() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogConfig {
    #[serde(default)]
    pub jsonformat: bool,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        OrchestrationConfig {
            server: ServerConfig::default(),
            amqp: AmqpConfig::default(),
            orchestration: PlacementConfig::default(),
            openstack: OpenstackConfig::default(),
            db: DbConfig::default(),
            quota: QuotaConfig::default(),
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            media: MediaConfig::default(),
            prjdata: PrjdataConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl OrchestrationConfig {
    pub fn load(path: &str) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read { path: path.to_string(), source: e })?;
        let mut config: OrchestrationConfig = toml::from_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_or_default(path: Option<&str>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(p) => return Self::load(p),
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies `ORCH_NAMESPACE_FIELD` overrides for the handful of secrets
    /// and hosts operators most commonly override without editing the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}DB_DSN")) {
            self.db.dsn = v;
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}AMQP_HOSTNAME")) {
            self.amqp.hostname = v;
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}AMQP_ADMIN_PASSWORD")) {
            self.amqp.admin_password = v;
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}OPENSTACK_OS_PASSWORD")) {
            self.openstack.os_password = v;
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.orchestration.novnc_host.is_empty() {
            return Err(ConfigError::Invalid("orchestration.novnc_host is required".to_string()));
        }
        if self.openstack.os_auth_url.is_empty() {
            return Err(ConfigError::Invalid("openstack.os_auth_url is required".to_string()));
        }
        if self.db.dsn.is_empty() {
            return Err(ConfigError::Invalid("db.dsn is required".to_string()));
        }
        if self.quota.vm_live_max == 0 {
            return Err(ConfigError::Invalid("quota.vm_live_max must be > 0".to_string()));
        }
        if self.retry.delay_min > self.retry.delay_max {
            return Err(ConfigError::Invalid(
                "retry.delay_min must be <= retry.delay_max".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_fails_validation_without_required_fields() {
        let config = OrchestrationConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn fully_populated_config_is_valid() {
        let mut config = OrchestrationConfig::default();
        config.orchestration.novnc_host = "10.0.0.1".to_string();
        config.openstack.os_auth_url = "https://keystone.example/v3".to_string();
        config.db.dsn = "sqlite://test.db".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn retry_delay_bounds_are_validated() {
        let mut config = OrchestrationConfig::default();
        config.orchestration.novnc_host = "10.0.0.1".to_string();
        config.openstack.os_auth_url = "https://keystone.example/v3".to_string();
        config.db.dsn = "sqlite://test.db".to_string();
        config.retry.delay_min = 100;
        config.retry.delay_max = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn quota_defaults_match_spec() {
        let quota = QuotaConfig::default();
        assert_eq!(quota.vm_live_max, 3);
        assert_eq!(quota.vm_async_max, 1);
    }

    #[test]
    fn retry_defaults_match_spec() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_min, 1);
        assert_eq!(retry.delay_max, 30);
        assert_eq!(retry.fail_timeout, 86_400);
    }
}
