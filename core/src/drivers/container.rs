//! Container runner, grounded on `original_source/ats/kyaraben/docker.py`
//! and `original_source/ats/kyaraben/worker/compose.py`. A surface-only
//! contract (SPEC_FULL.md §4.7): the real implementation shells out to
//! `docker`/`docker-compose`; tests substitute a fake.

use crate::drivers::process::{aiorun, RunOptions};
use crate::errors::DriverResult;
use crate::model::HwConfig;
use async_trait::async_trait;
use std::collections::HashMap;

#[async_trait]
pub trait ContainerRunner: Send + Sync {
    async fn project_up(&self, project_id: &str) -> DriverResult<()>;
    async fn project_down(&self, project_id: &str) -> DriverResult<()>;

    #[allow(clippy::too_many_arguments)]
    async fn player_up(
        &self,
        project_id: &str,
        avm_id: &str,
        instance_ip: &str,
        hwconfig: &HwConfig,
        amqp_host: &str,
        amqp_user: &str,
        amqp_password: &str,
        android_version: &str,
        vnc_secret: &str,
    ) -> DriverResult<()>;

    async fn player_down(&self, avm_id: &str, project_id: &str) -> DriverResult<()>;

    /// Executes `argv` against the named container, returning CRLF-
    /// normalised stdout/stderr and the exit status.
    async fn exec(&self, container: &str, argv: &[&str]) -> DriverResult<(i32, String, String)>;

    /// Like [`exec`](Self::exec) but feeds `stdin_bytes` to the process's
    /// stdin first, e.g. `camera_upload`'s `video_create.sh` pipe.
    async fn exec_with_stdin(
        &self,
        container: &str,
        argv: &[&str],
        stdin_bytes: &[u8],
    ) -> DriverResult<(i32, String, String)>;

    /// Stages a file between two containers through a host temp directory.
    async fn cp(
        &self,
        from_container: &str,
        from_file: &str,
        to_container: &str,
        to_file: &str,
    ) -> DriverResult<()>;

    /// Copies a file straight from the host filesystem into a container,
    /// e.g. `apk_upload` staging the uploaded APK (original's `docker cp
    /// tmppath container:apk_path`, no intermediate staging needed).
    async fn cp_from_host(&self, host_path: &str, to_container: &str, to_file: &str) -> DriverResult<()>;
}

/// Environment variables passed to the `run-player.yml` compose project,
/// mirroring `original_source/worker/compose.py::player_up` exactly.
#[allow(clippy::too_many_arguments)]
pub fn player_up_envvars(
    project_id: &str,
    avm_id: &str,
    instance_ip: &str,
    hwconfig: &HwConfig,
    amqp_host: &str,
    amqp_user: &str,
    amqp_password: &str,
    android_version: &str,
    vnc_secret: &str,
) -> HashMap<String, String> {
    let max_dim = hwconfig.width.max(hwconfig.height);
    let mut env = HashMap::new();
    env.insert("AIC_AVM_PREFIX".into(), format!("{avm_id}_"));
    env.insert("AIC_PROJECT_PREFIX".into(), format!("{project_id}_"));
    env.insert("AIC_PLAYER_VM_ID".into(), avm_id.to_string());
    env.insert("AIC_PLAYER_VM_HOST".into(), instance_ip.to_string());
    env.insert("AIC_PLAYER_AMQP_HOST".into(), amqp_host.to_string());
    env.insert("AIC_PLAYER_AMQP_USERNAME".into(), amqp_user.to_string());
    env.insert("AIC_PLAYER_AMQP_PASSWORD".into(), amqp_password.to_string());
    env.insert("AIC_PLAYER_WIDTH".into(), hwconfig.width.to_string());
    env.insert("AIC_PLAYER_HEIGHT".into(), hwconfig.height.to_string());
    env.insert("AIC_PLAYER_MAX_DIMENSION".into(), max_dim.to_string());
    env.insert("AIC_PLAYER_DPI".into(), hwconfig.dpi.to_string());
    env.insert("AIC_PLAYER_VNC_SECRET".into(), vnc_secret.to_string());
    env.insert("AIC_PLAYER_ENABLE_SENSORS".into(), hwconfig.enable_sensors.to_string());
    env.insert("AIC_PLAYER_ENABLE_BATTERY".into(), hwconfig.enable_battery.to_string());
    env.insert("AIC_PLAYER_ENABLE_GPS".into(), hwconfig.enable_gps.to_string());
    env.insert("AIC_PLAYER_ENABLE_CAMERA".into(), hwconfig.enable_camera.to_string());
    env.insert("AIC_PLAYER_ENABLE_RECORD".into(), hwconfig.enable_record.to_string());
    env.insert("AIC_PLAYER_ENABLE_GSM".into(), hwconfig.enable_gsm.to_string());
    env.insert("AIC_PLAYER_ENABLE_NFC".into(), hwconfig.enable_nfc.to_string());
    env.insert("AIC_PLAYER_ANDROID_VERSION".into(), android_version.to_string());
    env.insert("AIC_PLAYER_PATH_RECORD".into(), "/data/avm/log/".to_string());
    env
}

/// `docker compose`-backed `ContainerRunner`, grounded in
/// `original_source/ats/kyaraben/docker.py`/`compose.py`: every invocation
/// goes through [`aiorun`] as argv, never a shell string.
#[derive(Clone)]
pub struct ComposeContainerRunner {
    pub docker_host: String,
    pub compose_file: String,
}

impl ComposeContainerRunner {
    fn env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("DOCKER_HOST".to_string(), self.docker_host.clone());
        env
    }
}

#[async_trait]
impl ContainerRunner for ComposeContainerRunner {
    async fn project_up(&self, project_id: &str) -> DriverResult<()> {
        aiorun(
            &["docker-compose", "-f", &self.compose_file, "-p", project_id, "up", "-d"],
            RunOptions { env: Some(self.env()), ..Default::default() },
        )
        .await?;
        Ok(())
    }

    async fn project_down(&self, project_id: &str) -> DriverResult<()> {
        aiorun(
            &["docker-compose", "-f", &self.compose_file, "-p", project_id, "down"],
            RunOptions { env: Some(self.env()), ignore_errors: true, ..Default::default() },
        )
        .await?;
        Ok(())
    }

    async fn player_up(
        &self,
        project_id: &str,
        avm_id: &str,
        instance_ip: &str,
        hwconfig: &HwConfig,
        amqp_host: &str,
        amqp_user: &str,
        amqp_password: &str,
        android_version: &str,
        vnc_secret: &str,
    ) -> DriverResult<()> {
        let mut env = player_up_envvars(
            project_id,
            avm_id,
            instance_ip,
            hwconfig,
            amqp_host,
            amqp_user,
            amqp_password,
            android_version,
            vnc_secret,
        );
        env.insert("DOCKER_HOST".to_string(), self.docker_host.clone());
        aiorun(
            &["docker-compose", "-f", "run-player.yml", "-p", avm_id, "up", "-d"],
            RunOptions { env: Some(env), ..Default::default() },
        )
        .await?;
        Ok(())
    }

    async fn player_down(&self, avm_id: &str, _project_id: &str) -> DriverResult<()> {
        aiorun(
            &["docker-compose", "-f", "run-player.yml", "-p", avm_id, "down"],
            RunOptions { env: Some(self.env()), ignore_errors: true, ..Default::default() },
        )
        .await?;
        Ok(())
    }

    async fn exec(&self, container: &str, argv: &[&str]) -> DriverResult<(i32, String, String)> {
        let mut full = vec!["docker", "exec", container];
        full.extend_from_slice(argv);
        let wrapped = aiorun(&full, RunOptions { env: Some(self.env()), strip: true, ..Default::default() }).await?;
        Ok((wrapped.returncode.unwrap_or(-1), wrapped.stdout().to_string(), wrapped.stderr().to_string()))
    }

    async fn exec_with_stdin(
        &self,
        container: &str,
        argv: &[&str],
        stdin_bytes: &[u8],
    ) -> DriverResult<(i32, String, String)> {
        let mut full = vec!["docker", "exec", "-i", container];
        full.extend_from_slice(argv);
        let wrapped = aiorun(
            &full,
            RunOptions { env: Some(self.env()), strip: true, stdin_bytes: Some(stdin_bytes), ..Default::default() },
        )
        .await?;
        Ok((wrapped.returncode.unwrap_or(-1), wrapped.stdout().to_string(), wrapped.stderr().to_string()))
    }

    async fn cp(
        &self,
        from_container: &str,
        from_file: &str,
        to_container: &str,
        to_file: &str,
    ) -> DriverResult<()> {
        let tmp = tempfile::NamedTempFile::new()
            .map_err(|e| crate::errors::DriverError::Process(vec!["docker".into(), "cp".into()], None, e.to_string()))?;
        let staged = tmp.path().to_string_lossy().to_string();
        aiorun(
            &["docker", "cp", &format!("{from_container}:{from_file}"), &staged],
            RunOptions { env: Some(self.env()), ..Default::default() },
        )
        .await?;
        aiorun(
            &["docker", "cp", &staged, &format!("{to_container}:{to_file}")],
            RunOptions { env: Some(self.env()), ..Default::default() },
        )
        .await?;
        Ok(())
    }

    async fn cp_from_host(&self, host_path: &str, to_container: &str, to_file: &str) -> DriverResult<()> {
        aiorun(
            &["docker", "cp", host_path, &format!("{to_container}:{to_file}")],
            RunOptions { env: Some(self.env()), ..Default::default() },
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_dimension_is_larger_of_width_height() {
        let mut hc = HwConfig::default();
        hc.width = 1080;
        hc.height = 600;
        let env = player_up_envvars("p1", "a1", "10.0.0.5", &hc, "amqp", "u", "pw", "9", "secret");
        assert_eq!(env.get("AIC_PLAYER_MAX_DIMENSION").unwrap(), "1080");
    }
}
