//! Entity types and the shared access pattern they all implement.
//!
//! Duck-typed "every model class has is_deleted/set_status" in the original
//! collapses here into one trait (SPEC_FULL.md §9), plus a permission-check
//! combinator (`EntityRef::resolve`) so every `get` uniformly reports absence
//! as not-found rather than forbidden.

pub mod apk;
pub mod avm;
pub mod camera;
pub mod campaign;
pub mod command;
pub mod image;
pub mod project;
pub mod testsource;

use crate::errors::StoreResult;
use async_trait::async_trait;
use sqlx::SqlitePool;

#[async_trait]
pub trait Entity: Sized {
    type Id: Send + Sync + Clone;

    fn id(&self) -> Self::Id;

    async fn is_deleted(pool: &SqlitePool, id: &Self::Id) -> StoreResult<bool>;

    async fn set_status(
        &self,
        pool: &SqlitePool,
        status: &str,
        reason: &str,
    ) -> StoreResult<()>;
}

/// Permission-checked, existence-checked handle resolution. `resolve`
/// returns `Ok(None)` uniformly whether the row is absent, deleted, or owned
/// by someone else — callers must never distinguish "forbidden" from
/// "not found" (SPEC_FULL.md §3).
pub struct EntityRef;

impl EntityRef {
    pub async fn resolve<T, F, Fut>(getter: F) -> StoreResult<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = StoreResult<Option<T>>>,
    {
        getter().await
    }
}

/// `{width, height, dpi, enable_sensors, enable_battery, enable_gps,
/// enable_camera, enable_record, enable_gsm, enable_nfc}`, defaults per
/// `original_source/model/android.py::hwconfig_defaults`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct HwConfig {
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    pub enable_sensors: bool,
    pub enable_battery: bool,
    pub enable_gps: bool,
    pub enable_camera: bool,
    pub enable_record: bool,
    pub enable_gsm: bool,
    pub enable_nfc: bool,
}

impl Default for HwConfig {
    fn default() -> Self {
        HwConfig {
            width: 800,
            height: 600,
            dpi: 160,
            enable_sensors: true,
            enable_battery: true,
            enable_gps: true,
            enable_camera: true,
            enable_record: false,
            enable_gsm: true,
            enable_nfc: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hwconfig_defaults_match_original() {
        let hc = HwConfig::default();
        assert_eq!(hc.width, 800);
        assert_eq!(hc.height, 600);
        assert_eq!(hc.dpi, 160);
        assert!(hc.enable_sensors);
        assert!(hc.enable_battery);
        assert!(hc.enable_gps);
        assert!(hc.enable_camera);
        assert!(!hc.enable_record);
        assert!(hc.enable_gsm);
        assert!(!hc.enable_nfc);
    }
}
