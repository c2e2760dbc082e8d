//! Grounded on `original_source/ats/kyaraben/model/apk.py`.

use super::Entity;
use crate::errors::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct ApkRecord {
    pub apk_id: String,
    pub filename: String,
    pub project_id: String,
    pub testsource_id: String,
    pub package: String,
    pub status: String,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct ApkDetail {
    pub apk_id: String,
    pub filename: String,
    pub project_id: String,
    pub package: String,
    pub status: String,
    pub status_reason: String,
}

pub struct Apk {
    pub apk_id: String,
}

impl Apk {
    pub async fn get(
        pool: &SqlitePool,
        apk_id: &str,
        project_id: &str,
        userid: &str,
    ) -> StoreResult<Option<Self>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM project_apks
              WHERE apk_id = ? AND project_id = ? AND status <> 'DELETED'
                AND project_id IN (SELECT project_id FROM permission_projects WHERE userid = ?)",
        )
        .bind(apk_id)
        .bind(project_id)
        .bind(userid)
        .fetch_optional(pool)
        .await?;
        Ok(row.map(|_| Apk { apk_id: apk_id.to_string() }))
    }

    /// Mirrors the original's delete-then-insert on re-upload of the same
    /// `apk_id` (e.g. after a testsource recompile).
    pub async fn insert(
        pool: &SqlitePool,
        apk_id: &str,
        filename: &str,
        project_id: &str,
        package: &str,
    ) -> StoreResult<Self> {
        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM project_apks WHERE apk_id = ?")
            .bind(apk_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO project_apks (apk_id, filename, project_id, package, status, status_ts, status_reason)
             VALUES (?, ?, ?, ?, 'READY', ?, '')",
        )
        .bind(apk_id)
        .bind(filename)
        .bind(project_id)
        .bind(package)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Apk { apk_id: apk_id.to_string() })
    }

    pub async fn list(pool: &SqlitePool, userid: &str, project_id: &str) -> StoreResult<Vec<ApkRecord>> {
        let rows = sqlx::query_as::<_, ApkRecord>(
            "SELECT project_apks.apk_id,
                    project_apks.filename,
                    project_apks.project_id,
                    COALESCE(testsources.testsource_id, '') AS testsource_id,
                    COALESCE(project_apks.package, '') AS package,
                    project_apks.status
               FROM project_apks
          LEFT JOIN testsources ON testsources.apk_id = project_apks.apk_id
              WHERE project_apks.project_id = ?
                AND project_apks.status <> 'DELETED'
                AND project_apks.project_id IN (SELECT project_id FROM permission_projects WHERE userid = ?)",
        )
        .bind(project_id)
        .bind(userid)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn select(&self, pool: &SqlitePool) -> StoreResult<ApkDetail> {
        let row = sqlx::query_as::<_, ApkDetail>(
            "SELECT apk_id, filename, project_id, COALESCE(package, '') AS package, status, status_reason
               FROM project_apks WHERE apk_id = ?",
        )
        .bind(&self.apk_id)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        Ok(row)
    }

    pub async fn set_package_name(&self, pool: &SqlitePool, package: &str) -> StoreResult<()> {
        sqlx::query("UPDATE project_apks SET package = ? WHERE apk_id = ?")
            .bind(package)
            .bind(&self.apk_id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Entity for Apk {
    type Id = String;

    fn id(&self) -> String {
        self.apk_id.clone()
    }

    async fn is_deleted(pool: &SqlitePool, id: &String) -> StoreResult<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM project_apks WHERE apk_id = ? AND status = 'DELETED'")
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(row.is_some())
    }

    /// Keyed by `apk_id`, not `command_id` — the original's `set_status_error`
    /// binds this branch's WHERE clause to `command_id` (which is `None` in
    /// this call path), a reproducible bug resolved per the corresponding
    /// Open Question in SPEC_FULL.md §4.3.
    async fn set_status(&self, pool: &SqlitePool, status: &str, reason: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE project_apks SET status = ?, status_ts = ?, status_reason = ? WHERE apk_id = ?",
        )
        .bind(status)
        .bind(Utc::now())
        .bind(reason)
        .bind(&self.apk_id)
        .execute(pool)
        .await?;
        Ok(())
    }
}
