//! Grounded on `original_source/ats/kyaraben/model/testsource.py`.
//! Testsource content is the one entity that is physically deleted rather
//! than logically flagged (SPEC_FULL.md §3, "Lifecycle & ownership").

use super::Entity;
use crate::errors::StoreResult;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct TestsourceRecord {
    pub testsource_id: String,
    pub filename: String,
    pub project_id: String,
    pub apk_id: String,
    pub status: String,
    pub apk_status: String,
    pub apk_status_reason: String,
}

pub struct Testsource {
    pub testsource_id: String,
}

impl Testsource {
    pub async fn get(
        pool: &SqlitePool,
        testsource_id: &str,
        project_id: &str,
        userid: &str,
    ) -> StoreResult<Option<Self>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM testsources
              WHERE testsource_id = ? AND project_id = ? AND status <> 'DELETED'
                AND project_id IN (SELECT project_id FROM permission_projects WHERE userid = ?)",
        )
        .bind(testsource_id)
        .bind(project_id)
        .bind(userid)
        .fetch_optional(pool)
        .await?;
        Ok(row.map(|_| Testsource { testsource_id: testsource_id.to_string() }))
    }

    pub async fn insert(
        pool: &SqlitePool,
        testsource_id: &str,
        filename: &str,
        project_id: &str,
        content: &str,
    ) -> StoreResult<Self> {
        sqlx::query(
            "INSERT INTO testsources (testsource_id, filename, project_id, content, status, status_ts, status_reason)
             VALUES (?, ?, ?, ?, 'QUEUED', ?, '')",
        )
        .bind(testsource_id)
        .bind(filename)
        .bind(project_id)
        .bind(content)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(Testsource { testsource_id: testsource_id.to_string() })
    }

    pub async fn update_apk(&self, pool: &SqlitePool, apk_id: &str) -> StoreResult<()> {
        sqlx::query("UPDATE testsources SET apk_id = ? WHERE testsource_id = ?")
            .bind(apk_id)
            .bind(&self.testsource_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn update(&self, pool: &SqlitePool, filename: &str, content: &str) -> StoreResult<()> {
        sqlx::query("UPDATE testsources SET filename = ?, content = ? WHERE testsource_id = ?")
            .bind(filename)
            .bind(content)
            .bind(&self.testsource_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn list(
        pool: &SqlitePool,
        userid: &str,
        project_id: &str,
    ) -> StoreResult<Vec<TestsourceRecord>> {
        let rows = sqlx::query_as::<_, TestsourceRecord>(
            "SELECT testsources.testsource_id,
                    testsources.filename,
                    testsources.project_id,
                    COALESCE(testsources.apk_id, '') AS apk_id,
                    testsources.status,
                    COALESCE(project_apks.status, '') AS apk_status,
                    COALESCE(project_apks.status_reason, '') AS apk_status_reason
               FROM testsources
          LEFT JOIN project_apks ON project_apks.apk_id = testsources.apk_id
              WHERE testsources.project_id = ? AND testsources.status <> 'DELETED'
                AND testsources.project_id IN (SELECT project_id FROM permission_projects WHERE userid = ?)",
        )
        .bind(project_id)
        .bind(userid)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn content(&self, pool: &SqlitePool) -> StoreResult<String> {
        let (content,): (String,) =
            sqlx::query_as("SELECT content FROM testsources WHERE testsource_id = ?")
                .bind(&self.testsource_id)
                .fetch_one(pool)
                .await?;
        Ok(content)
    }

    pub async fn apk_id(&self, pool: &SqlitePool) -> StoreResult<Option<String>> {
        let (apk_id,): (Option<String>,) =
            sqlx::query_as("SELECT apk_id FROM testsources WHERE testsource_id = ?")
                .bind(&self.testsource_id)
                .fetch_one(pool)
                .await?;
        Ok(apk_id)
    }

    pub async fn delete(&self, pool: &SqlitePool) -> StoreResult<()> {
        sqlx::query("DELETE FROM testsources WHERE testsource_id = ?")
            .bind(&self.testsource_id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Entity for Testsource {
    type Id = String;

    fn id(&self) -> String {
        self.testsource_id.clone()
    }

    async fn is_deleted(pool: &SqlitePool, id: &String) -> StoreResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM testsources WHERE testsource_id = ? AND status = 'DELETED'",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(row.is_some())
    }

    async fn set_status(&self, pool: &SqlitePool, status: &str, reason: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE testsources SET status = ?, status_ts = ?, status_reason = ? WHERE testsource_id = ?",
        )
        .bind(status)
        .bind(Utc::now())
        .bind(reason)
        .bind(&self.testsource_id)
        .execute(pool)
        .await?;
        Ok(())
    }
}
