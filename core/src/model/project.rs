//! Grounded on `original_source/ats/kyaraben/model/project.py`.

use super::Entity;
use crate::errors::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct ProjectRecord {
    pub project_id: String,
    pub project_name: String,
    pub status: String,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct ProjectDetail {
    pub project_id: String,
    pub project_name: String,
    pub status: String,
    pub status_ts: chrono::DateTime<Utc>,
    pub status_reason: String,
    pub sum_avms_uptime: i64,
    pub count_avms: i64,
}

pub struct Project {
    pub project_id: String,
}

impl Project {
    /// Permission-gated existence check: returns `None` uniformly for
    /// "doesn't exist" and "not owned/shared with this user".
    pub async fn get(pool: &SqlitePool, project_id: &str, userid: &str) -> StoreResult<Option<Self>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM permission_projects WHERE project_id = ? AND userid = ?",
        )
        .bind(project_id)
        .bind(userid)
        .fetch_optional(pool)
        .await?;

        Ok(row.map(|_| Project { project_id: project_id.to_string() }))
    }

    pub async fn insert(
        pool: &SqlitePool,
        project_id: &str,
        project_name: &str,
        userid: &str,
    ) -> StoreResult<Self> {
        sqlx::query(
            "INSERT INTO projects (project_id, project_name, uid_owner, status, status_ts, status_reason)
             VALUES (?, ?, ?, 'CREATING', ?, '')",
        )
        .bind(project_id)
        .bind(project_name)
        .bind(userid)
        .bind(Utc::now())
        .execute(pool)
        .await?;

        Ok(Project { project_id: project_id.to_string() })
    }

    pub async fn list(pool: &SqlitePool, userid: &str) -> StoreResult<Vec<ProjectRecord>> {
        let rows = sqlx::query_as::<_, ProjectRecord>(
            "SELECT project_id, project_name, status
               FROM projects
              WHERE project_id IN (SELECT project_id FROM permission_projects WHERE userid = ?)",
        )
        .bind(userid)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn select(&self, pool: &SqlitePool) -> StoreResult<ProjectDetail> {
        let row = sqlx::query_as::<_, ProjectDetail>(
            "SELECT projects.project_id,
                    project_name,
                    projects.status,
                    projects.status_ts,
                    projects.status_reason,
                    COALESCE(SUM(avms_uptime.uptime), 0) AS sum_avms_uptime,
                    COUNT(avms_uptime.avm_id) AS count_avms
               FROM projects
          LEFT JOIN avms ON avms.project_id = projects.project_id
          LEFT JOIN avms_uptime ON avms_uptime.avm_id = avms.avm_id
              WHERE projects.project_id = ?
                AND projects.status <> 'DELETED'
           GROUP BY projects.project_id",
        )
        .bind(&self.project_id)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        Ok(row)
    }

    pub async fn update(&self, pool: &SqlitePool, project_name: &str) -> StoreResult<()> {
        sqlx::query("UPDATE projects SET project_name = ? WHERE project_id = ?")
            .bind(project_name)
            .bind(&self.project_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// A project is active (cannot be deleted) if it owns live AVMs or has
    /// campaigns that will still create VMs.
    pub async fn is_active(&self, pool: &SqlitePool) -> StoreResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM avms WHERE project_id = ? AND status <> 'DELETED'
             UNION ALL
             SELECT 1 FROM campaigns WHERE project_id = ? AND status IN ('QUEUED', 'RUNNING')",
        )
        .bind(&self.project_id)
        .bind(&self.project_id)
        .fetch_optional(pool)
        .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl Entity for Project {
    type Id = String;

    fn id(&self) -> String {
        self.project_id.clone()
    }

    async fn is_deleted(pool: &SqlitePool, id: &String) -> StoreResult<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM projects WHERE project_id = ? AND status = 'DELETED'")
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(row.is_some())
    }

    async fn set_status(&self, pool: &SqlitePool, status: &str, reason: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE projects SET status = ?, status_ts = ?, status_reason = ? WHERE project_id = ?",
        )
        .bind(status)
        .bind(Utc::now())
        .bind(reason)
        .bind(&self.project_id)
        .execute(pool)
        .await?;
        Ok(())
    }
}
