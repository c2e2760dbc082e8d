//! Grounded on `original_source/ats/kyaraben/model/camera.py`.

use super::Entity;
use crate::errors::StoreResult;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct CameraRecord {
    pub camera_id: String,
    pub filename: String,
    pub project_id: String,
    pub status: String,
}

pub struct Camera {
    pub camera_id: String,
}

impl Camera {
    pub async fn get(
        pool: &SqlitePool,
        camera_id: &str,
        project_id: &str,
        userid: &str,
    ) -> StoreResult<Option<Self>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM project_camera
              WHERE camera_id = ? AND project_id = ? AND status <> 'DELETED'
                AND project_id IN (SELECT project_id FROM permission_projects WHERE userid = ?)",
        )
        .bind(camera_id)
        .bind(project_id)
        .bind(userid)
        .fetch_optional(pool)
        .await?;
        Ok(row.map(|_| Camera { camera_id: camera_id.to_string() }))
    }

    pub async fn insert(
        pool: &SqlitePool,
        camera_id: &str,
        filename: &str,
        project_id: &str,
    ) -> StoreResult<Self> {
        sqlx::query(
            "INSERT INTO project_camera (camera_id, filename, project_id, status, status_ts, status_reason)
             VALUES (?, ?, ?, 'READY', ?, '')",
        )
        .bind(camera_id)
        .bind(filename)
        .bind(project_id)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(Camera { camera_id: camera_id.to_string() })
    }

    pub async fn list(
        pool: &SqlitePool,
        userid: &str,
        project_id: &str,
    ) -> StoreResult<Vec<CameraRecord>> {
        let rows = sqlx::query_as::<_, CameraRecord>(
            "SELECT camera_id, filename, project_id, status
               FROM project_camera
              WHERE project_id = ? AND status <> 'DELETED'
                AND project_id IN (SELECT project_id FROM permission_projects WHERE userid = ?)",
        )
        .bind(project_id)
        .bind(userid)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl Entity for Camera {
    type Id = String;

    fn id(&self) -> String {
        self.camera_id.clone()
    }

    async fn is_deleted(pool: &SqlitePool, id: &String) -> StoreResult<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM project_camera WHERE camera_id = ? AND status = 'DELETED'")
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(row.is_some())
    }

    async fn set_status(&self, pool: &SqlitePool, status: &str, reason: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE project_camera SET status = ?, status_ts = ?, status_reason = ? WHERE camera_id = ?",
        )
        .bind(status)
        .bind(Utc::now())
        .bind(reason)
        .bind(&self.camera_id)
        .execute(pool)
        .await?;
        Ok(())
    }
}
