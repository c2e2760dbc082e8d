//! Grounded on `original_source/ats/kyaraben/model/campaign.py`. Campaign,
//! Testrun, Testrun-APK, and Testrun-Package are modeled with forward IDs
//! only (SPEC_FULL.md §9): no object references cross a task boundary,
//! rollups are plain SQL joins.

use super::{Entity, HwConfig};
use crate::errors::StoreResult;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashMap;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct TestSpec {
    pub image: String,
    #[serde(default)]
    pub hwconfig: Option<HwConfig>,
    pub apks: Vec<String>,
    #[serde(default)]
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct CampaignRecord {
    pub campaign_id: String,
    pub campaign_name: String,
    pub project_id: String,
    pub status: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Testrun {
    pub testrun_id: String,
    pub campaign_id: String,
    pub image: String,
    pub hwconfig: HwConfig,
    pub apk_ids: Vec<String>,
    pub packages: Vec<String>,
}

pub struct Campaign {
    pub campaign_id: String,
}

impl Campaign {
    pub async fn get(
        pool: &SqlitePool,
        campaign_id: &str,
        project_id: &str,
        userid: &str,
    ) -> StoreResult<Option<Self>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM campaigns
              WHERE campaign_id = ? AND project_id = ? AND status <> 'DELETED'
                AND project_id IN (SELECT project_id FROM permission_projects WHERE userid = ?)",
        )
        .bind(campaign_id)
        .bind(project_id)
        .bind(userid)
        .fetch_optional(pool)
        .await?;
        Ok(row.map(|_| Campaign { campaign_id: campaign_id.to_string() }))
    }

    pub async fn insert(
        pool: &SqlitePool,
        campaign_id: &str,
        campaign_name: &str,
        project_id: &str,
        tests: &[TestSpec],
    ) -> StoreResult<Self> {
        let mut tx = pool.begin().await?;
        sqlx::query(
            "INSERT INTO campaigns (campaign_id, campaign_name, project_id, status, status_ts, status_reason)
             VALUES (?, ?, ?, 'QUEUED', ?, '')",
        )
        .bind(campaign_id)
        .bind(campaign_name)
        .bind(project_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        for test in tests {
            let hwconfig = test.hwconfig.clone().unwrap_or_default();
            let hwconfig_json = serde_json::to_string(&hwconfig).unwrap_or_default();
            let testrun_id = uuid::Uuid::new_v4().simple().to_string();
            sqlx::query(
                "INSERT INTO testruns (testrun_id, campaign_id, image, hwconfig) VALUES (?, ?, ?, ?)",
            )
            .bind(&testrun_id)
            .bind(campaign_id)
            .bind(&test.image)
            .bind(&hwconfig_json)
            .execute(&mut *tx)
            .await?;

            for (idx, apk_id) in test.apks.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO testrun_apks (testrun_id, apk_id, install_order) VALUES (?, ?, ?)",
                )
                .bind(&testrun_id)
                .bind(apk_id)
                .bind((idx + 1) as i64)
                .execute(&mut *tx)
                .await?;
            }

            for package in &test.packages {
                sqlx::query("INSERT INTO testrun_packages (testrun_id, package) VALUES (?, ?)")
                    .bind(&testrun_id)
                    .bind(package)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(Campaign { campaign_id: campaign_id.to_string() })
    }

    pub async fn list(
        pool: &SqlitePool,
        userid: &str,
        project_id: &str,
    ) -> StoreResult<Vec<CampaignRecord>> {
        let rows = sqlx::query_as::<_, CampaignRecord>(
            "SELECT campaign_id, campaign_name, project_id, status
               FROM campaigns
              WHERE project_id = ? AND status <> 'DELETED'
                AND project_id IN (SELECT project_id FROM permission_projects WHERE userid = ?)",
        )
        .bind(project_id)
        .bind(userid)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Per-status command counts for this campaign's testruns, with a
    /// missing command row (install or instrument not yet recorded) counted
    /// as `QUEUED`, matching the original's `command_statuses`.
    pub async fn command_statuses(&self, pool: &SqlitePool) -> StoreResult<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT COALESCE(avm_commands.status, 'QUEUED') AS status, COUNT(1) AS count
               FROM campaigns
          LEFT JOIN testruns ON testruns.campaign_id = campaigns.campaign_id
          LEFT JOIN testrun_packages ON testrun_packages.testrun_id = testruns.testrun_id
          LEFT JOIN testrun_apks ON testrun_apks.testrun_id = testruns.testrun_id
          LEFT JOIN avm_commands ON avm_commands.command_id = testrun_packages.command_id
                                  OR avm_commands.command_id = testrun_apks.command_id
              WHERE campaigns.campaign_id = ?
           GROUP BY avm_commands.status",
        )
        .bind(&self.campaign_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    /// `READY` iff every command belonging to this campaign's testruns is
    /// `READY` (SPEC_FULL.md §3 invariant).
    pub async fn is_ready(&self, pool: &SqlitePool) -> StoreResult<bool> {
        let statuses = self.command_statuses(pool).await?;
        Ok(statuses.keys().len() == 1 && statuses.contains_key("READY"))
    }

    pub async fn progress(&self, pool: &SqlitePool) -> StoreResult<f64> {
        let statuses = self.command_statuses(pool).await?;
        let total: i64 = statuses.values().sum();
        if total == 0 {
            return Ok(0.0);
        }
        let ready = statuses.get("READY").copied().unwrap_or(0);
        Ok(ready as f64 / total as f64)
    }

    pub async fn testruns(&self, pool: &SqlitePool) -> StoreResult<Vec<Testrun>> {
        #[derive(sqlx::FromRow)]
        struct TestrunRow {
            testrun_id: String,
            image: String,
            hwconfig: String,
        }
        let rows: Vec<TestrunRow> = sqlx::query_as(
            "SELECT testrun_id, image, hwconfig FROM testruns WHERE campaign_id = ?",
        )
        .bind(&self.campaign_id)
        .fetch_all(pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let apk_ids: Vec<(String,)> = sqlx::query_as(
                "SELECT apk_id FROM testrun_apks WHERE testrun_id = ? ORDER BY install_order",
            )
            .bind(&row.testrun_id)
            .fetch_all(pool)
            .await?;
            let packages: Vec<(String,)> =
                sqlx::query_as("SELECT package FROM testrun_packages WHERE testrun_id = ?")
                    .bind(&row.testrun_id)
                    .fetch_all(pool)
                    .await?;
            out.push(Testrun {
                testrun_id: row.testrun_id,
                campaign_id: self.campaign_id.clone(),
                image: row.image,
                hwconfig: serde_json::from_str(&row.hwconfig).unwrap_or_default(),
                apk_ids: apk_ids.into_iter().map(|(id,)| id).collect(),
                packages: packages.into_iter().map(|(p,)| p).collect(),
            });
        }
        Ok(out)
    }

    /// Links a freshly-inserted Command to the testrun-apk row it was
    /// created for, so `command_statuses` can roll it up.
    pub async fn link_apk_command(
        pool: &SqlitePool,
        testrun_id: &str,
        apk_id: &str,
        command_id: &str,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE testrun_apks SET command_id = ? WHERE testrun_id = ? AND apk_id = ?")
            .bind(command_id)
            .bind(testrun_id)
            .bind(apk_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Same for a testrun-package row.
    pub async fn link_package_command(
        pool: &SqlitePool,
        testrun_id: &str,
        package: &str,
        command_id: &str,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE testrun_packages SET command_id = ? WHERE testrun_id = ? AND package = ?")
            .bind(command_id)
            .bind(testrun_id)
            .bind(package)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Persists an instrumentation package discovered on the VM (empty
    /// `packages` fallback, SPEC_FULL.md §4.5) so it rolls up into
    /// `command_statuses` the same as a declared one.
    pub async fn add_discovered_package(
        pool: &SqlitePool,
        testrun_id: &str,
        package: &str,
    ) -> StoreResult<()> {
        sqlx::query("INSERT INTO testrun_packages (testrun_id, package) VALUES (?, ?)")
            .bind(testrun_id)
            .bind(package)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// AVM IDs still live (not `DELETED`) for this campaign's testruns, used
    /// by `campaign_delete`'s teardown fan-out.
    pub async fn live_avm_ids(&self, pool: &SqlitePool) -> StoreResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT avms.avm_id
               FROM avms
               JOIN testruns ON testruns.testrun_id = avms.testrun_id
              WHERE testruns.campaign_id = ? AND avms.status <> 'DELETED'",
        )
        .bind(&self.campaign_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait]
impl Entity for Campaign {
    type Id = String;

    fn id(&self) -> String {
        self.campaign_id.clone()
    }

    async fn is_deleted(pool: &SqlitePool, id: &String) -> StoreResult<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM campaigns WHERE campaign_id = ? AND status = 'DELETED'")
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(row.is_some())
    }

    async fn set_status(&self, pool: &SqlitePool, status: &str, reason: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE campaigns SET status = ?, status_ts = ?, status_reason = ? WHERE campaign_id = ?",
        )
        .bind(status)
        .bind(Utc::now())
        .bind(reason)
        .bind(&self.campaign_id)
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_zero_for_empty_status_map() {
        let statuses: HashMap<String, i64> = HashMap::new();
        let total: i64 = statuses.values().sum();
        assert_eq!(total, 0);
    }
}
