//! Grounded on `original_source/ats/kyaraben/model/android.py`.

use super::{Entity, HwConfig};
use crate::errors::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use sqlx::SqlitePool;

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct AvmRecord {
    pub avm_id: String,
    pub avm_name: String,
    pub project_id: String,
    pub status: String,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct AvmDetail {
    pub avm_id: String,
    pub avm_name: String,
    pub project_id: String,
    pub image: String,
    pub status: String,
    pub status_reason: String,
    pub stack_name: Option<String>,
    pub testrun_id: Option<String>,
}

#[derive(Default)]
pub struct QuotaCount {
    pub live_current: i64,
    pub async_current: i64,
}

pub struct AndroidVm {
    pub avm_id: String,
}

/// `petname`-style two-word name, e.g. `curious-otter`, used when the
/// caller does not supply an `avm_name` (original uses `petname.Generate`).
fn generate_avm_name() -> String {
    const ADJECTIVES: &[&str] =
        &["curious", "swift", "quiet", "bold", "lucky", "steady", "bright", "calm"];
    const NOUNS: &[&str] = &["otter", "falcon", "badger", "heron", "lynx", "marten", "osprey", "newt"];
    let mut rng = rand::thread_rng();
    let adj = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    format!("{adj}-{noun}")
}

impl AndroidVm {
    pub async fn get(pool: &SqlitePool, avm_id: &str, userid: &str) -> StoreResult<Option<Self>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM permission_avms WHERE avm_id = ? AND userid = ?",
        )
        .bind(avm_id)
        .bind(userid)
        .fetch_optional(pool)
        .await?;
        Ok(row.map(|_| AndroidVm { avm_id: avm_id.to_string() }))
    }

    /// Inserts the AVM row and its AVM-OTP row in the same transaction,
    /// enforcing the "exactly one OTP row per AVM, created atomically"
    /// invariant (SPEC_FULL.md §3) rather than as a separate follow-up step.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        pool: &SqlitePool,
        avm_id: &str,
        avm_name: Option<&str>,
        uid_owner: &str,
        project_id: &str,
        image: &str,
        hwconfig: &HwConfig,
        vnc_secret: &str,
        testrun_id: Option<&str>,
    ) -> StoreResult<Self> {
        let avm_name = avm_name.map(String::from).unwrap_or_else(generate_avm_name);
        let hwconfig_json = serde_json::to_string(hwconfig)
            .map_err(|e| StoreError::Invariant(e.to_string()))?;

        let mut tx = pool.begin().await?;
        sqlx::query(
            "INSERT INTO avms (avm_id, avm_name, uid_owner, project_id, image, hwconfig,
                               status, status_ts, status_reason, ts_created, testrun_id)
             VALUES (?, ?, ?, ?, ?, ?, 'CREATING', ?, '', ?, ?)",
        )
        .bind(avm_id)
        .bind(&avm_name)
        .bind(uid_owner)
        .bind(project_id)
        .bind(image)
        .bind(&hwconfig_json)
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(testrun_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO avmotp (avm_id, vnc_secret) VALUES (?, ?)")
            .bind(avm_id)
            .bind(vnc_secret)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(AndroidVm { avm_id: avm_id.to_string() })
    }

    pub async fn list(
        pool: &SqlitePool,
        userid: &str,
        project_id: &str,
    ) -> StoreResult<Vec<AvmRecord>> {
        let rows = sqlx::query_as::<_, AvmRecord>(
            "SELECT avms.avm_id, avms.avm_name, avms.project_id, avms.status
               FROM avms
              WHERE avms.project_id = ? AND avms.status <> 'DELETED'
                AND avms.avm_id IN (SELECT avm_id FROM permission_avms WHERE userid = ?)",
        )
        .bind(project_id)
        .bind(userid)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn select(&self, pool: &SqlitePool) -> StoreResult<AvmDetail> {
        let row = sqlx::query_as::<_, AvmDetail>(
            "SELECT avm_id, avm_name, project_id, image, status, status_reason, stack_name, testrun_id
               FROM avms WHERE avm_id = ?",
        )
        .bind(&self.avm_id)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        Ok(row)
    }

    pub async fn get_stack_name(&self, pool: &SqlitePool) -> StoreResult<Option<String>> {
        let (stack_name,): (Option<String>,) =
            sqlx::query_as("SELECT stack_name FROM avms WHERE avm_id = ?")
                .bind(&self.avm_id)
                .fetch_one(pool)
                .await?;
        Ok(stack_name)
    }

    pub async fn get_project_id(&self, pool: &SqlitePool) -> StoreResult<String> {
        let (project_id,): (String,) =
            sqlx::query_as("SELECT project_id FROM avms WHERE avm_id = ?")
                .bind(&self.avm_id)
                .fetch_one(pool)
                .await?;
        Ok(project_id)
    }

    pub async fn get_owner(&self, pool: &SqlitePool) -> StoreResult<String> {
        let (uid_owner,): (String,) =
            sqlx::query_as("SELECT uid_owner FROM avms WHERE avm_id = ?")
                .bind(&self.avm_id)
                .fetch_one(pool)
                .await?;
        Ok(uid_owner)
    }

    /// Write-once: a no-op if `stack_name` is already set, enforcing the
    /// immutability invariant (SPEC_FULL.md §3) at the store layer rather
    /// than leaving it to caller discipline, as the original does.
    pub async fn update_stack_name(&self, pool: &SqlitePool, stack_name: &str) -> StoreResult<()> {
        sqlx::query("UPDATE avms SET stack_name = ? WHERE avm_id = ? AND stack_name IS NULL")
            .bind(stack_name)
            .bind(&self.avm_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn update(&self, pool: &SqlitePool, avm_name: &str) -> StoreResult<()> {
        sqlx::query("UPDATE avms SET avm_name = ? WHERE avm_id = ?")
            .bind(avm_name)
            .bind(&self.avm_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn count(pool: &SqlitePool, uid_owner: &str) -> StoreResult<QuotaCount> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT live_current, async_current FROM quota_usage WHERE uid_owner = ?",
        )
        .bind(uid_owner)
        .fetch_optional(pool)
        .await?;
        Ok(match row {
            Some((live_current, async_current)) => QuotaCount { live_current, async_current },
            None => QuotaCount::default(),
        })
    }

    pub async fn start_billing(&self, pool: &SqlitePool) -> StoreResult<()> {
        let exists: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM avms_billing WHERE avm_id = ? AND ts_stopped IS NULL",
        )
        .bind(&self.avm_id)
        .fetch_optional(pool)
        .await?;
        if exists.is_none() {
            sqlx::query("INSERT INTO avms_billing (avm_id, ts_started) VALUES (?, ?)")
                .bind(&self.avm_id)
                .bind(Utc::now())
                .execute(pool)
                .await?;
        }
        Ok(())
    }

    pub async fn stop_billing(&self, pool: &SqlitePool) -> StoreResult<()> {
        sqlx::query(
            "UPDATE avms_billing SET ts_stopped = ? WHERE avm_id = ? AND ts_stopped IS NULL",
        )
        .bind(Utc::now())
        .bind(&self.avm_id)
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Entity for AndroidVm {
    type Id = String;

    fn id(&self) -> String {
        self.avm_id.clone()
    }

    async fn is_deleted(pool: &SqlitePool, id: &String) -> StoreResult<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM avms WHERE avm_id = ? AND status = 'DELETED'")
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(row.is_some())
    }

    async fn set_status(&self, pool: &SqlitePool, status: &str, reason: &str) -> StoreResult<()> {
        sqlx::query("UPDATE avms SET status = ?, status_ts = ?, status_reason = ? WHERE avm_id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(reason)
            .bind(&self.avm_id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_name_has_two_hyphenated_words() {
        let name = generate_avm_name();
        assert_eq!(name.split('-').count(), 2);
    }
}
