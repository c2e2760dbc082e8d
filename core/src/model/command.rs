//! Grounded on `original_source/ats/kyaraben/model/command.py`. Commands are
//! intentionally excluded from the obsolescence check (SPEC_FULL.md §4.3):
//! they have no `DELETED` status, so `Entity::is_deleted` always returns
//! `false` and the dispatcher never consults it for this type.

use super::Entity;
use crate::errors::StoreResult;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct CommandDetail {
    pub command_id: String,
    pub avm_id: String,
    pub status: String,
    pub proc_returncode: Option<i64>,
    pub proc_stdout: String,
    pub proc_stderr: String,
}

pub struct Command {
    pub command_id: String,
}

impl Command {
    pub async fn insert(pool: &SqlitePool, command_id: &str, avm_id: &str, command: &str) -> StoreResult<Self> {
        sqlx::query(
            "INSERT INTO avm_commands (command_id, avm_id, ts_request, command, proc_stdout, proc_stderr, status, status_reason)
             VALUES (?, ?, ?, ?, '', '', 'QUEUED', '')",
        )
        .bind(command_id)
        .bind(avm_id)
        .bind(Utc::now())
        .bind(command)
        .execute(pool)
        .await?;
        Ok(Command { command_id: command_id.to_string() })
    }

    /// Records the quoted command line alongside the RUNNING transition, the
    /// same instant the original sets both (`ts_begin`/`command`) right
    /// before invoking the driver.
    pub async fn begin(&self, pool: &SqlitePool, command_text: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE avm_commands SET command = ?, ts_begin = ?, status = 'RUNNING' WHERE command_id = ?",
        )
        .bind(command_text)
        .bind(Utc::now())
        .bind(&self.command_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Records the finished process's output without touching status — the
    /// caller decides READY/ERROR afterwards (e.g. `apk_install` inspects
    /// stdout for the `Success` marker before choosing), matching the
    /// original's separate `UPDATE ... SET ts_end, proc_*` statement.
    pub async fn record_result(&self, pool: &SqlitePool, returncode: i32, stdout: &str, stderr: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE avm_commands
                SET ts_end = ?, proc_returncode = ?, proc_stdout = ?, proc_stderr = ?
              WHERE command_id = ?",
        )
        .bind(Utc::now())
        .bind(returncode)
        .bind(stdout)
        .bind(stderr)
        .bind(&self.command_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn select(&self, pool: &SqlitePool) -> StoreResult<Option<CommandDetail>> {
        let row = sqlx::query_as::<_, CommandDetail>(
            "SELECT command_id, avm_id, status, proc_returncode, proc_stdout, proc_stderr
               FROM avm_commands WHERE command_id = ?",
        )
        .bind(&self.command_id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }
}

#[async_trait]
impl Entity for Command {
    type Id = String;

    fn id(&self) -> String {
        self.command_id.clone()
    }

    async fn is_deleted(_pool: &SqlitePool, _id: &String) -> StoreResult<bool> {
        Ok(false)
    }

    async fn set_status(&self, pool: &SqlitePool, status: &str, reason: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE avm_commands SET status = ?, status_ts = ?, status_reason = ? WHERE command_id = ?",
        )
        .bind(status)
        .bind(Utc::now())
        .bind(reason)
        .bind(&self.command_id)
        .execute(pool)
        .await?;
        Ok(())
    }
}
