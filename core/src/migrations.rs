//! Relational schema versioning: a `schema_version.version` singleton plus
//! ordered numeric-prefixed migration scripts applied in one transaction,
//! per `spec.md` §6. The migration runner CLI itself is a collaborator
//! contract out of scope here (SPEC_FULL.md §1/§6); this module supplies the
//! schema, the applier a runner would call, and the startup check every
//! other process performs instead.

use crate::errors::{StoreError, StoreResult};
use sqlx::SqlitePool;

/// One entry per file under `migrations/`, in order.
pub const MIGRATIONS: &[(i64, &str)] = &[(1, include_str!("../migrations/0001_init.sql"))];

pub const CURRENT_VERSION: i64 = MIGRATIONS[MIGRATIONS.len() - 1].0;

/// Applies every migration newer than the persisted version, in a single
/// transaction, bootstrapping `schema_version` itself on an empty database.
pub async fn apply_all(pool: &SqlitePool) -> StoreResult<()> {
    let persisted = persisted_version(pool).await?;
    let mut tx = pool.begin().await?;
    for (version, sql) in MIGRATIONS {
        if *version <= persisted {
            continue;
        }
        sqlx::raw_sql(sql).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// **[ADDED] Startup schema check** (SPEC_FULL.md §6): a process that is not
/// the migration runner refuses to start if the persisted version is older
/// *or* newer than the version it was built against.
pub async fn check_current(pool: &SqlitePool) -> StoreResult<()> {
    let persisted = persisted_version(pool).await?;
    if persisted != CURRENT_VERSION {
        return Err(StoreError::SchemaMismatch { persisted, expected: CURRENT_VERSION });
    }
    Ok(())
}

async fn persisted_version(pool: &SqlitePool) -> StoreResult<i64> {
    let exists: Option<(i64,)> =
        sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'")
            .fetch_optional(pool)
            .await?;
    if exists.is_none() {
        return Ok(0);
    }
    let (version,): (i64,) = sqlx::query_as("SELECT version FROM schema_version WHERE singleton = 0")
        .fetch_one(pool)
        .await?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_database_applies_to_current_version() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        apply_all(&pool).await.unwrap();
        assert!(check_current(&pool).await.is_ok());
    }

    #[tokio::test]
    async fn unmigrated_database_fails_the_startup_check() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let err = check_current(&pool).await.unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { persisted: 0, .. }));
    }
}
