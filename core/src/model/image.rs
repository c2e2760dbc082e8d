//! Static reference data from the `images` table (SPEC_FULL.md §3): maps an
//! `image` key to the Heat stack glance images and the player's
//! `android_version` build prop. Seeded by migration, never written by the
//! core. Grounded on `original_source/ats/kyaraben/worker/tasks.py`'s
//! `SELECT system_image, data_image ... FROM images WHERE image = %s`.

use crate::errors::{StoreError, StoreResult};
use sqlx::SqlitePool;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ImageRow {
    pub system_image: String,
    pub data_image: String,
    pub android_version: String,
}

pub async fn lookup(pool: &SqlitePool, image: &str) -> StoreResult<ImageRow> {
    sqlx::query_as::<_, ImageRow>(
        "SELECT system_image, data_image, android_version FROM images WHERE image_key = ?",
    )
    .bind(image)
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::NotFound)
}
