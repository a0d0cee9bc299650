//! SQLite-backed checkpoint store.
//!
//! Holds, per monitored source, the last committed cursor and a bounded
//! window of recently delivered item ids. `commit` is a single transaction:
//! forward-only cursor upsert, idempotent delivery-record inserts, and
//! retention pruning, so a crash between deliveries and commit never leaves
//! a partial update visible to a later `load`.
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use perch_common::{Checkpoint, CheckpointStore, Cursor, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoint (
  source_id      TEXT PRIMARY KEY,
  cursor_ts      TEXT NOT NULL,
  cursor_item_id TEXT NOT NULL,
  updated_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS delivery (
  source_id    TEXT NOT NULL,
  item_id      TEXT NOT NULL,
  delivered_at TEXT NOT NULL,
  PRIMARY KEY (source_id, item_id)
);

CREATE INDEX IF NOT EXISTS idx_delivery_recency
  ON delivery (source_id, delivered_at DESC);
"#;

pub struct SqliteCheckpointStore {
    pool: SqlitePool,
    /// Delivery records retained per source; older rows are pruned on commit.
    retention: u32,
}

impl SqliteCheckpointStore {
    pub fn new(pool: SqlitePool, retention: u32) -> Self {
        Self {
            pool,
            retention: retention.max(1),
        }
    }

    /// Open (creating if missing) the database at `url` and run migrations.
    pub async fn connect(url: &str, retention: u32) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str(url)
            .map_err(store_err)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(opts)
            .await
            .map_err(store_err)?;
        let store = Self::new(pool, retention);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        debug!("store.migrate");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn store_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn row_cursor(ts: &str, item_id: String) -> Result<Cursor, StoreError> {
    let timestamp = DateTime::parse_from_rfc3339(ts)
        .map_err(|e| store_err(format!("corrupt cursor timestamp {ts:?}: {e}")))?
        .with_timezone(&Utc);
    Ok(Cursor { timestamp, item_id })
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self, source_id: &str) -> Result<Checkpoint, StoreError> {
        let row = sqlx::query(
            r#"SELECT cursor_ts, cursor_item_id FROM checkpoint WHERE source_id = ?1"#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        let cursor = match row {
            Some(r) => Some(row_cursor(
                &r.try_get::<String, _>("cursor_ts").map_err(store_err)?,
                r.try_get("cursor_item_id").map_err(store_err)?,
            )?),
            None => None,
        };

        let rows = sqlx::query(
            r#"SELECT item_id FROM delivery
               WHERE source_id = ?1
               ORDER BY delivered_at DESC, item_id DESC
               LIMIT ?2"#,
        )
        .bind(source_id)
        .bind(self.retention as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let delivered = rows
            .into_iter()
            .map(|r| r.try_get::<String, _>("item_id").map_err(store_err))
            .collect::<Result<_, _>>()?;

        debug!(source_id, has_cursor = cursor.is_some(), "store.load");
        Ok(Checkpoint { cursor, delivered })
    }

    async fn commit(
        &self,
        source_id: &str,
        cursor: &Cursor,
        delivered: &[String],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        // The cursor only moves forward. A retried commit (same or older
        // cursor) keeps the stored value, which also makes commit idempotent.
        let existing = sqlx::query(
            r#"SELECT cursor_ts, cursor_item_id FROM checkpoint WHERE source_id = ?1"#,
        )
        .bind(source_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;

        let advance = match existing {
            Some(r) => {
                let current = row_cursor(
                    &r.try_get::<String, _>("cursor_ts").map_err(store_err)?,
                    r.try_get("cursor_item_id").map_err(store_err)?,
                )?;
                *cursor > current
            }
            None => true,
        };

        if advance {
            sqlx::query(
                r#"INSERT INTO checkpoint (source_id, cursor_ts, cursor_item_id, updated_at)
                   VALUES (?1, ?2, ?3, ?4)
                   ON CONFLICT(source_id) DO UPDATE SET
                     cursor_ts=excluded.cursor_ts,
                     cursor_item_id=excluded.cursor_item_id,
                     updated_at=excluded.updated_at"#,
            )
            .bind(source_id)
            .bind(cursor.timestamp.to_rfc3339())
            .bind(&cursor.item_id)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }

        let now = Utc::now().to_rfc3339();
        for item_id in delivered {
            sqlx::query(
                r#"INSERT INTO delivery (source_id, item_id, delivered_at)
                   VALUES (?1, ?2, ?3)
                   ON CONFLICT(source_id, item_id) DO NOTHING"#,
            )
            .bind(source_id)
            .bind(item_id)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }

        // Bound the delivery window so storage does not grow forever.
        sqlx::query(
            r#"DELETE FROM delivery
               WHERE source_id = ?1 AND item_id NOT IN (
                 SELECT item_id FROM delivery
                 WHERE source_id = ?1
                 ORDER BY delivered_at DESC, item_id DESC
                 LIMIT ?2
               )"#,
        )
        .bind(source_id)
        .bind(self.retention as i64)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        info!(
            source_id,
            cursor_item_id = %cursor.item_id,
            delivered = delivered.len(),
            advanced = advance,
            "store.commit"
        );
        Ok(())
    }
}
