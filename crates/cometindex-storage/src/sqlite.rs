//! SQLite persister.
//!
//! Stores processed ranges in a single SQLite file (or in memory for tests).
//! SQLite transactions are serializable, so both the merge pass and single
//! block persists run inside a plain transaction.
//!
//! # Usage
//! ```rust,no_run
//! use std::sync::Arc;
//! use cometindex_core::BlockSource;
//! use cometindex_storage::sqlite::{SqliteOptions, SqlitePersister};
//!
//! # async fn example(node: Arc<dyn BlockSource>) -> Result<(), Box<dyn std::error::Error>> {
//! let persister = SqlitePersister::open("./ranges.db", node, SqliteOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection};
use tracing::debug;

use cometindex_core::error::IndexerError;
use cometindex_core::persister::{plan_persist, PersistAction, Persister, PersisterConfig};
use cometindex_core::range::merge_ranges;
use cometindex_core::source::BlockSource;
use cometindex_core::types::{BlockRange, PersistedRange};

use crate::sql::{decode_range, height_param, RangeTableSql, DEFAULT_TABLE_NAME};

fn storage(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

fn decode_row(row: &SqliteRow) -> Result<PersistedRange, IndexerError> {
    decode_range(
        row.try_get("id").map_err(storage)?,
        row.try_get("start_block_height").map_err(storage)?,
        row.try_get("end_block_height").map_err(storage)?,
    )
}

/// Options for [`SqlitePersister`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqliteOptions {
    pub table_name: String,
    #[serde(default)]
    pub persister: PersisterConfig,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_TABLE_NAME.to_string(),
            persister: PersisterConfig::default(),
        }
    }
}

/// SQLite-backed [`Persister`].
pub struct SqlitePersister {
    pool: SqlitePool,
    sql: RangeTableSql,
    source: Arc<dyn BlockSource>,
    config: PersisterConfig,
}

impl SqlitePersister {
    /// Open (or create) a database at `path`, either a file path or a full
    /// `sqlite:` URL.
    pub async fn open(
        path: &str,
        source: Arc<dyn BlockSource>,
        options: SqliteOptions,
    ) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePool::connect(&url).await.map_err(storage)?;
        Self::init(pool, source, options, true).await
    }

    /// Ephemeral database on a single connection.
    pub async fn in_memory(
        source: Arc<dyn BlockSource>,
        options: SqliteOptions,
    ) -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage)?;
        Self::init(pool, source, options, false).await
    }

    async fn init(
        pool: SqlitePool,
        source: Arc<dyn BlockSource>,
        options: SqliteOptions,
        wal: bool,
    ) -> Result<Self, IndexerError> {
        let sql = RangeTableSql::new(&options.table_name)?;

        if wal {
            sqlx::query("PRAGMA journal_mode=WAL;")
                .execute(&pool)
                .await
                .map_err(storage)?;
        }

        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{}" (
                "id" INTEGER PRIMARY KEY AUTOINCREMENT,
                "start_block_height" INTEGER NOT NULL,
                "end_block_height" INTEGER NOT NULL
            );"#,
            sql.table()
        ))
        .execute(&pool)
        .await
        .map_err(storage)?;

        Ok(Self {
            pool,
            sql,
            source,
            config: options.persister,
        })
    }

    /// All stored rows sorted by start height.
    pub async fn processed_ranges(&self) -> Result<Vec<PersistedRange>, IndexerError> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        self.fetch_rows(&mut conn).await
    }

    /// Close the pool.
    pub async fn disconnect(&self) {
        self.pool.close().await;
    }

    async fn fetch_rows(&self, conn: &mut SqliteConnection) -> Result<Vec<PersistedRange>, IndexerError> {
        let rows = sqlx::query(&self.sql.select_all())
            .fetch_all(&mut *conn)
            .await
            .map_err(storage)?;

        rows.iter()
            .map(decode_row)
            .collect()
    }

    async fn merge(&self) -> Result<(), IndexerError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let rows = self.fetch_rows(&mut tx).await?;
        let plan = merge_ranges(&rows);
        if plan.is_noop() {
            return tx.commit().await.map_err(storage);
        }

        let t = self.sql.table();
        for r in plan.changed(&rows) {
            sqlx::query(&format!(
                r#"UPDATE "{t}" SET "start_block_height" = ?, "end_block_height" = ? WHERE "id" = ?"#
            ))
            .bind(height_param(r.start_height)?)
            .bind(height_param(r.end_height)?)
            .bind(r.id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }
        for id in &plan.to_delete {
            sqlx::query(&format!(r#"DELETE FROM "{t}" WHERE "id" = ?"#))
                .bind(*id)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
        }

        tx.commit().await.map_err(storage)?;
        debug!(table = t, deleted = plan.to_delete.len(), "merged block ranges");
        Ok(())
    }
}

impl std::fmt::Debug for SqlitePersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlitePersister")
            .field("table", &self.sql.table())
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl Persister for SqlitePersister {
    async fn get_unprocessed_block_ranges(&self) -> Result<Vec<BlockRange>, IndexerError> {
        self.merge().await?;
        let stored: Vec<BlockRange> = self
            .processed_ranges()
            .await?
            .iter()
            .map(PersistedRange::range)
            .collect();
        let heights = self.source.block_heights().await?;
        self.config.unprocessed_ranges(heights, &stored)
    }

    async fn persist_block(&self, height: u64) -> Result<(), IndexerError> {
        let t = self.sql.table();
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let neighbours = sqlx::query(&format!(
            r#"SELECT "id", "start_block_height", "end_block_height" FROM "{t}"
               WHERE "end_block_height" >= ? AND "start_block_height" <= ?"#
        ))
        .bind(height_param(height.saturating_sub(1))?)
        .bind(height_param(height.saturating_add(1))?)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage)?;

        let rows: Vec<PersistedRange> = neighbours
            .iter()
            .map(decode_row)
            .collect::<Result<_, IndexerError>>()?;

        let h = height_param(height)?;
        let statement = match plan_persist(height, &rows) {
            PersistAction::AlreadyCovered => None,
            PersistAction::ExtendEnd { id } => Some((
                format!(r#"UPDATE "{t}" SET "end_block_height" = ? WHERE "id" = ?"#),
                h,
                id,
            )),
            PersistAction::ExtendStart { id } => Some((
                format!(r#"UPDATE "{t}" SET "start_block_height" = ? WHERE "id" = ?"#),
                h,
                id,
            )),
            PersistAction::Insert => Some((
                format!(r#"INSERT INTO "{t}" ("start_block_height", "end_block_height") VALUES (?, ?)"#),
                h,
                h,
            )),
        };

        if let Some((sql, first, second)) = statement {
            sqlx::query(&sql)
                .bind(first)
                .bind(second)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
        }
        tx.commit().await.map_err(storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixedHeights;

    fn r(start: u64, end: u64) -> BlockRange {
        BlockRange::new(start, end).unwrap()
    }

    async fn persister(earliest: u64, latest: u64) -> SqlitePersister {
        SqlitePersister::in_memory(FixedHeights::new(earliest, latest), SqliteOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn persist_builds_ranges() {
        let p = persister(1, 1_000).await;
        for h in [10, 11, 13, 12, 9] {
            p.persist_block(h).await.unwrap();
        }

        let ranges: Vec<BlockRange> = p
            .processed_ranges()
            .await
            .unwrap()
            .iter()
            .map(PersistedRange::range)
            .collect();
        // 12 extends [10,11]; [13,13] stays a separate row until the merge pass
        assert_eq!(ranges, vec![r(9, 12), r(13, 13)]);
    }

    #[tokio::test]
    async fn merge_then_gaps() {
        let p = persister(1, 1_000).await;
        for h in (1..=5).chain(8..=9).chain([20]) {
            p.persist_block(h).await.unwrap();
        }
        for h in [7, 6] {
            p.persist_block(h).await.unwrap();
        }

        assert_eq!(
            p.get_unprocessed_block_ranges().await.unwrap(),
            vec![r(10, 19)]
        );
        let rows = p.processed_ranges().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].range(), r(1, 9));
    }

    #[tokio::test]
    async fn empty_table_reports_nothing() {
        let p = persister(1, 1_000).await;
        assert!(p.get_unprocessed_block_ranges().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn persisting_twice_is_idempotent() {
        let p = persister(1, 1_000).await;
        p.persist_block(42).await.unwrap();
        p.persist_block(42).await.unwrap();
        assert_eq!(p.processed_ranges().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn negative_stored_height_is_an_error() {
        let p = persister(1, 1_000).await;
        sqlx::query(
            r#"INSERT INTO "cometindex_block_ranges" ("start_block_height", "end_block_height") VALUES (-3, 5)"#,
        )
        .execute(&p.pool)
        .await
        .unwrap();

        assert!(matches!(p.processed_ranges().await, Err(IndexerError::Storage(_))));
        assert!(matches!(
            p.get_unprocessed_block_ranges().await,
            Err(IndexerError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn custom_table_name() {
        let options = SqliteOptions {
            table_name: "osmosis_ranges".into(),
            ..SqliteOptions::default()
        };
        let p = SqlitePersister::in_memory(FixedHeights::new(1, 10), options)
            .await
            .unwrap();
        p.persist_block(3).await.unwrap();
        assert_eq!(p.processed_ranges().await.unwrap()[0].range(), r(3, 3));

        let bad = SqliteOptions {
            table_name: "bad name".into(),
            ..SqliteOptions::default()
        };
        assert!(matches!(
            SqlitePersister::in_memory(FixedHeights::new(1, 10), bad).await,
            Err(IndexerError::Config(_))
        ));
    }
}
