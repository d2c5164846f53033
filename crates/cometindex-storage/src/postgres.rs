//! PostgreSQL persister.
//!
//! Keeps processed ranges in one table behind a `sqlx` pool. Connecting is
//! retried through a [`Retrier`]; a connection-level failure inside a
//! transaction drops the pool so the next retry reconnects. An explicit
//! [`PostgresPersister::disconnect`] turns reconnecting off.
//!
//! # Feature Flag
//! Requires the `postgres` feature:
//! ```toml
//! cometindex-storage = { version = "0.2", features = ["postgres"] }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Row};
use tracing::{info, warn};

use cometindex_core::error::IndexerError;
use cometindex_core::persister::{Persister, PersisterConfig};
use cometindex_core::range::merge_ranges;
use cometindex_core::retry::{ErrorRetrier, Retrier, RetryConfig, RetryHooks};
use cometindex_core::source::BlockSource;
use cometindex_core::types::{BlockRange, PersistedRange};

use crate::sql::{decode_range, RangeTableSql, DEFAULT_TABLE_NAME};

// ─── Options ──────────────────────────────────────────────────────────────────

/// Pool, table and retry settings for [`PostgresPersister`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresOptions {
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub table_name: String,
    pub persister: PersisterConfig,
    /// Applies to connecting and to every transaction.
    pub retry: RetryConfig,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            connect_timeout_secs: 30,
            table_name: DEFAULT_TABLE_NAME.to_string(),
            persister: PersisterConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

fn is_connection_error(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

async fn fetch_rows(conn: &mut PgConnection, sql: &RangeTableSql) -> Result<Vec<PgRow>, sqlx::Error> {
    sqlx::query(&sql.select_all()).fetch_all(&mut *conn).await
}

fn decode_rows(rows: &[PgRow]) -> Result<Vec<PersistedRange>, IndexerError> {
    rows.iter()
        .map(|row| {
            let column = |name: &str| {
                row.try_get::<i64, _>(name)
                    .map_err(|e| IndexerError::Storage(e.to_string()))
            };
            decode_range(
                column("id")?,
                column("start_block_height")?,
                column("end_block_height")?,
            )
        })
        .collect()
}

// ─── PostgresPersister ────────────────────────────────────────────────────────

/// PostgreSQL-backed [`Persister`].
pub struct PostgresPersister {
    url: String,
    options: PostgresOptions,
    sql: RangeTableSql,
    pool: RwLock<Option<PgPool>>,
    should_reconnect: AtomicBool,
    retrier: Retrier,
    tx_retrier: ErrorRetrier,
    source: Arc<dyn BlockSource>,
}

impl PostgresPersister {
    /// Build a persister for `database_url`. No connection is made until
    /// [`PostgresPersister::connect`] or the first query.
    pub fn new(
        database_url: impl Into<String>,
        source: Arc<dyn BlockSource>,
        options: PostgresOptions,
    ) -> Result<Self, IndexerError> {
        let sql = RangeTableSql::new(&options.table_name)?;
        let retrier = options.retry.build();
        Ok(Self {
            url: database_url.into(),
            sql,
            pool: RwLock::new(None),
            should_reconnect: AtomicBool::new(true),
            tx_retrier: ErrorRetrier::new(retrier.clone()),
            retrier,
            source,
            options,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.pool
            .read()
            .unwrap()
            .as_ref()
            .is_some_and(|pool| !pool.is_closed())
    }

    fn reconnect_enabled(&self) -> bool {
        self.should_reconnect.load(Ordering::SeqCst)
    }

    /// Connect (retrying) and create the range table.
    pub async fn connect(&self) -> Result<(), IndexerError> {
        self.should_reconnect.store(true, Ordering::SeqCst);
        self.reconnect().await.map(|_| ())
    }

    /// Stop reconnecting and close the pool.
    pub async fn disconnect(&self) {
        self.should_reconnect.store(false, Ordering::SeqCst);
        let pool = self.pool.write().unwrap().take();
        if let Some(pool) = pool {
            pool.close().await;
            info!(table = self.sql.table(), "Postgres persister disconnected");
        }
    }

    async fn open_pool(&self) -> Result<PgPool, IndexerError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.options.max_connections)
            .min_connections(self.options.min_connections)
            .acquire_timeout(Duration::from_secs(self.options.connect_timeout_secs))
            .connect(&self.url)
            .await
            .map_err(|e| IndexerError::Storage(format!("postgres connect: {e}")))?;

        sqlx::query(&self.sql.create_table())
            .execute(&pool)
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;
        Ok(pool)
    }

    async fn reconnect(&self) -> Result<PgPool, IndexerError> {
        let hooks = RetryHooks::new()
            .on_failed_attempt(|err: &IndexerError, attempt| {
                warn!(attempt, error = %err, "Reconnecting to Postgres");
            })
            .on_failed_last_attempt(|err: &IndexerError, attempts| {
                tracing::error!(attempts, error = %err, "Postgres reconnect attempts exhausted");
            })
            .retry_if(|_| self.reconnect_enabled());

        let pool = self.retrier.wrap(|_| self.open_pool(), hooks).await?;
        if !self.reconnect_enabled() {
            pool.close().await;
            return Err(IndexerError::Storage("postgres persister is disconnected".into()));
        }

        *self.pool.write().unwrap() = Some(pool.clone());
        info!(table = self.sql.table(), "Postgres persister connected");
        Ok(pool)
    }

    async fn pool(&self) -> Result<PgPool, IndexerError> {
        let current = self.pool.read().unwrap().clone();
        match current {
            Some(pool) => Ok(pool),
            None if self.reconnect_enabled() => self.reconnect().await,
            None => Err(IndexerError::Storage("postgres persister is disconnected".into())),
        }
    }

    /// Map a driver error, dropping the pool when the connection itself failed.
    fn on_error(&self, e: sqlx::Error) -> IndexerError {
        if is_connection_error(&e) {
            warn!(error = %e, "Postgres connection lost");
            self.pool.write().unwrap().take();
        }
        IndexerError::Storage(e.to_string())
    }

    fn hooks(&self, label: &str) -> RetryHooks<'_, IndexerError> {
        RetryHooks::logged(format!("postgres {label}")).retry_if(|_| self.reconnect_enabled())
    }

    async fn merge_once(&self) -> Result<(), IndexerError> {
        let pool = self.pool().await?;
        let mut tx = pool.begin().await.map_err(|e| self.on_error(e))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE READ WRITE")
            .execute(&mut *tx)
            .await
            .map_err(|e| self.on_error(e))?;

        let rows = fetch_rows(&mut tx, &self.sql)
            .await
            .map_err(|e| self.on_error(e))?;
        let rows = decode_rows(&rows)?;
        let plan = merge_ranges(&rows);
        for stmt in self.sql.merge_statements(&plan, &rows) {
            sqlx::query(&stmt)
                .execute(&mut *tx)
                .await
                .map_err(|e| self.on_error(e))?;
        }
        tx.commit().await.map_err(|e| self.on_error(e))?;

        if !plan.is_noop() {
            info!(table = self.sql.table(), deleted = plan.to_delete.len(), "merged block ranges");
        }
        Ok(())
    }

    async fn persist_once(&self, height: u64) -> Result<(), IndexerError> {
        let pool = self.pool().await?;
        let mut tx = pool.begin().await.map_err(|e| self.on_error(e))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED READ WRITE")
            .execute(&mut *tx)
            .await
            .map_err(|e| self.on_error(e))?;

        for stmt in self.sql.persist_statements(height) {
            sqlx::query(&stmt)
                .execute(&mut *tx)
                .await
                .map_err(|e| self.on_error(e))?;
        }
        tx.commit().await.map_err(|e| self.on_error(e))
    }

    async fn ranges_once(&self) -> Result<Vec<PersistedRange>, IndexerError> {
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await.map_err(|e| self.on_error(e))?;
        let rows = fetch_rows(&mut conn, &self.sql)
            .await
            .map_err(|e| self.on_error(e))?;
        decode_rows(&rows)
    }

    /// All stored rows sorted by start height.
    pub async fn processed_ranges(&self) -> Result<Vec<PersistedRange>, IndexerError> {
        self.tx_retrier
            .wrap(|| self.ranges_once(), self.hooks("read ranges"))
            .await
    }
}

impl std::fmt::Debug for PostgresPersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresPersister")
            .field("table", &self.sql.table())
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[async_trait]
impl Persister for PostgresPersister {
    async fn get_unprocessed_block_ranges(&self) -> Result<Vec<BlockRange>, IndexerError> {
        self.tx_retrier
            .wrap(|| self.merge_once(), self.hooks("merge"))
            .await?;

        let stored: Vec<BlockRange> = self
            .processed_ranges()
            .await?
            .iter()
            .map(PersistedRange::range)
            .collect();
        let heights = self.source.block_heights().await?;
        self.options.persister.unprocessed_ranges(heights, &stored)
    }

    async fn persist_block(&self, height: u64) -> Result<(), IndexerError> {
        self.tx_retrier
            .wrap(
                || self.persist_once(height),
                self.hooks(&format!("persist_block({height})")),
            )
            .await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
