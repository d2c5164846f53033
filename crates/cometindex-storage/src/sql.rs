//! Raw-SQL persister over any driver that can run a SQL string.
//!
//! Statements use the PostgreSQL dialect.
//!
//! - merge: one `SERIALIZABLE` transaction on a dedicated session that reads
//!   the rows and rewrites them, so a concurrent persist aborts one side
//!   instead of losing a height
//! - persist: one `READ COMMITTED` script, every statement re-checks coverage

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use cometindex_core::error::IndexerError;
use cometindex_core::persister::{Persister, PersisterConfig};
use cometindex_core::range::{merge_ranges, MergePlan};
use cometindex_core::source::BlockSource;
use cometindex_core::types::{BlockRange, PersistedRange};

pub const DEFAULT_TABLE_NAME: &str = "cometindex_block_ranges";

/// Executes SQL text and returns the rows of the last statement as JSON objects.
#[async_trait]
pub trait QueryRunner: Send + Sync {
    async fn run_query(&self, sql: &str) -> Result<Vec<Value>, IndexerError>;

    /// Open a transaction at `isolation` on a session of its own.
    async fn begin(&self, isolation: &str) -> Result<Box<dyn QueryTransaction + '_>, IndexerError>;
}

/// An open transaction. Dropping it without [`QueryTransaction::commit`] rolls back.
#[async_trait]
pub trait QueryTransaction: Send {
    async fn run_query(&mut self, sql: &str) -> Result<Vec<Value>, IndexerError>;

    async fn commit(self: Box<Self>) -> Result<(), IndexerError>;
}

// ─── Statement builder ────────────────────────────────────────────────────────

/// SQL for one `(id, start_block_height, end_block_height)` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RangeTableSql {
    table: String,
}

impl RangeTableSql {
    /// Table names are interpolated, so only `[A-Za-z0-9_]` is accepted.
    pub(crate) fn new(table: &str) -> Result<Self, IndexerError> {
        let valid = !table.is_empty()
            && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !table.starts_with(|c: char| c.is_ascii_digit());
        if !valid {
            return Err(IndexerError::Config(format!("invalid table name {table:?}")));
        }
        Ok(Self {
            table: table.to_string(),
        })
    }

    pub(crate) fn table(&self) -> &str {
        &self.table
    }

    pub(crate) fn create_table(&self) -> String {
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{t}" (
                "id" BIGSERIAL PRIMARY KEY,
                "start_block_height" BIGINT NOT NULL,
                "end_block_height" BIGINT NOT NULL
            )"#,
            t = self.table
        )
    }

    pub(crate) fn select_all(&self) -> String {
        format!(
            r#"SELECT "id", "start_block_height", "end_block_height" FROM "{}" ORDER BY "start_block_height""#,
            self.table
        )
    }

    /// Rewrites for a merge plan. Each survivor takes the widest end among
    /// the rows it absorbs as they are at execution time.
    pub(crate) fn merge_statements(&self, plan: &MergePlan, original: &[PersistedRange]) -> Vec<String> {
        let t = &self.table;
        let mut statements: Vec<String> = plan
            .changed(original)
            .map(|r| {
                format!(
                    r#"UPDATE "{t}" SET "end_block_height" = GREATEST("end_block_height", (SELECT MAX("end_block_height") FROM "{t}" WHERE "start_block_height" BETWEEN {s} AND {e})) WHERE "id" = {id}"#,
                    s = r.start_height,
                    e = r.end_height,
                    id = r.id
                )
            })
            .collect();

        if !plan.to_delete.is_empty() {
            let ids: Vec<String> = plan.to_delete.iter().map(i64::to_string).collect();
            statements.push(format!(
                r#"DELETE FROM "{t}" WHERE "id" IN ({})"#,
                ids.join(", ")
            ));
        }
        statements
    }

    /// Extend a left neighbour, else a right neighbour, else insert. Every
    /// step is skipped once `height` is covered, so replays are no-ops.
    pub(crate) fn persist_statements(&self, height: u64) -> Vec<String> {
        let t = &self.table;
        let h = height;
        let uncovered = format!(
            r#"NOT EXISTS (SELECT 1 FROM "{t}" WHERE "start_block_height" <= {h} AND "end_block_height" >= {h})"#
        );
        vec![
            format!(
                r#"UPDATE "{t}" SET "end_block_height" = {h} WHERE "id" = (SELECT "id" FROM "{t}" WHERE "end_block_height" = {h} - 1 LIMIT 1) AND {uncovered}"#
            ),
            format!(
                r#"UPDATE "{t}" SET "start_block_height" = {h} WHERE "id" = (SELECT "id" FROM "{t}" WHERE "start_block_height" = {h} + 1 LIMIT 1) AND {uncovered}"#
            ),
            format!(
                r#"INSERT INTO "{t}" ("start_block_height", "end_block_height") SELECT {h}, {h} WHERE {uncovered}"#
            ),
        ]
    }
}

/// Wrap statements in one transaction script.
pub(crate) fn transaction_script(isolation: &str, statements: &[String]) -> String {
    let mut script = format!("BEGIN ISOLATION LEVEL {isolation};\n");
    for stmt in statements {
        script.push_str(stmt);
        script.push_str(";\n");
    }
    script.push_str("COMMIT;");
    script
}

fn number_field(row: &Value, key: &str) -> Option<i64> {
    match row.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Validate a stored `(id, start, end)` row. Heights live in signed BIGINT
/// columns, so negative values mean the table was written by something else.
pub(crate) fn decode_range(id: i64, start: i64, end: i64) -> Result<PersistedRange, IndexerError> {
    let (Ok(start_height), Ok(end_height)) = (u64::try_from(start), u64::try_from(end)) else {
        return Err(IndexerError::Storage(format!(
            "negative block height in row {id}: [{start}, {end}]"
        )));
    };
    if start_height > end_height {
        return Err(IndexerError::Storage(format!(
            "inverted block range in row {id}: [{start}, {end}]"
        )));
    }
    Ok(PersistedRange {
        id,
        start_height,
        end_height,
    })
}

/// A height as a BIGINT parameter.
pub(crate) fn height_param(height: u64) -> Result<i64, IndexerError> {
    i64::try_from(height)
        .map_err(|_| IndexerError::Storage(format!("block height {height} does not fit in BIGINT")))
}

/// Decode and validate `(id, start, end)` rows.
pub(crate) fn parse_rows(rows: &[Value]) -> Result<Vec<PersistedRange>, IndexerError> {
    let mut parsed = Vec::with_capacity(rows.len());
    for row in rows {
        let fields = (
            number_field(row, "id"),
            number_field(row, "start_block_height"),
            number_field(row, "end_block_height"),
        );
        let (Some(id), Some(start), Some(end)) = fields else {
            return Err(IndexerError::Storage(format!(
                "query returned a row with non-number heights: {row}"
            )));
        };
        parsed.push(decode_range(id, start, end)?);
    }
    parsed.sort_by_key(|r| r.start_height);
    Ok(parsed)
}

// ─── SqlPersister ─────────────────────────────────────────────────────────────

/// [`Persister`] over a [`QueryRunner`].
pub struct SqlPersister<R> {
    runner: R,
    sql: RangeTableSql,
    source: Arc<dyn BlockSource>,
    config: PersisterConfig,
}

impl<R: QueryRunner> SqlPersister<R> {
    pub fn new(runner: R, source: Arc<dyn BlockSource>) -> Self {
        Self {
            runner,
            sql: RangeTableSql {
                table: DEFAULT_TABLE_NAME.to_string(),
            },
            source,
            config: PersisterConfig::default(),
        }
    }

    pub fn with_table(mut self, table: &str) -> Result<Self, IndexerError> {
        self.sql = RangeTableSql::new(table)?;
        Ok(self)
    }

    pub fn with_config(mut self, config: PersisterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Create the range table if it does not exist.
    pub async fn setup(&self) -> Result<(), IndexerError> {
        self.runner.run_query(&self.sql.create_table()).await?;
        info!(table = self.sql.table(), "block range table ready");
        Ok(())
    }

    /// All stored rows sorted by start height.
    pub async fn processed_ranges(&self) -> Result<Vec<PersistedRange>, IndexerError> {
        let rows = self.runner.run_query(&self.sql.select_all()).await?;
        parse_rows(&rows)
    }

    async fn merge(&self) -> Result<(), IndexerError> {
        let mut tx = self.runner.begin("SERIALIZABLE").await?;
        let rows = parse_rows(&tx.run_query(&self.sql.select_all()).await?)?;
        let plan = merge_ranges(&rows);
        for stmt in self.sql.merge_statements(&plan, &rows) {
            tx.run_query(&stmt).await?;
        }
        tx.commit().await?;

        if !plan.is_noop() {
            debug!(table = self.sql.table(), deleted = plan.to_delete.len(), "merged block ranges");
        }
        Ok(())
    }
}

#[async_trait]
impl<R: QueryRunner> Persister for SqlPersister<R> {
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
        let script = transaction_script("READ COMMITTED", &self.sql.persist_statements(height));
        self.runner.run_query(&script).await?;
        Ok(())
    }
}
