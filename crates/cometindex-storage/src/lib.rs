//! cometindex-storage: processed block-range persisters.
//!
//! Backends:
//! - [`memory`]: in-memory (tests, no persistence)
//! - [`sql`]: raw SQL over any [`sql::QueryRunner`]
//! - `sqlite`: SQLite via `sqlx` (embedded, single-file)
//! - `postgres`: PostgreSQL via `sqlx`, with reconnect

pub mod memory;
pub mod sql;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryPersister;
pub use sql::{QueryRunner, QueryTransaction, SqlPersister};
