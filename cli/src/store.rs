//! Picks a persister backend from the `--db` argument.
//!
//! - `memory` : in-process, lost on exit
//! - `postgres://…` / `postgresql://…` : PostgreSQL
//! - `sqlite:…` or any other value : SQLite file

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use cometindex_core::{BlockSource, Persister, PersisterConfig};
use cometindex_storage::postgres::{PostgresOptions, PostgresPersister};
use cometindex_storage::sqlite::{SqliteOptions, SqlitePersister};
use cometindex_storage::InMemoryPersister;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Sqlite(String),
    Postgres(String),
}

impl Backend {
    pub fn parse(db: &str) -> Self {
        if db == "memory" {
            Self::Memory
        } else if db.starts_with("postgres://") || db.starts_with("postgresql://") {
            Self::Postgres(db.to_string())
        } else {
            Self::Sqlite(db.to_string())
        }
    }
}

pub enum Store {
    Memory(Arc<InMemoryPersister>),
    Sqlite(Arc<SqlitePersister>),
    Postgres(Arc<PostgresPersister>),
}

impl Store {
    pub async fn open(
        db: &str,
        table: &str,
        source: Arc<dyn BlockSource>,
        persister: PersisterConfig,
    ) -> Result<Self> {
        let store = match Backend::parse(db) {
            Backend::Memory => {
                Self::Memory(Arc::new(InMemoryPersister::with_config(source, persister)))
            }
            Backend::Sqlite(path) => {
                let options = SqliteOptions {
                    table_name: table.to_string(),
                    persister,
                };
                let p = SqlitePersister::open(&path, source, options)
                    .await
                    .with_context(|| format!("opening SQLite database {path}"))?;
                Self::Sqlite(Arc::new(p))
            }
            Backend::Postgres(url) => {
                let options = PostgresOptions {
                    table_name: table.to_string(),
                    persister,
                    ..PostgresOptions::default()
                };
                let p = PostgresPersister::new(url, source, options)?;
                p.connect().await.context("connecting to PostgreSQL")?;
                Self::Postgres(Arc::new(p))
            }
        };
        info!(backend = store.name(), table, "persister ready");
        Ok(store)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Sqlite(_) => "sqlite",
            Self::Postgres(_) => "postgres",
        }
    }

    pub fn persister(&self) -> Arc<dyn Persister> {
        match self {
            Self::Memory(p) => p.clone(),
            Self::Sqlite(p) => p.clone(),
            Self::Postgres(p) => p.clone(),
        }
    }

    pub async fn close(&self) {
        match self {
            Self::Memory(_) => {}
            Self::Sqlite(p) => p.disconnect().await,
            Self::Postgres(p) => p.disconnect().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_from_db_argument() {
        assert_eq!(Backend::parse("memory"), Backend::Memory);
        assert_eq!(
            Backend::parse("postgres://user@localhost/idx"),
            Backend::Postgres("postgres://user@localhost/idx".into())
        );
        assert_eq!(
            Backend::parse("./ranges.db"),
            Backend::Sqlite("./ranges.db".into())
        );
        assert_eq!(
            Backend::parse("sqlite::memory:"),
            Backend::Sqlite("sqlite::memory:".into())
        );
    }
}
