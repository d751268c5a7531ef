// ABOUTME: Typed persistence façade over SQLite; schema constraints are the
// ultimate arbiter of session name/branch uniqueness

mod environments;
mod sessions;
mod users;

pub use environments::NewEnvironment;
pub use sessions::NewSession;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Environment, Session};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("environment name already in use")]
    NameInUse { existing: Environment },
    #[error("session name already in use")]
    SessionNameInUse { existing: Session },
    #[error("branch already in use by another session")]
    BranchInUse { existing: Session },
    #[error("row not found: {0}")]
    NotFound(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Shared handle to the relational store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if necessary) and migrate the database.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StoreError::Database)?
            .create_if_missing(true)
            .foreign_keys(true);

        // An in-memory database exists per connection; more than one
        // connection in the pool would see different schemas.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory store for tests.
    pub async fn connect_in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub(crate) fn parse_uuid(value: &str, context: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|_| StoreError::Corrupt(format!("{context}: bad uuid {value}")))
}

pub(crate) fn parse_datetime(value: &str, context: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt(format!("{context}: bad timestamp {value}")))
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// True when a database error is a UNIQUE violation touching the given
/// index or column list.
pub(crate) fn is_unique_violation(err: &sqlx::Error, needle: &str) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let message = db.message();
            message.contains("UNIQUE constraint failed") && message.contains(needle)
        }
        _ => false,
    }
}
