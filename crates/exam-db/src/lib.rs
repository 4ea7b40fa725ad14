//! # exam-db
//!
//! SQLite persistence behind an r2d2 pool.
//!
//! - `migrations`: idempotent schema steps tracked by `PRAGMA user_version`
//! - `payments`: [`SqlitePaymentStore`], the database-backed `PaymentStore`
//! - `attempts`, `tickets`, `users`: the rest of the app's rows
//!
//! Timestamps are stored as Unix milliseconds (`INTEGER`).

pub mod attempts;
mod error;
pub mod migrations;
pub mod payments;
pub mod tickets;
pub mod users;

pub use error::{DbError, Result};
pub use migrations::{ColumnCheck, MigrationError, MigrationReport};
pub use payments::SqlitePaymentStore;

use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = PooledConnection<SqliteConnectionManager>;

const POOL_SIZE: u32 = 8;

/// Pooled handle to one database file
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("connections", &self.pool.state().connections)
            .finish()
    }
}

impl Database {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path.as_ref()).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA busy_timeout = 5000;
                 PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;",
            )
        });
        let pool = Pool::builder().max_size(POOL_SIZE).build(manager)?;

        tracing::debug!(path = %path.as_ref().display(), "Opened database");
        Ok(Self { pool })
    }

    /// Private in-memory database; one connection so every caller sees the same data
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        Ok(Self { pool })
    }

    pub fn conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Bring the schema up to date
    pub fn migrate(&self) -> Result<MigrationReport> {
        let mut conn = self.conn()?;
        Ok(migrations::run_migrations(&mut conn)?)
    }

    pub fn verify_schema(&self) -> Result<Vec<ColumnCheck>> {
        let conn = self.conn()?;
        Ok(migrations::verify_schema(&conn)?)
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or(rusqlite::Error::IntegralValueOutOfRange(0, millis))
}

#[cfg(test)]
pub(crate) fn migrated_memory_db() -> Database {
    let db = Database::open_in_memory().unwrap();
    db.migrate().unwrap();
    db
}
