//! Schema migrations.
//!
//! Migrations are embedded in the binary and tracked with `PRAGMA
//! user_version`. Every step is also idempotent on its own: tables use
//! `CREATE TABLE IF NOT EXISTS`, indexes `CREATE INDEX IF NOT EXISTS`, and
//! columns are added only after checking `pragma_table_info`, because SQLite
//! has no `ADD COLUMN IF NOT EXISTS`. Re-running against a database whose
//! version was reset is therefore safe.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

/// A schema migration.
pub struct Migration {
    /// Version number (sequential, starting from 1).
    pub version: i32,
    pub description: &'static str,
    pub up: fn(&Connection) -> rusqlite::Result<()>,
}

/// All migrations in order. Add new migrations to the end of this list.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "baseline tables",
        up: migration_001_baseline,
    },
    Migration {
        version: 2,
        description: "attempt counters",
        up: migration_002_attempt_counters,
    },
    Migration {
        version: 3,
        description: "ticket responses",
        up: migration_003_ticket_responses,
    },
    Migration {
        version: 4,
        description: "payment indexes",
        up: migration_004_payment_indexes,
    },
];

/// Columns the application reads and writes.
pub const EXPECTED_COLUMNS: &[(&str, &str)] = &[
    ("users", "id"),
    ("users", "email"),
    ("users", "credits"),
    ("payments", "id"),
    ("payments", "user_id"),
    ("payments", "amount"),
    ("payments", "currency"),
    ("payments", "credits"),
    ("payments", "provider"),
    ("payments", "provider_payment_id"),
    ("payments", "status"),
    ("payments", "created_at"),
    ("payments", "settled_at"),
    ("attempts", "id"),
    ("attempts", "user_id"),
    ("attempts", "started_at"),
    ("attempts", "credits_paid"),
    ("attempts", "questions_submitted"),
    ("attempts", "updated_at"),
    ("tickets", "id"),
    ("tickets", "user_id"),
    ("tickets", "subject"),
    ("tickets", "status"),
    ("tickets", "responses"),
    ("tickets", "created_at"),
];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Migration {version} ({description}) failed: {source}")]
    Failed {
        version: i32,
        description: &'static str,
        source: rusqlite::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// What a migration run did
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub from_version: i32,
    pub to_version: i32,
    pub applied: Vec<i32>,
}

/// One row of the schema verification table
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ColumnCheck {
    pub table: &'static str,
    pub column: &'static str,
    pub present: bool,
    pub declared_type: Option<String>,
    pub default: Option<String>,
    pub not_null: bool,
}

pub fn get_version(conn: &Connection) -> rusqlite::Result<i32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}

pub fn set_version(conn: &Connection, version: i32) -> rusqlite::Result<()> {
    conn.pragma_update(None, "user_version", version)
}

/// Run pending migrations, each in its own transaction
pub fn run_migrations(conn: &mut Connection) -> Result<MigrationReport, MigrationError> {
    let from_version = get_version(conn)?;

    let pending: Vec<_> = MIGRATIONS
        .iter()
        .filter(|m| m.version > from_version)
        .collect();

    if pending.is_empty() {
        tracing::debug!(version = from_version, "Database schema up to date");
        return Ok(MigrationReport {
            from_version,
            to_version: from_version,
            applied: Vec::new(),
        });
    }

    tracing::info!(
        version = from_version,
        pending = pending.len(),
        "Running database migrations"
    );

    let mut applied = Vec::with_capacity(pending.len());
    for migration in pending {
        let tx = conn.transaction()?;

        // Transaction rolls back on drop if anything below fails
        let result = (migration.up)(&tx).and_then(|()| set_version(&tx, migration.version));
        if let Err(source) = result {
            tracing::error!(
                version = migration.version,
                description = migration.description,
                error = %source,
                "Migration failed - database unchanged"
            );
            return Err(MigrationError::Failed {
                version: migration.version,
                description: migration.description,
                source,
            });
        }
        tx.commit()?;

        tracing::info!(
            version = migration.version,
            description = migration.description,
            "Migration completed"
        );
        applied.push(migration.version);
    }

    let to_version = get_version(conn)?;
    tracing::info!(from_version, to_version, "Database migrated");

    Ok(MigrationReport {
        from_version,
        to_version,
        applied,
    })
}

/// Presence, declared type and default of every expected column
pub fn verify_schema(conn: &Connection) -> rusqlite::Result<Vec<ColumnCheck>> {
    let mut stmt = conn.prepare(
        "SELECT type, dflt_value, \"notnull\" FROM pragma_table_info(?1) WHERE name = ?2",
    )?;

    EXPECTED_COLUMNS
        .iter()
        .map(|&(table, column)| {
            let info: Option<(String, Option<String>, bool)> = stmt
                .query_row(params![table, column], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .optional()?;

            Ok(match info {
                Some((declared_type, default, not_null)) => ColumnCheck {
                    table,
                    column,
                    present: true,
                    declared_type: Some(declared_type),
                    default,
                    not_null,
                },
                None => ColumnCheck {
                    table,
                    column,
                    present: false,
                    declared_type: None,
                    default: None,
                    not_null: false,
                },
            })
        })
        .collect()
}

/// Every `CREATE` statement in the database, for comparing schemas
pub fn schema_snapshot(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT sql FROM sqlite_master WHERE sql IS NOT NULL ORDER BY type, name",
    )?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM pragma_table_info(?1) WHERE name = ?2",
        params![table, column],
        |row| row.get(0),
    )
}

/// `ALTER TABLE .. ADD COLUMN` unless the column is already there
///
/// Returns whether the column was added. `table`, `column` and `decl` are
/// compile-time constants; they are never built from input.
fn add_column_if_missing(
    conn: &Connection,
    table: &'static str,
    column: &'static str,
    decl: &'static str,
) -> rusqlite::Result<bool> {
    if column_exists(conn, table, column)? {
        tracing::debug!(table, column, "Column already present");
        return Ok(false);
    }

    conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))?;
    tracing::info!(table, column, "Added column");
    Ok(true)
}

// ============================================================================
// Migration Functions
// ============================================================================

/// Migration 1: tables as the first release created them.
///
/// Databases created by older releases already have some of these tables;
/// for them this is a no-op and later steps fill in missing columns.
fn migration_001_baseline(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT,
            credits INTEGER NOT NULL DEFAULT 0 CHECK (credits >= 0)
        );

        CREATE TABLE IF NOT EXISTS payments (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            amount INTEGER NOT NULL,
            currency TEXT NOT NULL,
            credits INTEGER NOT NULL,
            provider TEXT NOT NULL,
            provider_payment_id TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at INTEGER NOT NULL,
            settled_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS attempts (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            started_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tickets (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open',
            created_at INTEGER NOT NULL
        );",
    )
}

/// Migration 2: per-attempt counters.
fn migration_002_attempt_counters(conn: &Connection) -> rusqlite::Result<()> {
    add_column_if_missing(conn, "attempts", "credits_paid", "INTEGER NOT NULL DEFAULT 0")?;
    add_column_if_missing(
        conn,
        "attempts",
        "questions_submitted",
        "INTEGER NOT NULL DEFAULT 0",
    )?;
    add_column_if_missing(conn, "attempts", "updated_at", "INTEGER")?;

    // Legacy columns may have been declared without NOT NULL
    conn.execute_batch(
        "UPDATE attempts SET credits_paid = 0 WHERE credits_paid IS NULL;
         UPDATE attempts SET questions_submitted = 0 WHERE questions_submitted IS NULL;
         UPDATE attempts SET updated_at = started_at WHERE updated_at IS NULL;
         CREATE INDEX IF NOT EXISTS idx_attempts_user ON attempts(user_id);
         CREATE INDEX IF NOT EXISTS idx_attempts_updated ON attempts(updated_at);",
    )
}

/// Migration 3: ticket responses as a JSON array.
fn migration_003_ticket_responses(conn: &Connection) -> rusqlite::Result<()> {
    add_column_if_missing(conn, "tickets", "responses", "TEXT NOT NULL DEFAULT '[]'")?;

    conn.execute_batch(
        "UPDATE tickets SET responses = '[]' WHERE responses IS NULL OR responses = '';
         CREATE INDEX IF NOT EXISTS idx_tickets_user ON tickets(user_id);",
    )
}

/// Migration 4: webhook lookup and reconciliation indexes.
fn migration_004_payment_indexes(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_payments_provider_ref
             ON payments(provider, provider_payment_id)
             WHERE provider_payment_id IS NOT NULL;
         CREATE INDEX IF NOT EXISTS idx_payments_status_created
             ON payments(status, created_at);
         CREATE INDEX IF NOT EXISTS idx_payments_user ON payments(user_id);",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn latest_version() -> i32 {
        MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
    }

    #[test]
    fn test_get_set_version() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(get_version(&conn).unwrap(), 0);

        set_version(&conn, 5).unwrap();
        assert_eq!(get_version(&conn).unwrap(), 5);
    }

    #[test]
    fn test_fresh_database_reaches_latest_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        let report = run_migrations(&mut conn).unwrap();

        assert_eq!(report.from_version, 0);
        assert_eq!(report.to_version, latest_version());
        assert_eq!(report.applied.len(), MIGRATIONS.len());
        assert!(verify_schema(&conn).unwrap().iter().all(|c| c.present));
    }

    #[test]
    fn test_already_current_is_noop() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();

        let report = run_migrations(&mut conn).unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.from_version, report.to_version);
    }

    #[test]
    fn test_rerun_after_version_reset_yields_identical_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        let before = schema_snapshot(&conn).unwrap();

        set_version(&conn, 0).unwrap();
        let report = run_migrations(&mut conn).unwrap();

        assert_eq!(report.applied.len(), MIGRATIONS.len());
        assert_eq!(schema_snapshot(&conn).unwrap(), before);
    }

    #[test]
    fn test_legacy_credits_paid_column_left_unchanged() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE attempts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                credits_paid INTEGER
            );
            INSERT INTO attempts (id, user_id, started_at, credits_paid) VALUES ('a1', 'u1', 1000, NULL);
            INSERT INTO attempts (id, user_id, started_at, credits_paid) VALUES ('a2', 'u1', 2000, 7);",
        )
        .unwrap();

        run_migrations(&mut conn).unwrap();

        let check = verify_schema(&conn)
            .unwrap()
            .into_iter()
            .find(|c| c.table == "attempts" && c.column == "credits_paid")
            .unwrap();
        assert!(check.present);
        assert_eq!(check.declared_type.as_deref(), Some("INTEGER"));
        assert!(!check.not_null);
        assert_eq!(check.default, None);

        let rows: Vec<(String, i64, i64, i64)> = conn
            .prepare("SELECT id, credits_paid, questions_submitted, updated_at FROM attempts ORDER BY id")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(
            rows,
            vec![("a1".to_string(), 0, 0, 1000), ("a2".to_string(), 7, 0, 2000)]
        );
    }

    #[test]
    fn test_null_ticket_responses_backfilled() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE tickets (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                created_at INTEGER NOT NULL,
                responses TEXT
            );
            INSERT INTO tickets (id, user_id, subject, created_at, responses)
                VALUES ('t1', 'u1', 'Refund', 1000, NULL);",
        )
        .unwrap();

        run_migrations(&mut conn).unwrap();

        let responses: String = conn
            .query_row("SELECT responses FROM tickets WHERE id = 't1'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(responses, "[]");
    }

    #[test]
    fn test_verify_schema_reports_missing_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE users (id TEXT PRIMARY KEY)").unwrap();

        let checks = verify_schema(&conn).unwrap();
        let id = checks.iter().find(|c| c.table == "users" && c.column == "id").unwrap();
        assert!(id.present);
        assert_eq!(id.declared_type.as_deref(), Some("TEXT"));

        let credits = checks
            .iter()
            .find(|c| c.table == "users" && c.column == "credits")
            .unwrap();
        assert!(!credits.present);
        assert!(checks.iter().filter(|c| c.table == "payments").all(|c| !c.present));
    }

    #[test]
    fn test_duplicate_provider_reference_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();

        let insert = "INSERT INTO payments (id, user_id, amount, currency, credits, provider, provider_payment_id, created_at)
                      VALUES (?1, 'u1', 1000, 'sgd', 10, 'stripe', 'cs_1', 0)";
        conn.execute(insert, params!["p1"]).unwrap();
        assert!(conn.execute(insert, params!["p2"]).is_err());
    }
}
