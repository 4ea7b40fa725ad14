//! Exam attempts.
//!
//! Counters only ever grow. A submission bumps them and debits the user in
//! the same transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;

use crate::error::{DbError, Result};
use crate::{from_millis, to_millis, users};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Attempt {
    pub id: String,
    pub user_id: String,
    pub credits_paid: i64,
    pub questions_submitted: i64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const ATTEMPT_COLS: &str =
    "id, user_id, credits_paid, questions_submitted, started_at, COALESCE(updated_at, started_at)";

fn attempt_from_row(row: &Row) -> rusqlite::Result<Attempt> {
    Ok(Attempt {
        id: row.get(0)?,
        user_id: row.get(1)?,
        credits_paid: row.get(2)?,
        questions_submitted: row.get(3)?,
        started_at: from_millis(row.get(4)?)?,
        updated_at: from_millis(row.get(5)?)?,
    })
}

pub fn start_attempt(conn: &Connection, user_id: &str) -> Result<Attempt> {
    let now = to_millis(Utc::now());
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO attempts (id, user_id, credits_paid, questions_submitted, started_at, updated_at)
         VALUES (?1, ?2, 0, 0, ?3, ?3)",
        params![id, user_id, now],
    )?;

    tracing::debug!(attempt_id = %id, user_id, "Started attempt");
    get_attempt(conn, &id)?.ok_or_else(|| DbError::not_found("attempt", id))
}

pub fn get_attempt(conn: &Connection, attempt_id: &str) -> Result<Option<Attempt>> {
    Ok(conn
        .query_row(
            &format!("SELECT {ATTEMPT_COLS} FROM attempts WHERE id = ?1"),
            params![attempt_id],
            attempt_from_row,
        )
        .optional()?)
}

/// Count one submitted question that cost `credits`
pub fn record_submission(conn: &mut Connection, attempt_id: &str, credits: i64) -> Result<Attempt> {
    if credits < 0 {
        return Err(DbError::InvalidInput(format!(
            "submission cost must not be negative, got {credits}"
        )));
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let attempt = get_attempt(&tx, attempt_id)?
        .ok_or_else(|| DbError::not_found("attempt", attempt_id))?;

    let remaining = users::debit_credits(&tx, &attempt.user_id, credits)?;
    tx.execute(
        "UPDATE attempts
            SET questions_submitted = questions_submitted + 1,
                credits_paid = credits_paid + ?2,
                updated_at = ?3
          WHERE id = ?1",
        params![attempt_id, credits, to_millis(Utc::now())],
    )?;
    let updated = get_attempt(&tx, attempt_id)?
        .ok_or_else(|| DbError::not_found("attempt", attempt_id))?;
    tx.commit()?;

    tracing::debug!(
        attempt_id,
        user_id = %updated.user_id,
        questions = updated.questions_submitted,
        remaining,
        "Recorded submission"
    );
    Ok(updated)
}

/// Most recent start or submission across all attempts
pub fn latest_activity(conn: &Connection) -> Result<Option<DateTime<Utc>>> {
    let millis: Option<i64> = conn.query_row(
        "SELECT MAX(COALESCE(updated_at, started_at)) FROM attempts",
        [],
        |row| row.get(0),
    )?;
    Ok(millis.map(from_millis).transpose()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrated_memory_db;

    #[test]
    fn test_start_attempt_has_zero_counters() {
        let db = migrated_memory_db();
        let conn = db.conn().unwrap();

        let attempt = start_attempt(&conn, "u1").unwrap();
        assert_eq!(attempt.credits_paid, 0);
        assert_eq!(attempt.questions_submitted, 0);
        assert_eq!(attempt.started_at, attempt.updated_at);
    }

    #[test]
    fn test_submission_debits_and_counts() {
        let db = migrated_memory_db();
        let mut conn = db.conn().unwrap();
        users::add_credits(&conn, "u1", 5).unwrap();

        let attempt = start_attempt(&conn, "u1").unwrap();
        record_submission(&mut conn, &attempt.id, 2).unwrap();
        let updated = record_submission(&mut conn, &attempt.id, 1).unwrap();

        assert_eq!(updated.questions_submitted, 2);
        assert_eq!(updated.credits_paid, 3);
        assert_eq!(users::balance(&conn, "u1").unwrap(), 2);
    }

    #[test]
    fn test_insufficient_balance_leaves_counters_alone() {
        let db = migrated_memory_db();
        let mut conn = db.conn().unwrap();
        users::add_credits(&conn, "u1", 1).unwrap();
        let attempt = start_attempt(&conn, "u1").unwrap();

        assert!(matches!(
            record_submission(&mut conn, &attempt.id, 2),
            Err(DbError::InsufficientCredits { .. })
        ));
        let unchanged = get_attempt(&conn, &attempt.id).unwrap().unwrap();
        assert_eq!(unchanged.questions_submitted, 0);
        assert_eq!(unchanged.credits_paid, 0);
        assert_eq!(users::balance(&conn, "u1").unwrap(), 1);
    }

    #[test]
    fn test_negative_cost_rejected() {
        let db = migrated_memory_db();
        let mut conn = db.conn().unwrap();
        let attempt = start_attempt(&conn, "u1").unwrap();
        assert!(matches!(
            record_submission(&mut conn, &attempt.id, -1),
            Err(DbError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_free_submission_allowed_without_balance() {
        let db = migrated_memory_db();
        let mut conn = db.conn().unwrap();
        let attempt = start_attempt(&conn, "u1").unwrap();

        let updated = record_submission(&mut conn, &attempt.id, 0).unwrap();
        assert_eq!(updated.questions_submitted, 1);
    }

    #[test]
    fn test_latest_activity() {
        let db = migrated_memory_db();
        let conn = db.conn().unwrap();
        assert_eq!(latest_activity(&conn).unwrap(), None);

        let attempt = start_attempt(&conn, "u1").unwrap();
        assert_eq!(latest_activity(&conn).unwrap(), Some(attempt.updated_at));
    }
}
