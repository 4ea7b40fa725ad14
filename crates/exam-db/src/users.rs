//! User credit balances.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::{DbError, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub credits: i64,
}

/// Insert the user if missing; a provided email replaces the stored one
pub fn ensure_user(conn: &Connection, user_id: &str, email: Option<&str>) -> Result<User> {
    conn.execute(
        "INSERT INTO users (id, email, credits) VALUES (?1, ?2, 0)
         ON CONFLICT(id) DO UPDATE SET email = COALESCE(excluded.email, users.email)",
        params![user_id, email],
    )?;
    get_user(conn, user_id)?.ok_or_else(|| DbError::not_found("user", user_id))
}

pub fn get_user(conn: &Connection, user_id: &str) -> Result<Option<User>> {
    Ok(conn
        .query_row(
            "SELECT id, email, credits FROM users WHERE id = ?1",
            params![user_id],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    credits: row.get(2)?,
                })
            },
        )
        .optional()?)
}

/// Current balance; unknown users have none
pub fn balance(conn: &Connection, user_id: &str) -> Result<i64> {
    Ok(conn
        .query_row(
            "SELECT credits FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0))
}

/// Add credits, creating the user row on first purchase
pub(crate) fn add_credits(conn: &Connection, user_id: &str, credits: i64) -> Result<()> {
    if credits < 0 {
        return Err(DbError::InvalidInput(format!("negative credit grant {credits}")));
    }
    conn.execute(
        "INSERT INTO users (id, credits) VALUES (?1, ?2)
         ON CONFLICT(id) DO UPDATE SET credits = users.credits + excluded.credits",
        params![user_id, credits],
    )?;
    Ok(())
}

/// Take credits, refusing to go below zero; returns the new balance
pub(crate) fn debit_credits(conn: &Connection, user_id: &str, credits: i64) -> Result<i64> {
    let current = balance(conn, user_id)?;
    if current < credits {
        return Err(DbError::InsufficientCredits {
            user_id: user_id.to_string(),
            balance: current,
            required: credits,
        });
    }
    conn.execute(
        "UPDATE users SET credits = credits - ?2 WHERE id = ?1",
        params![user_id, credits],
    )?;
    Ok(current - credits)
}
