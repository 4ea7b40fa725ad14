//! Support tickets with an append-only response log.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::{DbError, Result};
use crate::{from_millis, to_millis};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketResponse {
    pub responder: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Ticket {
    pub id: String,
    pub user_id: String,
    pub subject: String,
    pub status: String,
    pub responses: Vec<TicketResponse>,
    pub created_at: DateTime<Utc>,
}

fn ticket_from_row(row: &Row) -> rusqlite::Result<Ticket> {
    let raw: Option<String> = row.get(4)?;
    let responses = match raw.as_deref() {
        None | Some("") => Vec::new(),
        Some(json) => serde_json::from_str(json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e)))?,
    };
    Ok(Ticket {
        id: row.get(0)?,
        user_id: row.get(1)?,
        subject: row.get(2)?,
        status: row.get(3)?,
        responses,
        created_at: from_millis(row.get(5)?)?,
    })
}

pub fn create_ticket(conn: &Connection, user_id: &str, subject: &str) -> Result<Ticket> {
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO tickets (id, user_id, subject, status, responses, created_at)
         VALUES (?1, ?2, ?3, 'open', '[]', ?4)",
        params![id, user_id, subject, to_millis(Utc::now())],
    )?;
    get_ticket(conn, &id)?.ok_or_else(|| DbError::not_found("ticket", id))
}

pub fn get_ticket(conn: &Connection, ticket_id: &str) -> Result<Option<Ticket>> {
    Ok(conn
        .query_row(
            "SELECT id, user_id, subject, status, responses, created_at FROM tickets WHERE id = ?1",
            params![ticket_id],
            ticket_from_row,
        )
        .optional()?)
}

/// Append one response in a single statement so concurrent appends both land
pub fn append_response(
    conn: &Connection,
    ticket_id: &str,
    responder: &str,
    message: &str,
) -> Result<Ticket> {
    let response = TicketResponse {
        responder: responder.to_string(),
        message: message.to_string(),
        created_at: Utc::now(),
    };
    let json = serde_json::to_string(&response)
        .map_err(|e| DbError::InvalidInput(format!("ticket response: {e}")))?;

    let changed = conn.execute(
        "UPDATE tickets
            SET responses = json_insert(COALESCE(NULLIF(responses, ''), '[]'), '$[#]', json(?2))
          WHERE id = ?1",
        params![ticket_id, json],
    )?;
    if changed == 0 {
        return Err(DbError::not_found("ticket", ticket_id));
    }

    get_ticket(conn, ticket_id)?.ok_or_else(|| DbError::not_found("ticket", ticket_id))
}
