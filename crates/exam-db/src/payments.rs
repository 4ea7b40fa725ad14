//! SQLite payment store.
//!
//! Settlement is a compare-and-set inside one `BEGIN IMMEDIATE` transaction:
//! the status update only matches `status = 'pending'`, and the credit is
//! applied in the same transaction only when that update changed a row. The
//! guard lives in the database, so it holds across restarts and across
//! server instances sharing the file.

use chrono::{DateTime, Utc};
use exam_payments::{
    NewPayment, Payment, PaymentError, PaymentStatus, PaymentStore, ProviderKind, SettleOutcome,
    Settlement,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::error::{DbError, Result};
use crate::{from_millis, to_millis, users, Database};

const PAYMENT_COLS: &str = "id, user_id, amount, currency, credits, provider, provider_payment_id, status, created_at, settled_at";

fn payment_from_row(row: &Row) -> rusqlite::Result<Payment> {
    let provider: String = row.get(5)?;
    let status: String = row.get(7)?;
    Ok(Payment {
        id: row.get(0)?,
        user_id: row.get(1)?,
        amount: row.get(2)?,
        currency: row.get(3)?,
        credits: row.get(4)?,
        provider: provider.parse().map_err(|_| invalid_text(5, "provider"))?,
        provider_payment_id: row.get(6)?,
        status: status.parse().map_err(|_| invalid_text(7, "status"))?,
        created_at: from_millis(row.get(8)?)?,
        settled_at: row.get::<_, Option<i64>>(9)?.map(from_millis).transpose()?,
    })
}

fn invalid_text(col: usize, name: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(col, name.to_string(), rusqlite::types::Type::Text)
}

fn get_payment(conn: &Connection, payment_id: &str) -> Result<Option<Payment>> {
    Ok(conn
        .query_row(
            &format!("SELECT {PAYMENT_COLS} FROM payments WHERE id = ?1"),
            params![payment_id],
            payment_from_row,
        )
        .optional()?)
}

fn find_by_provider(
    conn: &Connection,
    provider: ProviderKind,
    provider_payment_id: &str,
) -> Result<Option<Payment>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {PAYMENT_COLS} FROM payments WHERE provider = ?1 AND provider_payment_id = ?2"
            ),
            params![provider.as_str(), provider_payment_id],
            payment_from_row,
        )
        .optional()?)
}

/// Database-backed [`PaymentStore`]
#[derive(Clone, Debug)]
pub struct SqlitePaymentStore {
    db: Database,
}

impl SqlitePaymentStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn settle_in_tx(&self, settlement: &Settlement) -> Result<std::result::Result<SettleOutcome, PaymentError>> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let by_provider = match &settlement.provider_payment_id {
            Some(id) => find_by_provider(&tx, settlement.provider, id)?,
            None => None,
        };
        let payment = match by_provider {
            Some(payment) => Some(payment),
            None => match &settlement.reference {
                Some(reference) => get_payment(&tx, reference)?
                    .filter(|p| p.provider == settlement.provider),
                None => None,
            },
        };
        let Some(payment) = payment else {
            return Ok(Err(PaymentError::PaymentNotFound(settlement.lookup_key())));
        };

        if !payment.status.can_transition_to(settlement.status) {
            return Ok(Ok(SettleOutcome::AlreadySettled(payment)));
        }
        if let Err(e) = settlement.check_amount(&payment) {
            return Ok(Err(e));
        }

        let settled_at = Utc::now();
        let changed = tx.execute(
            "UPDATE payments
                SET status = ?2,
                    settled_at = ?3,
                    provider_payment_id = COALESCE(provider_payment_id, ?4)
              WHERE id = ?1 AND status = 'pending'",
            params![
                payment.id,
                settlement.status.as_str(),
                to_millis(settled_at),
                settlement.provider_payment_id,
            ],
        )?;

        // Lost the race to another writer; report what it wrote
        if changed == 0 {
            let current = get_payment(&tx, &payment.id)?
                .ok_or_else(|| DbError::not_found("payment", payment.id.clone()))?;
            return Ok(Ok(SettleOutcome::AlreadySettled(current)));
        }

        if settlement.status == PaymentStatus::Completed {
            users::add_credits(&tx, &payment.user_id, payment.credits)?;
        }

        let updated = get_payment(&tx, &payment.id)?
            .ok_or_else(|| DbError::not_found("payment", payment.id.clone()))?;
        tx.commit()?;

        Ok(Ok(SettleOutcome::Applied(updated)))
    }
}

impl PaymentStore for SqlitePaymentStore {
    fn create_pending(&self, payment: NewPayment) -> exam_payments::Result<Payment> {
        let payment = payment.into_payment(Utc::now());
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO payments (id, user_id, amount, currency, credits, provider, provider_payment_id, status, created_at, settled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, NULL)",
            params![
                payment.id,
                payment.user_id,
                payment.amount,
                payment.currency,
                payment.credits,
                payment.provider.as_str(),
                payment.status.as_str(),
                to_millis(payment.created_at),
            ],
        )
        .map_err(DbError::from)?;

        tracing::debug!(payment_id = %payment.id, provider = %payment.provider, "Created pending payment");
        Ok(payment)
    }

    fn attach_provider_id(&self, payment_id: &str, provider_payment_id: &str) -> exam_payments::Result<()> {
        let conn = self.db.conn()?;
        let changed = conn
            .execute(
                "UPDATE payments SET provider_payment_id = ?2
                  WHERE id = ?1 AND (provider_payment_id IS NULL OR provider_payment_id = ?2)",
                params![payment_id, provider_payment_id],
            )
            .map_err(DbError::from)?;

        if changed == 0 {
            return match get_payment(&conn, payment_id)? {
                None => Err(PaymentError::PaymentNotFound(payment_id.to_string())),
                Some(existing) => Err(PaymentError::Storage(format!(
                    "payment {payment_id} already linked to {}",
                    existing.provider_payment_id.unwrap_or_default()
                ))),
            };
        }
        Ok(())
    }

    fn get(&self, payment_id: &str) -> exam_payments::Result<Option<Payment>> {
        let conn = self.db.conn()?;
        Ok(get_payment(&conn, payment_id)?)
    }

    fn find_by_provider_id(
        &self,
        provider: ProviderKind,
        provider_payment_id: &str,
    ) -> exam_payments::Result<Option<Payment>> {
        let conn = self.db.conn()?;
        Ok(find_by_provider(&conn, provider, provider_payment_id)?)
    }

    fn settle(&self, settlement: &Settlement) -> exam_payments::Result<SettleOutcome> {
        Ok(self.settle_in_tx(settlement)??)
    }

    fn list_pending(
        &self,
        providers: &[ProviderKind],
        created_after: DateTime<Utc>,
        after_id: Option<&str>,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> exam_payments::Result<Vec<Payment>> {
        if providers.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (0..providers.len())
            .map(|i| format!("?{}", i + 5))
            .collect::<Vec<_>>()
            .join(", ");
        let mut values = vec![
            Value::Integer(to_millis(created_after)),
            after_id.map_or(Value::Null, |id| Value::Text(id.to_string())),
            Value::Integer(to_millis(created_before)),
            Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)),
        ];
        values.extend(providers.iter().map(|p| Value::Text(p.as_str().to_string())));

        let conn = self.db.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {PAYMENT_COLS} FROM payments
                  WHERE status = 'pending'
                    AND provider_payment_id IS NOT NULL
                    AND provider IN ({placeholders})
                    AND (created_at > ?1 OR (created_at = ?1 AND (?2 IS NULL OR id > ?2)))
                    AND created_at < ?3
                  ORDER BY created_at ASC, id ASC
                  LIMIT ?4"
            ))
            .map_err(DbError::from)?;
        let rows = stmt
            .query_map(params_from_iter(values), payment_from_row)
            .map_err(DbError::from)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(DbError::from)?;
        Ok(rows)
    }

    fn expire_unlinked(&self, created_before: DateTime<Utc>) -> exam_payments::Result<usize> {
        let conn = self.db.conn()?;
        let changed = conn
            .execute(
                "UPDATE payments SET status = 'failed', settled_at = ?2
                  WHERE status = 'pending' AND provider_payment_id IS NULL AND created_at < ?1",
                params![to_millis(created_before), to_millis(Utc::now())],
            )
            .map_err(DbError::from)?;
        Ok(changed)
    }

    fn balance(&self, user_id: &str) -> exam_payments::Result<i64> {
        let conn = self.db.conn()?;
        Ok(users::balance(&conn, user_id)?)
    }
}
