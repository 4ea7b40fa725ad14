//! Payment Records
//!
//! The payment row, its status machine, and the storage seam that webhook
//! settlement goes through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use crate::error::{PaymentError, Result};

/// Payment processors the app can charge through
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Stripe,
    HitPay,
}

impl ProviderKind {
    /// Every provider, primary first
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Stripe, ProviderKind::HitPay];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Stripe => "stripe",
            ProviderKind::HitPay => "hitpay",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "stripe" => Ok(ProviderKind::Stripe),
            "hitpay" => Ok(ProviderKind::HitPay),
            other => Err(PaymentError::ProviderDisabled(other.to_string())),
        }
    }
}

/// Payment lifecycle: `pending → completed | failed`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }

    /// Only pending payments move, and only to a terminal status
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        *self == PaymentStatus::Pending && next.is_terminal()
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(PaymentError::Storage(format!("unknown payment status '{other}'"))),
        }
    }
}

/// A payment row
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Our payment ID, also sent to the provider as its reference
    pub id: String,

    pub user_id: String,

    /// Amount in minor currency units
    pub amount: i64,

    /// ISO currency code, lowercase
    pub currency: String,

    /// Credits granted when the payment completes
    pub credits: i64,

    pub provider: ProviderKind,

    /// Provider-side ID (Stripe checkout session, HitPay payment request)
    pub provider_payment_id: Option<String>,

    pub status: PaymentStatus,

    pub created_at: DateTime<Utc>,

    pub settled_at: Option<DateTime<Utc>>,
}

/// Input for a new pending payment
#[derive(Clone, Debug)]
pub struct NewPayment {
    pub user_id: String,
    pub amount: i64,
    pub currency: String,
    pub credits: i64,
    pub provider: ProviderKind,
}

impl NewPayment {
    /// Build the pending row this input describes
    pub fn into_payment(self, now: DateTime<Utc>) -> Payment {
        Payment {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: self.user_id,
            amount: self.amount,
            currency: self.currency,
            credits: self.credits,
            provider: self.provider,
            provider_payment_id: None,
            status: PaymentStatus::Pending,
            created_at: now,
            settled_at: None,
        }
    }
}

/// A verified terminal status for one payment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settlement {
    pub provider: ProviderKind,

    /// Provider-side ID; absent only when settling by our own reference
    pub provider_payment_id: Option<String>,

    /// Our payment ID when the provider echoes it back
    pub reference: Option<String>,

    /// Terminal status to apply
    pub status: PaymentStatus,

    /// Amount reported by the provider, in minor units
    pub amount: Option<i64>,

    /// ISO currency code reported by the provider, any case
    pub currency: Option<String>,
}

impl Settlement {
    /// Identifier used in logs and not-found errors
    pub fn lookup_key(&self) -> String {
        self.provider_payment_id
            .clone()
            .or_else(|| self.reference.clone())
            .unwrap_or_else(|| "<none>".to_string())
    }

    /// Reject an amount or currency that disagrees with the stored payment
    pub fn check_amount(&self, payment: &Payment) -> Result<()> {
        if let Some(actual) = self.currency.as_deref() {
            if !actual.trim().eq_ignore_ascii_case(&payment.currency) {
                return Err(PaymentError::CurrencyMismatch {
                    payment_id: payment.id.clone(),
                    expected: payment.currency.clone(),
                    actual: actual.to_string(),
                });
            }
        }
        match self.amount {
            Some(actual) if actual != payment.amount => Err(PaymentError::AmountMismatch {
                payment_id: payment.id.clone(),
                expected: payment.amount,
                actual,
            }),
            _ => Ok(()),
        }
    }
}

/// Result of applying a settlement
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SettleOutcome {
    /// Status changed now; credits were added if it completed
    Applied(Payment),

    /// Payment was already terminal; nothing changed
    AlreadySettled(Payment),
}

impl SettleOutcome {
    pub fn payment(&self) -> &Payment {
        match self {
            SettleOutcome::Applied(p) | SettleOutcome::AlreadySettled(p) => p,
        }
    }
}

/// Payment storage trait
///
/// `settle` must change status and credit the user in one atomic unit so
/// concurrent deliveries of the same webhook cannot both observe `pending`.
pub trait PaymentStore: Send + Sync {
    /// Insert a pending payment
    fn create_pending(&self, payment: NewPayment) -> Result<Payment>;

    /// Record the provider-side ID once the charge exists
    fn attach_provider_id(&self, payment_id: &str, provider_payment_id: &str) -> Result<()>;

    /// Get payment by our ID
    fn get(&self, payment_id: &str) -> Result<Option<Payment>>;

    /// Get payment by provider reference
    fn find_by_provider_id(
        &self,
        provider: ProviderKind,
        provider_payment_id: &str,
    ) -> Result<Option<Payment>>;

    /// Apply a terminal status exactly once
    fn settle(&self, settlement: &Settlement) -> Result<SettleOutcome>;

    /// Pending payments that have a provider ID and belong to one of
    /// `providers`, ordered by `(created_at, id)`
    ///
    /// Rows start at `created_after` (inclusive) and stop before
    /// `created_before`. With `after_id`, rows created exactly at
    /// `created_after` must also sort after that ID, so a caller can resume
    /// from the last row of the previous page.
    fn list_pending(
        &self,
        providers: &[ProviderKind],
        created_after: DateTime<Utc>,
        after_id: Option<&str>,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Payment>>;

    /// Fail pending payments that never got a provider ID and were created
    /// before `created_before`; returns how many changed
    fn expire_unlinked(&self, created_before: DateTime<Utc>) -> Result<usize>;

    /// Current credit balance for a user (0 when unknown)
    fn balance(&self, user_id: &str) -> Result<i64>;
}

/// Run a synchronous store call on the blocking thread pool
///
/// SQLite writes can wait on `busy_timeout`; async workers must not.
pub(crate) async fn run_blocking<S, T, F>(store: &Arc<S>, call: F) -> Result<T>
where
    S: PaymentStore + 'static,
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || call(&store))
        .await
        .map_err(|e| PaymentError::Storage(format!("store task failed: {e}")))?
}

#[derive(Default)]
struct MemoryState {
    payments: HashMap<String, Payment>,
    by_provider: HashMap<(ProviderKind, String), String>,
    balances: HashMap<String, i64>,
}

/// In-memory payment store (for development and tests)
#[derive(Default)]
pub struct MemoryPaymentStore {
    state: RwLock<MemoryState>,
}

impl MemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> PaymentError {
        PaymentError::Storage("payment store lock poisoned".into())
    }
}

impl PaymentStore for MemoryPaymentStore {
    fn create_pending(&self, payment: NewPayment) -> Result<Payment> {
        let payment = payment.into_payment(Utc::now());
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;
        state.payments.insert(payment.id.clone(), payment.clone());
        Ok(payment)
    }

    fn attach_provider_id(&self, payment_id: &str, provider_payment_id: &str) -> Result<()> {
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;
        let provider = state
            .payments
            .get(payment_id)
            .map(|p| p.provider)
            .ok_or_else(|| PaymentError::PaymentNotFound(payment_id.to_string()))?;

        let key = (provider, provider_payment_id.to_string());
        if let Some(existing) = state.by_provider.get(&key) {
            if existing != payment_id {
                return Err(PaymentError::Storage(format!(
                    "{provider} payment {provider_payment_id} already linked"
                )));
            }
        }

        state.by_provider.insert(key, payment_id.to_string());
        if let Some(payment) = state.payments.get_mut(payment_id) {
            payment.provider_payment_id = Some(provider_payment_id.to_string());
        }
        Ok(())
    }

    fn get(&self, payment_id: &str) -> Result<Option<Payment>> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        Ok(state.payments.get(payment_id).cloned())
    }

    fn find_by_provider_id(
        &self,
        provider: ProviderKind,
        provider_payment_id: &str,
    ) -> Result<Option<Payment>> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        Ok(state
            .by_provider
            .get(&(provider, provider_payment_id.to_string()))
            .and_then(|id| state.payments.get(id))
            .cloned())
    }

    fn settle(&self, settlement: &Settlement) -> Result<SettleOutcome> {
        // One write guard covers the lookup, the status change and the credit
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;

        let by_provider = settlement
            .provider_payment_id
            .as_ref()
            .and_then(|id| state.by_provider.get(&(settlement.provider, id.clone())))
            .cloned();
        let payment_id = by_provider
            .or_else(|| {
                settlement.reference.as_ref().filter(|reference| {
                    state
                        .payments
                        .get(reference.as_str())
                        .is_some_and(|p| p.provider == settlement.provider)
                }).cloned()
            })
            .ok_or_else(|| PaymentError::PaymentNotFound(settlement.lookup_key()))?;

        let payment = state
            .payments
            .get(&payment_id)
            .cloned()
            .ok_or_else(|| PaymentError::PaymentNotFound(payment_id.clone()))?;

        if !payment.status.can_transition_to(settlement.status) {
            return Ok(SettleOutcome::AlreadySettled(payment));
        }
        settlement.check_amount(&payment)?;

        let mut updated = payment;
        updated.status = settlement.status;
        updated.settled_at = Some(Utc::now());
        if updated.provider_payment_id.is_none() {
            if let Some(provider_payment_id) = &settlement.provider_payment_id {
                updated.provider_payment_id = Some(provider_payment_id.clone());
                state.by_provider.insert(
                    (settlement.provider, provider_payment_id.clone()),
                    updated.id.clone(),
                );
            }
        }

        if updated.status == PaymentStatus::Completed {
            *state.balances.entry(updated.user_id.clone()).or_insert(0) += updated.credits;
        }
        state.payments.insert(updated.id.clone(), updated.clone());

        Ok(SettleOutcome::Applied(updated))
    }

    fn list_pending(
        &self,
        providers: &[ProviderKind],
        created_after: DateTime<Utc>,
        after_id: Option<&str>,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Payment>> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        let mut pending: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| {
                let past_start = match after_id {
                    Some(id) => (p.created_at, p.id.as_str()) > (created_after, id),
                    None => p.created_at >= created_after,
                };
                p.status == PaymentStatus::Pending
                    && p.provider_payment_id.is_some()
                    && providers.contains(&p.provider)
                    && past_start
                    && p.created_at < created_before
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        pending.truncate(limit);
        Ok(pending)
    }

    fn expire_unlinked(&self, created_before: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;
        let now = Utc::now();
        let mut expired = 0;
        for payment in state.payments.values_mut() {
            if payment.status == PaymentStatus::Pending
                && payment.provider_payment_id.is_none()
                && payment.created_at < created_before
            {
                payment.status = PaymentStatus::Failed;
                payment.settled_at = Some(now);
                expired += 1;
            }
        }
        Ok(expired)
    }

    fn balance(&self, user_id: &str) -> Result<i64> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        Ok(state.balances.get(user_id).copied().unwrap_or(0))
    }
}
