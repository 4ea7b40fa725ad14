//! Reconciliation Sweep
//!
//! Webhooks can be lost. Pending payments that have sat for a while are
//! checked against the provider and settled through the same path a webhook
//! would take, so a late webhook and a sweep can never both credit.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::Result;
use crate::payment::{run_blocking, PaymentStatus, PaymentStore, SettleOutcome, Settlement};
use crate::provider::GatewaySet;

/// Sweep tuning
#[derive(Clone, Copy, Debug)]
pub struct ReconcileSettings {
    /// Minimum age before a pending payment is checked
    pub after: Duration,

    /// Older payments are left alone; unlinked ones are failed
    pub give_up_after: Duration,

    /// Maximum payments checked per sweep
    pub batch: usize,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            after: Duration::minutes(30),
            give_up_after: Duration::hours(48),
            batch: 50,
        }
    }
}

/// Counters from one sweep
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub settled: usize,
    pub still_pending: usize,
    pub expired: usize,
    pub errors: usize,
}

pub struct Reconciler<S: PaymentStore> {
    store: Arc<S>,
    gateways: GatewaySet,
    settings: ReconcileSettings,

    /// `(created_at, id)` of the last payment checked; the next sweep
    /// resumes after it
    cursor: Mutex<Option<(DateTime<Utc>, String)>>,
}

impl<S: PaymentStore + 'static> Reconciler<S> {
    pub fn new(store: Arc<S>, gateways: GatewaySet, settings: ReconcileSettings) -> Self {
        Self {
            store,
            gateways,
            settings,
            cursor: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    pub async fn sweep(&self) -> Result<ReconcileReport> {
        self.sweep_at(Utc::now()).await
    }

    /// One sweep as of `now`
    ///
    /// Checks at most `batch` linked payments for enabled providers.
    /// Successive sweeps page through the window and start over once they
    /// reach its end, so payments the provider keeps reporting as pending
    /// cannot hide newer ones. Provider errors are counted and logged; the
    /// payment stays pending and is retried on a later pass. Storage errors
    /// abort the sweep.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let cutoff = now - self.settings.give_up_after;

        report.expired = run_blocking(&self.store, move |store| store.expire_unlinked(cutoff)).await?;
        if report.expired > 0 {
            tracing::info!(expired = report.expired, "Failed stale payments with no provider charge");
        }

        let providers = self.gateways.kinds();
        if providers.is_empty() {
            return Ok(report);
        }

        let resume = self
            .cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .filter(|(created_at, _)| *created_at >= cutoff);
        let (created_after, after_id) = match resume {
            Some((created_at, id)) => (created_at, Some(id)),
            None => (cutoff, None),
        };
        let created_before = now - self.settings.after;
        let batch = self.settings.batch;

        let pending = run_blocking(&self.store, move |store| {
            store.list_pending(&providers, created_after, after_id.as_deref(), created_before, batch)
        })
        .await?;

        *self.cursor.lock().unwrap_or_else(PoisonError::into_inner) = if pending.len() < batch {
            None
        } else {
            pending.last().map(|p| (p.created_at, p.id.clone()))
        };

        for payment in pending {
            let Some(provider_payment_id) = payment.provider_payment_id.clone() else {
                continue;
            };
            let Some(gateway) = self.gateways.get(payment.provider) else {
                continue;
            };

            report.checked += 1;
            let status = match gateway.fetch_status(&provider_payment_id).await {
                Ok(status) => status,
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(
                        payment_id = %payment.id,
                        provider = %payment.provider,
                        error = %e,
                        "Status check failed"
                    );
                    continue;
                }
            };

            if status == PaymentStatus::Pending {
                report.still_pending += 1;
                continue;
            }

            let settlement = Settlement {
                provider: payment.provider,
                provider_payment_id: Some(provider_payment_id),
                reference: Some(payment.id.clone()),
                status,
                amount: None,
                currency: None,
            };
            match run_blocking(&self.store, move |store| store.settle(&settlement)).await? {
                SettleOutcome::Applied(settled) => {
                    report.settled += 1;
                    tracing::info!(
                        payment_id = %settled.id,
                        user_id = %settled.user_id,
                        status = %settled.status,
                        "Reconciled payment"
                    );
                }
                SettleOutcome::AlreadySettled(_) => {}
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PaymentError;
    use crate::payment::{MemoryPaymentStore, NewPayment, ProviderKind};
    use crate::provider::testing::FakeGateway;
    use crate::provider::{Charge, ChargeRequest, PaymentGateway, WebhookNotice};
    use async_trait::async_trait;

    fn pending(store: &MemoryPaymentStore, provider_payment_id: Option<&str>) -> String {
        pending_with(store, ProviderKind::Stripe, provider_payment_id)
    }

    fn pending_with(
        store: &MemoryPaymentStore,
        provider: ProviderKind,
        provider_payment_id: Option<&str>,
    ) -> String {
        let payment = store
            .create_pending(NewPayment {
                user_id: "user-1".into(),
                amount: 1000,
                currency: "sgd".into(),
                credits: 10,
                provider,
            })
            .unwrap();
        if let Some(id) = provider_payment_id {
            store.attach_provider_id(&payment.id, id).unwrap();
        }
        payment.id
    }

    /// Completed for the listed charges, pending for everything else
    struct ScriptedGateway {
        completed: Vec<String>,
        checked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PaymentGateway for ScriptedGateway {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Stripe
        }

        async fn create_charge(&self, _request: &ChargeRequest) -> Result<Charge> {
            Err(PaymentError::provider("scripted", "unused"))
        }

        fn verify_webhook(&self, _body: &[u8], _signature: Option<&str>) -> Result<WebhookNotice> {
            Err(PaymentError::WebhookSignature("unused".into()))
        }

        async fn fetch_status(&self, provider_payment_id: &str) -> Result<PaymentStatus> {
            self.checked.lock().unwrap().push(provider_payment_id.to_string());
            if self.completed.iter().any(|id| id == provider_payment_id) {
                Ok(PaymentStatus::Completed)
            } else {
                Ok(PaymentStatus::Pending)
            }
        }
    }

    struct DownGateway;

    #[async_trait]
    impl PaymentGateway for DownGateway {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Stripe
        }

        async fn create_charge(&self, _request: &ChargeRequest) -> Result<Charge> {
            Err(PaymentError::provider("down", "unavailable"))
        }

        fn verify_webhook(&self, _body: &[u8], _signature: Option<&str>) -> Result<WebhookNotice> {
            Err(PaymentError::WebhookSignature("unused".into()))
        }

        async fn fetch_status(&self, _provider_payment_id: &str) -> Result<PaymentStatus> {
            Err(PaymentError::provider("down", "unavailable"))
        }
    }

    #[tokio::test]
    async fn test_sweep_settles_completed_payment_once() {
        let store = Arc::new(MemoryPaymentStore::new());
        let payment_id = pending(&store, Some("cs_1"));

        let gateway = Arc::new(FakeGateway::new(ProviderKind::Stripe));
        *gateway.status.lock().unwrap() = PaymentStatus::Completed;
        let reconciler = Reconciler::new(
            store.clone(),
            GatewaySet::new().with(gateway),
            ReconcileSettings::default(),
        );

        let later = Utc::now() + Duration::hours(1);
        let first = reconciler.sweep_at(later).await.unwrap();
        assert_eq!(first.checked, 1);
        assert_eq!(first.settled, 1);

        let second = reconciler.sweep_at(later).await.unwrap();
        assert_eq!(second.checked, 0);
        assert_eq!(store.balance("user-1").unwrap(), 10);
        assert_eq!(store.get(&payment_id).unwrap().unwrap().status, PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn test_young_payments_are_not_checked() {
        let store = Arc::new(MemoryPaymentStore::new());
        pending(&store, Some("cs_1"));
        let reconciler = Reconciler::new(
            store.clone(),
            GatewaySet::new().with(Arc::new(FakeGateway::new(ProviderKind::Stripe))),
            ReconcileSettings::default(),
        );

        let report = reconciler.sweep_at(Utc::now()).await.unwrap();
        assert_eq!(report, ReconcileReport::default());
    }

    #[tokio::test]
    async fn test_provider_error_leaves_payment_pending() {
        let store = Arc::new(MemoryPaymentStore::new());
        let payment_id = pending(&store, Some("cs_1"));
        let reconciler = Reconciler::new(
            store.clone(),
            GatewaySet::new().with(Arc::new(DownGateway)),
            ReconcileSettings::default(),
        );

        let report = reconciler.sweep_at(Utc::now() + Duration::hours(1)).await.unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.settled, 0);
        assert_eq!(store.get(&payment_id).unwrap().unwrap().status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_stale_unlinked_payment_expires() {
        let store = Arc::new(MemoryPaymentStore::new());
        let unlinked = pending(&store, None);
        let linked = pending(&store, Some("cs_1"));
        let reconciler = Reconciler::new(
            store.clone(),
            GatewaySet::new().with(Arc::new(FakeGateway::new(ProviderKind::Stripe))),
            ReconcileSettings::default(),
        );

        let report = reconciler.sweep_at(Utc::now() + Duration::hours(49)).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(store.get(&unlinked).unwrap().unwrap().status, PaymentStatus::Failed);
        // A linked payment may still get a late webhook
        assert_eq!(store.get(&linked).unwrap().unwrap().status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_still_pending_counted() {
        let store = Arc::new(MemoryPaymentStore::new());
        pending(&store, Some("cs_1"));
        let reconciler = Reconciler::new(
            store,
            GatewaySet::new().with(Arc::new(FakeGateway::new(ProviderKind::Stripe))),
            ReconcileSettings::default(),
        );

        let report = reconciler.sweep_at(Utc::now() + Duration::hours(1)).await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.still_pending, 1);
    }

    #[tokio::test]
    async fn test_unlinked_and_disabled_payments_do_not_crowd_out_linked_ones() {
        let store = Arc::new(MemoryPaymentStore::new());
        for i in 0..50 {
            pending(&store, None);
            pending_with(&store, ProviderKind::HitPay, Some(&format!("req_{i}")));
        }
        let paid = pending(&store, Some("cs_paid"));

        let gateway = Arc::new(FakeGateway::new(ProviderKind::Stripe));
        *gateway.status.lock().unwrap() = PaymentStatus::Completed;
        let reconciler = Reconciler::new(
            store.clone(),
            GatewaySet::new().with(gateway),
            ReconcileSettings::default(),
        );

        let report = reconciler.sweep_at(Utc::now() + Duration::hours(1)).await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.settled, 1);
        assert_eq!(store.get(&paid).unwrap().unwrap().status, PaymentStatus::Completed);
        assert_eq!(store.balance("user-1").unwrap(), 10);
    }

    #[tokio::test]
    async fn test_sweeps_page_past_payments_still_pending() {
        let store = Arc::new(MemoryPaymentStore::new());
        for i in 0..50 {
            pending(&store, Some(&format!("cs_wait_{i}")));
        }
        let paid = pending(&store, Some("cs_paid"));

        let gateway = Arc::new(ScriptedGateway {
            completed: vec!["cs_paid".into()],
            checked: Mutex::new(Vec::new()),
        });
        let reconciler = Reconciler::new(
            store.clone(),
            GatewaySet::new().with(gateway.clone()),
            ReconcileSettings::default(),
        );

        let later = Utc::now() + Duration::hours(1);
        let first = reconciler.sweep_at(later).await.unwrap();
        let second = reconciler.sweep_at(later).await.unwrap();

        assert_eq!(first.checked, 50);
        assert_eq!(first.checked + second.checked, 51);
        assert_eq!(first.settled + second.settled, 1);
        assert_eq!(store.get(&paid).unwrap().unwrap().status, PaymentStatus::Completed);
        assert_eq!(store.balance("user-1").unwrap(), 10);

        // Every charge was asked about exactly once across the two passes
        let mut checked = gateway.checked.lock().unwrap().clone();
        assert_eq!(checked.len(), 51);
        checked.sort();
        checked.dedup();
        assert_eq!(checked.len(), 51);

        // The next pass starts over from the oldest
        let third = reconciler.sweep_at(later).await.unwrap();
        assert_eq!(third.checked, 50);
        assert_eq!(third.still_pending, 50);
    }
}
