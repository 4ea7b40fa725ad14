//! Webhook Handling
//!
//! Verify first, then settle. A delivery with a bad signature never reaches
//! the store; a redelivery for a payment that is already terminal is a
//! successful no-op.

use serde::Serialize;
use std::sync::Arc;

use crate::error::{PaymentError, Result};
use crate::payment::{PaymentStatus, PaymentStore, ProviderKind, SettleOutcome};
use crate::provider::{GatewaySet, WebhookNotice};

/// What processing a delivery did
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Status moved to terminal now
    Applied {
        payment_id: String,
        status: PaymentStatus,
        credits_added: i64,
    },

    /// Redelivery for a payment that was already terminal
    AlreadySettled {
        payment_id: String,
        status: PaymentStatus,
    },

    /// Authentic event we have nothing to do for
    Ignored { event_type: String },
}

/// Webhook processor
pub struct WebhookProcessor<S: PaymentStore> {
    store: Arc<S>,
    gateways: GatewaySet,
}

impl<S: PaymentStore> WebhookProcessor<S> {
    pub fn new(store: Arc<S>, gateways: GatewaySet) -> Self {
        Self { store, gateways }
    }

    /// Verify and apply one delivery
    pub fn process(
        &self,
        provider: ProviderKind,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookOutcome> {
        let gateway = self.gateways.require(provider)?;

        let notice = match gateway.verify_webhook(body, signature) {
            Ok(notice) => notice,
            Err(e) => {
                tracing::warn!(provider = %provider, error = %e, "Rejected webhook delivery");
                return Err(e);
            }
        };

        let settlement = match notice {
            WebhookNotice::Settle(settlement) => settlement,
            WebhookNotice::Ignored { event_type } => {
                tracing::debug!(provider = %provider, event_type = %event_type, "Unhandled webhook event");
                return Ok(WebhookOutcome::Ignored { event_type });
            }
        };

        // The adapter decides the provider tag; never trust a mismatch
        if settlement.provider != provider {
            return Err(PaymentError::WebhookParse(format!(
                "{} notice delivered to {} endpoint",
                settlement.provider, provider
            )));
        }

        let outcome = self.store.settle(&settlement)?;
        Ok(match outcome {
            SettleOutcome::Applied(payment) => {
                let credits_added = if payment.status == PaymentStatus::Completed {
                    payment.credits
                } else {
                    0
                };
                tracing::info!(
                    payment_id = %payment.id,
                    user_id = %payment.user_id,
                    provider = %provider,
                    status = %payment.status,
                    credits_added,
                    "Settled payment"
                );
                WebhookOutcome::Applied {
                    payment_id: payment.id,
                    status: payment.status,
                    credits_added,
                }
            }
            SettleOutcome::AlreadySettled(payment) => {
                tracing::info!(
                    payment_id = %payment.id,
                    provider = %provider,
                    status = %payment.status,
                    "Duplicate webhook for settled payment - ignoring"
                );
                WebhookOutcome::AlreadySettled {
                    payment_id: payment.id,
                    status: payment.status,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::{MemoryPaymentStore, NewPayment};
    use crate::provider::testing::FakeGateway;

    fn setup(kind: ProviderKind) -> (Arc<MemoryPaymentStore>, WebhookProcessor<MemoryPaymentStore>, String) {
        let store = Arc::new(MemoryPaymentStore::new());
        let payment = store
            .create_pending(NewPayment {
                user_id: "user-1".into(),
                amount: 1000,
                currency: "sgd".into(),
                credits: 10,
                provider: kind,
            })
            .unwrap();
        store.attach_provider_id(&payment.id, "prov_1").unwrap();

        let processor = WebhookProcessor::new(
            store.clone(),
            GatewaySet::new().with(Arc::new(FakeGateway::new(kind))),
        );
        (store, processor, payment.id)
    }

    #[test]
    fn test_two_identical_deliveries_credit_once() {
        let (store, processor, payment_id) = setup(ProviderKind::HitPay);

        let first = processor
            .process(ProviderKind::HitPay, b"completed:prov_1", Some("ok"))
            .unwrap();
        let second = processor
            .process(ProviderKind::HitPay, b"completed:prov_1", Some("ok"))
            .unwrap();

        assert_eq!(
            first,
            WebhookOutcome::Applied {
                payment_id: payment_id.clone(),
                status: PaymentStatus::Completed,
                credits_added: 10,
            }
        );
        assert_eq!(
            second,
            WebhookOutcome::AlreadySettled {
                payment_id,
                status: PaymentStatus::Completed,
            }
        );
        assert_eq!(store.balance("user-1").unwrap(), 10);
    }

    #[test]
    fn test_invalid_signature_changes_nothing() {
        let (store, processor, payment_id) = setup(ProviderKind::HitPay);

        let err = processor
            .process(ProviderKind::HitPay, b"completed:prov_1", Some("forged"))
            .unwrap_err();

        assert!(matches!(err, PaymentError::WebhookSignature(_)));
        assert_eq!(store.get(&payment_id).unwrap().unwrap().status, PaymentStatus::Pending);
        assert_eq!(store.balance("user-1").unwrap(), 0);
    }

    #[test]
    fn test_failed_notice_adds_no_credit() {
        let (store, processor, _) = setup(ProviderKind::Stripe);
        let outcome = processor
            .process(ProviderKind::Stripe, b"failed:prov_1", Some("ok"))
            .unwrap();

        assert!(matches!(
            outcome,
            WebhookOutcome::Applied { status: PaymentStatus::Failed, credits_added: 0, .. }
        ));
        assert_eq!(store.balance("user-1").unwrap(), 0);
    }

    #[test]
    fn test_disabled_provider_endpoint_rejected() {
        let (_, processor, _) = setup(ProviderKind::Stripe);
        assert!(matches!(
            processor.process(ProviderKind::HitPay, b"completed:prov_1", Some("ok")),
            Err(PaymentError::ProviderDisabled(_))
        ));
    }

    #[test]
    fn test_ignored_event_passes_through() {
        let (_, processor, _) = setup(ProviderKind::Stripe);
        let outcome = processor
            .process(ProviderKind::Stripe, b"refreshed:prov_1", Some("ok"))
            .unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Ignored {
                event_type: "refreshed".into()
            }
        );
    }

    #[test]
    fn test_unknown_payment_reported() {
        let (_, processor, _) = setup(ProviderKind::Stripe);
        assert!(matches!(
            processor.process(ProviderKind::Stripe, b"completed:prov_other", Some("ok")),
            Err(PaymentError::PaymentNotFound(_))
        ));
    }
}
