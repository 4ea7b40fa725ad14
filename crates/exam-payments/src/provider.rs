//! Payment Provider Abstraction
//!
//! One capability trait for every processor, plus the set of gateways the
//! running process offers. The set is built once from configuration: a
//! provider switched off by its feature flag is simply absent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::PaymentsConfig;
use crate::error::{PaymentError, Result};
use crate::hitpay::HitPayGateway;
use crate::payment::{PaymentStatus, ProviderKind, Settlement};
use crate::stripe::StripeGateway;

/// Request to create a charge with a provider
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChargeRequest {
    /// Our payment ID, sent as the provider reference
    pub payment_id: String,

    pub user_id: String,

    /// Amount in minor currency units
    pub amount: i64,

    /// ISO currency code, lowercase
    pub currency: String,

    /// Line item name shown on the provider page
    pub description: String,

    #[serde(default)]
    pub customer_email: Option<String>,

    /// URL to redirect after successful payment
    pub success_url: String,

    /// URL to redirect if checkout is cancelled
    pub cancel_url: String,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A charge created on the provider side
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Charge {
    /// Provider ID used to match webhooks
    pub provider_payment_id: String,

    /// Hosted page to send the user to
    pub redirect_url: String,
}

/// What a verified webhook asks us to do
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WebhookNotice {
    /// Move a payment to a terminal status
    Settle(Settlement),

    /// Authentic but irrelevant event
    Ignored { event_type: String },
}

/// Payment provider trait (Strategy pattern)
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Create a hosted charge and return where to redirect the user
    async fn create_charge(&self, request: &ChargeRequest) -> Result<Charge>;

    /// Authenticate a webhook delivery and translate it
    ///
    /// Must fail before any state is touched when the signature is wrong.
    fn verify_webhook(&self, body: &[u8], signature: Option<&str>) -> Result<WebhookNotice>;

    /// Ask the provider for the current status of a charge
    async fn fetch_status(&self, provider_payment_id: &str) -> Result<PaymentStatus>;
}

/// Gateways offered by this process, one slot per provider
#[derive(Clone, Default)]
pub struct GatewaySet {
    stripe: Option<Arc<dyn PaymentGateway>>,
    hitpay: Option<Arc<dyn PaymentGateway>>,
}

impl GatewaySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the gateways that configuration enables
    pub fn from_config(config: &PaymentsConfig) -> Result<Self> {
        let mut set = Self::new();

        if let Some(stripe) = &config.stripe {
            set = set.with(Arc::new(StripeGateway::new(stripe)?));
        }

        if config.enable_hitpay {
            if let Some(hitpay) = &config.hitpay {
                set = set.with(Arc::new(HitPayGateway::new(hitpay)?));
            }
        }

        Ok(set)
    }

    /// Register a gateway in the slot for its provider
    pub fn with(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        match gateway.kind() {
            ProviderKind::Stripe => self.stripe = Some(gateway),
            ProviderKind::HitPay => self.hitpay = Some(gateway),
        }
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Option<&Arc<dyn PaymentGateway>> {
        match kind {
            ProviderKind::Stripe => self.stripe.as_ref(),
            ProviderKind::HitPay => self.hitpay.as_ref(),
        }
    }

    /// Like `get`, but a missing provider is an error
    pub fn require(&self, kind: ProviderKind) -> Result<&Arc<dyn PaymentGateway>> {
        self.get(kind)
            .ok_or_else(|| PaymentError::ProviderDisabled(kind.to_string()))
    }

    pub fn is_enabled(&self, kind: ProviderKind) -> bool {
        self.get(kind).is_some()
    }

    /// Enabled providers, primary first
    pub fn kinds(&self) -> Vec<ProviderKind> {
        ProviderKind::ALL
            .into_iter()
            .filter(|kind| self.is_enabled(*kind))
            .collect()
    }
}

impl std::fmt::Debug for GatewaySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewaySet")
            .field("providers", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable gateway for flow tests

    use super::*;
    use std::sync::Mutex;

    pub struct FakeGateway {
        pub kind: ProviderKind,
        pub fail_create: bool,
        pub status: Mutex<PaymentStatus>,
        pub created: Mutex<Vec<ChargeRequest>>,
    }

    impl FakeGateway {
        pub fn new(kind: ProviderKind) -> Self {
            Self {
                kind,
                fail_create: false,
                status: Mutex::new(PaymentStatus::Pending),
                created: Mutex::new(Vec::new()),
            }
        }

        pub fn failing(kind: ProviderKind) -> Self {
            Self {
                fail_create: true,
                ..Self::new(kind)
            }
        }
    }

    #[async_trait]
    impl PaymentGateway for FakeGateway {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn create_charge(&self, request: &ChargeRequest) -> Result<Charge> {
            if self.fail_create {
                return Err(PaymentError::provider("fake", "connection refused"));
            }
            self.created.lock().unwrap().push(request.clone());
            Ok(Charge {
                provider_payment_id: format!("fake_{}", request.payment_id),
                redirect_url: format!("https://pay.example/{}", request.payment_id),
            })
        }

        /// Accepts `status:provider_payment_id` bodies signed with "ok"
        fn verify_webhook(&self, body: &[u8], signature: Option<&str>) -> Result<WebhookNotice> {
            if signature != Some("ok") {
                return Err(PaymentError::WebhookSignature("bad signature".into()));
            }
            let body = String::from_utf8_lossy(body);
            let (status, id) = body
                .split_once(':')
                .ok_or_else(|| PaymentError::WebhookParse("expected status:id".into()))?;
            let status = match status {
                "completed" => PaymentStatus::Completed,
                "failed" => PaymentStatus::Failed,
                other => {
                    return Ok(WebhookNotice::Ignored {
                        event_type: other.to_string(),
                    })
                }
            };
            Ok(WebhookNotice::Settle(Settlement {
                provider: self.kind,
                provider_payment_id: Some(id.to_string()),
                reference: None,
                status,
                amount: None,
                currency: None,
            }))
        }

        async fn fetch_status(&self, _provider_payment_id: &str) -> Result<PaymentStatus> {
            Ok(*self.status.lock().unwrap())
        }
    }
}
