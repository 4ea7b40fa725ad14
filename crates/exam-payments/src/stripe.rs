//! Stripe Checkout Integration
//!
//! One-off credit purchases through Stripe's hosted Checkout page, and
//! verification of the `Stripe-Signature` header on webhook deliveries.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use stripe::{
    CheckoutSession as StripeCheckoutSession, CheckoutSessionId, CheckoutSessionMode,
    CheckoutSessionPaymentStatus, CheckoutSessionStatus, Client, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionLineItemsPriceData,
    CreateCheckoutSessionLineItemsPriceDataProductData, Currency,
};

use crate::config::StripeConfig;
use crate::error::{PaymentError, Result};
use crate::payment::{PaymentStatus, ProviderKind, Settlement};
use crate::provider::{Charge, ChargeRequest, PaymentGateway, WebhookNotice};
use crate::signature::{hmac_sha256_hex, signatures_match};

/// Maximum age of a webhook timestamp (Stripe recommends 5 minutes)
const WEBHOOK_TOLERANCE_SECS: i64 = 300;

/// Allowed clock skew for timestamps from the future
const WEBHOOK_FUTURE_SKEW_SECS: i64 = 60;

/// Stripe gateway
pub struct StripeGateway {
    client: Client,
    webhook_secret: String,
}

impl StripeGateway {
    pub fn new(config: &StripeConfig) -> Result<Self> {
        Ok(Self {
            client: Client::new(config.secret_key.clone()),
            webhook_secret: config.webhook_secret.clone(),
        })
    }

    /// Check `t=<ts>,v1=<sig>` against the body at time `now`
    fn verify_signature_at(&self, body: &[u8], header: &str, now: i64) -> Result<()> {
        let mut timestamp = None;
        let mut candidates = Vec::new();
        for part in header.split(',') {
            if let Some(t) = part.trim().strip_prefix("t=") {
                timestamp = Some(t);
            } else if let Some(sig) = part.trim().strip_prefix("v1=") {
                candidates.push(sig);
            }
        }

        let timestamp_str = timestamp
            .ok_or_else(|| PaymentError::WebhookSignature("missing timestamp".into()))?;
        if candidates.is_empty() {
            return Err(PaymentError::WebhookSignature("missing v1 signature".into()));
        }

        let timestamp: i64 = timestamp_str
            .parse()
            .map_err(|_| PaymentError::WebhookSignature("invalid timestamp".into()))?;
        let age = now
            .checked_sub(timestamp)
            .ok_or_else(|| PaymentError::WebhookSignature("invalid timestamp".into()))?;
        if age > WEBHOOK_TOLERANCE_SECS {
            return Err(PaymentError::WebhookSignature(format!(
                "timestamp too old ({age}s)"
            )));
        }
        if age < -WEBHOOK_FUTURE_SKEW_SECS {
            return Err(PaymentError::WebhookSignature(format!(
                "timestamp in the future ({age}s)"
            )));
        }

        let mut signed_payload = Vec::with_capacity(timestamp_str.len() + 1 + body.len());
        signed_payload.extend_from_slice(timestamp_str.as_bytes());
        signed_payload.push(b'.');
        signed_payload.extend_from_slice(body);
        let expected = hmac_sha256_hex(self.webhook_secret.as_bytes(), &signed_payload)?;

        // Stripe may send several v1 entries while a secret is being rolled
        if candidates.iter().any(|sig| signatures_match(&expected, sig)) {
            Ok(())
        } else {
            Err(PaymentError::WebhookSignature("signature mismatch".into()))
        }
    }

    fn verify_at(&self, body: &[u8], signature: Option<&str>, now: i64) -> Result<WebhookNotice> {
        let header = signature
            .ok_or_else(|| PaymentError::WebhookSignature("missing Stripe-Signature header".into()))?;
        self.verify_signature_at(body, header, now)?;

        let event: StripeEvent = serde_json::from_slice(body)
            .map_err(|e| PaymentError::WebhookParse(e.to_string()))?;
        tracing::debug!(event_id = %event.id, event_type = %event.event_type, "Verified Stripe webhook");

        let status = match event.event_type.as_str() {
            "checkout.session.completed" | "checkout.session.async_payment_succeeded" => {
                PaymentStatus::Completed
            }
            "checkout.session.async_payment_failed" | "checkout.session.expired" => {
                PaymentStatus::Failed
            }
            _ => {
                return Ok(WebhookNotice::Ignored {
                    event_type: event.event_type,
                })
            }
        };

        let session: StripeCheckoutObject = serde_json::from_value(event.data.object)
            .map_err(|e| PaymentError::WebhookParse(format!("invalid checkout session: {e}")))?;

        // A completed session with a delayed payment method is not paid yet
        if status == PaymentStatus::Completed
            && !matches!(session.payment_status.as_deref(), Some("paid" | "no_payment_required"))
        {
            return Ok(WebhookNotice::Ignored {
                event_type: format!("{} (unpaid)", event.event_type),
            });
        }

        let reference = session
            .client_reference_id
            .or_else(|| session.metadata.get("payment_id").cloned());

        Ok(WebhookNotice::Settle(Settlement {
            provider: ProviderKind::Stripe,
            provider_payment_id: Some(session.id),
            reference,
            status,
            amount: session.amount_total,
            currency: session.currency,
        }))
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Stripe
    }

    /// Create a Stripe Checkout session in one-off payment mode
    async fn create_charge(&self, request: &ChargeRequest) -> Result<Charge> {
        let currency = stripe_currency(&request.currency)?;

        let mut params = CreateCheckoutSession::new();
        params.customer_email = request.customer_email.as_deref();
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.client_reference_id = Some(&request.payment_id);
        params.mode = Some(CheckoutSessionMode::Payment);

        let mut metadata = request.metadata.clone();
        metadata.insert("payment_id".to_string(), request.payment_id.clone());
        metadata.insert("user_id".to_string(), request.user_id.clone());
        params.metadata = Some(metadata);

        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            quantity: Some(1),
            price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                currency,
                unit_amount: Some(request.amount),
                product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                    name: request.description.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);

        let session = StripeCheckoutSession::create(&self.client, params)
            .await
            .map_err(|e| PaymentError::provider("stripe", e.to_string()))?;

        let redirect_url = session
            .url
            .ok_or_else(|| PaymentError::provider("stripe", "no checkout URL returned"))?;

        Ok(Charge {
            provider_payment_id: session.id.to_string(),
            redirect_url,
        })
    }

    fn verify_webhook(&self, body: &[u8], signature: Option<&str>) -> Result<WebhookNotice> {
        self.verify_at(body, signature, Utc::now().timestamp())
    }

    async fn fetch_status(&self, provider_payment_id: &str) -> Result<PaymentStatus> {
        let id: CheckoutSessionId = provider_payment_id
            .parse()
            .map_err(|_| PaymentError::provider("stripe", format!("invalid session id {provider_payment_id}")))?;

        let session = StripeCheckoutSession::retrieve(&self.client, &id, &[])
            .await
            .map_err(|e| PaymentError::provider("stripe", e.to_string()))?;

        Ok(match (session.status, session.payment_status) {
            (_, CheckoutSessionPaymentStatus::Paid | CheckoutSessionPaymentStatus::NoPaymentRequired) => {
                PaymentStatus::Completed
            }
            (Some(CheckoutSessionStatus::Expired), _) => PaymentStatus::Failed,
            _ => PaymentStatus::Pending,
        })
    }
}

/// Currencies the credit catalogue is priced in
fn stripe_currency(code: &str) -> Result<Currency> {
    match code.to_ascii_lowercase().as_str() {
        "sgd" => Ok(Currency::SGD),
        "usd" => Ok(Currency::USD),
        "myr" => Ok(Currency::MYR),
        "eur" => Ok(Currency::EUR),
        other => Err(PaymentError::Config(format!("unsupported currency '{other}'"))),
    }
}

/// Webhook envelope; `data.object` is parsed per event type
#[derive(Debug, Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StripeCheckoutObject {
    id: String,
    #[serde(default)]
    payment_status: Option<String>,
    #[serde(default)]
    amount_total: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    client_reference_id: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}
