//! HitPay Integration
//!
//! Payment Request API for charges, and the salted HMAC that HitPay puts in
//! the `hmac` field of its form-encoded webhooks.
//!
//! Signature: drop `hmac`, sort the remaining fields by name, concatenate
//! `name + value` for each, then HMAC-SHA256 the result with the account
//! salt and hex-encode it.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use crate::config::HitPayConfig;
use crate::error::{PaymentError, Result};
use crate::payment::{PaymentStatus, ProviderKind, Settlement};
use crate::provider::{Charge, ChargeRequest, PaymentGateway, WebhookNotice};
use crate::signature::{hmac_sha256_hex, signatures_match};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct PaymentRequestResponse {
    id: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct PaymentRequestStatus {
    status: String,
}

/// HitPay gateway
pub struct HitPayGateway {
    client: Client,
    api_key: String,
    salt: String,
    api_base: String,
    webhook_url: Option<String>,
}

impl HitPayGateway {
    pub fn new(config: &HitPayConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PaymentError::Config(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            salt: config.salt.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            webhook_url: config.webhook_url.clone(),
        })
    }

    /// Salted signature over every field except `hmac`
    ///
    /// A field name may appear once; repeated names are rejected.
    pub fn sign_fields<'a>(
        &self,
        fields: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<String> {
        let fields = unique_fields(fields.into_iter().map(|(k, v)| (k.to_string(), v.to_string())))?;
        self.sign_map(&fields)
    }

    fn sign_map(&self, fields: &BTreeMap<String, String>) -> Result<String> {
        let message: String = fields
            .iter()
            .filter(|(key, _)| key.as_str() != "hmac")
            .map(|(key, value)| format!("{key}{value}"))
            .collect();

        hmac_sha256_hex(self.salt.as_bytes(), message.as_bytes())
    }

    async fn error_body(response: reqwest::Response) -> String {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        format!("HTTP {status}: {text}")
    }
}

#[async_trait]
impl PaymentGateway for HitPayGateway {
    fn kind(&self) -> ProviderKind {
        ProviderKind::HitPay
    }

    async fn create_charge(&self, request: &ChargeRequest) -> Result<Charge> {
        let amount = minor_to_major(request.amount).to_string();
        let currency = request.currency.to_ascii_uppercase();

        let mut form: Vec<(&str, &str)> = vec![
            ("amount", amount.as_str()),
            ("currency", currency.as_str()),
            ("reference_number", request.payment_id.as_str()),
            ("purpose", request.description.as_str()),
            ("redirect_url", request.success_url.as_str()),
        ];
        if let Some(email) = request.customer_email.as_deref() {
            form.push(("email", email));
        }
        if let Some(webhook) = self.webhook_url.as_deref() {
            form.push(("webhook", webhook));
        }

        let response = self
            .client
            .post(format!("{}/v1/payment-requests", self.api_base))
            .header("X-BUSINESS-API-KEY", &self.api_key)
            .header("X-Requested-With", "XMLHttpRequest")
            .form(&form)
            .send()
            .await
            .map_err(|e| PaymentError::provider("hitpay", e.to_string()))?;

        if !response.status().is_success() {
            return Err(PaymentError::provider("hitpay", Self::error_body(response).await));
        }

        let created: PaymentRequestResponse = response
            .json()
            .await
            .map_err(|e| PaymentError::provider("hitpay", format!("invalid response: {e}")))?;

        Ok(Charge {
            provider_payment_id: created.id,
            redirect_url: created.url,
        })
    }

    fn verify_webhook(&self, body: &[u8], signature: Option<&str>) -> Result<WebhookNotice> {
        // The map that is signed is the map that is read
        let fields = unique_fields(url::form_urlencoded::parse(body).into_owned())?;

        let provided = signature
            .or_else(|| fields.get("hmac").map(String::as_str))
            .ok_or_else(|| PaymentError::WebhookSignature("missing hmac".into()))?;

        let expected = self.sign_map(&fields)?;
        if !signatures_match(&expected, provided) {
            return Err(PaymentError::WebhookSignature("hmac mismatch".into()));
        }

        let field = |name: &str| fields.get(name).filter(|value| !value.is_empty()).cloned();

        let status_text = field("status").unwrap_or_default();
        let status = match status_text.as_str() {
            "completed" => PaymentStatus::Completed,
            "failed" => PaymentStatus::Failed,
            _ => {
                return Ok(WebhookNotice::Ignored {
                    event_type: format!("payment.{status_text}"),
                })
            }
        };

        let provider_payment_id = field("payment_request_id")
            .ok_or_else(|| PaymentError::WebhookParse("missing payment_request_id".into()))?;

        let amount = field("amount")
            .map(|amount| major_to_minor(&amount))
            .transpose()?;

        Ok(WebhookNotice::Settle(Settlement {
            provider: ProviderKind::HitPay,
            provider_payment_id: Some(provider_payment_id),
            reference: field("reference_number"),
            status,
            amount,
            currency: field("currency"),
        }))
    }

    async fn fetch_status(&self, provider_payment_id: &str) -> Result<PaymentStatus> {
        let response = self
            .client
            .get(format!(
                "{}/v1/payment-requests/{}",
                self.api_base, provider_payment_id
            ))
            .header("X-BUSINESS-API-KEY", &self.api_key)
            .header("X-Requested-With", "XMLHttpRequest")
            .send()
            .await
            .map_err(|e| PaymentError::provider("hitpay", e.to_string()))?;

        if !response.status().is_success() {
            return Err(PaymentError::provider("hitpay", Self::error_body(response).await));
        }

        let request: PaymentRequestStatus = response
            .json()
            .await
            .map_err(|e| PaymentError::provider("hitpay", format!("invalid response: {e}")))?;

        Ok(match request.status.as_str() {
            "completed" => PaymentStatus::Completed,
            "failed" | "expired" | "canceled" | "cancelled" => PaymentStatus::Failed,
            _ => PaymentStatus::Pending,
        })
    }
}

/// Collect form fields by name, refusing any name that appears twice
fn unique_fields(
    pairs: impl IntoIterator<Item = (String, String)>,
) -> Result<BTreeMap<String, String>> {
    let mut fields = BTreeMap::new();
    for (key, value) in pairs {
        match fields.entry(key) {
            Entry::Occupied(entry) => {
                return Err(PaymentError::WebhookParse(format!(
                    "repeated field '{}'",
                    entry.key()
                )))
            }
            Entry::Vacant(entry) => {
                entry.insert(value);
            }
        }
    }
    Ok(fields)
}

/// Minor units to a two-decimal major amount
fn minor_to_major(amount: i64) -> Decimal {
    Decimal::new(amount, 2)
}

/// HitPay amount string (e.g. "15.00") to minor units
fn major_to_minor(amount: &str) -> Result<i64> {
    let decimal = Decimal::from_str(amount.trim())
        .map_err(|_| PaymentError::WebhookParse(format!("invalid amount '{amount}'")))?;
    (decimal * Decimal::ONE_HUNDRED)
        .round()
        .to_i64()
        .ok_or_else(|| PaymentError::WebhookParse(format!("amount out of range '{amount}'")))
}
