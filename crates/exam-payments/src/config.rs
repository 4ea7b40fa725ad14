//! Payment Configuration
//!
//! Read once at startup. `ENABLE_HITPAY` gates the secondary provider; a
//! provider whose secrets are missing or malformed is left out rather than
//! failing the whole process.

use crate::error::{PaymentError, Result};

/// HitPay production API
pub const HITPAY_PRODUCTION_API: &str = "https://api.hit-pay.com";

/// HitPay sandbox API
pub const HITPAY_SANDBOX_API: &str = "https://api.sandbox.hit-pay.com";

/// Stripe credentials
#[derive(Clone, Debug)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
}

impl StripeConfig {
    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let secret_key = required(&var, "STRIPE_SECRET_KEY")?;
        let webhook_secret = required(&var, "STRIPE_WEBHOOK_SECRET")?;

        if !secret_key.starts_with("sk_") && !secret_key.starts_with("rk_") {
            return Err(PaymentError::Config(
                "STRIPE_SECRET_KEY must start with sk_ or rk_".into(),
            ));
        }
        if !webhook_secret.starts_with("whsec_") {
            return Err(PaymentError::Config(
                "STRIPE_WEBHOOK_SECRET must start with whsec_".into(),
            ));
        }

        Ok(Self {
            secret_key,
            webhook_secret,
        })
    }
}

/// HitPay credentials
#[derive(Clone, Debug)]
pub struct HitPayConfig {
    /// Business API key (`X-BUSINESS-API-KEY`)
    pub api_key: String,

    /// Salt used to sign webhooks
    pub salt: String,

    /// API base URL, production or sandbox
    pub api_base: String,

    /// Public URL HitPay posts webhooks to
    pub webhook_url: Option<String>,
}

impl HitPayConfig {
    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_key = required(&var, "HITPAY_API_KEY")?;
        let salt = required(&var, "HITPAY_SALT")?;

        let api_base = match var("HITPAY_API_BASE") {
            Some(base) if !base.trim().is_empty() => base.trim().trim_end_matches('/').to_string(),
            _ if var("HITPAY_SANDBOX").is_some_and(|v| parse_flag(&v)) => {
                HITPAY_SANDBOX_API.to_string()
            }
            _ => HITPAY_PRODUCTION_API.to_string(),
        };

        let webhook_url = var("HITPAY_WEBHOOK_URL")
            .filter(|url| !url.trim().is_empty())
            .or_else(|| {
                var("PUBLIC_BASE_URL")
                    .filter(|url| !url.trim().is_empty())
                    .map(|base| format!("{}/webhook/hitpay", base.trim_end_matches('/')))
            });

        Ok(Self {
            api_key,
            salt,
            api_base,
            webhook_url,
        })
    }
}

/// Everything the payment layer reads at startup
#[derive(Clone, Debug, Default)]
pub struct PaymentsConfig {
    /// Feature flag for the secondary provider
    pub enable_hitpay: bool,

    /// Stripe credentials (None if not configured)
    pub stripe: Option<StripeConfig>,

    /// HitPay credentials (None if disabled or not configured)
    pub hitpay: Option<HitPayConfig>,
}

impl PaymentsConfig {
    /// Create from environment variables
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from any variable source; configuration errors disable only
    /// the affected provider
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let enable_hitpay = var("ENABLE_HITPAY").is_some_and(|v| parse_flag(&v));

        let stripe = match StripeConfig::from_vars(&var) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!(error = %e, "Stripe not configured - card payments disabled");
                None
            }
        };

        let hitpay = if enable_hitpay {
            match HitPayConfig::from_vars(&var) {
                Ok(config) => Some(config),
                Err(e) => {
                    tracing::error!(error = %e, "ENABLE_HITPAY is set but HitPay is misconfigured - HitPay disabled");
                    None
                }
            }
        } else {
            None
        };

        Self {
            enable_hitpay,
            stripe,
            hitpay,
        }
    }
}

/// Parse a boolean flag: true/1/yes/on, case-insensitive
pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn required(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    var(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| PaymentError::Config(format!("{key} not set")))
}
