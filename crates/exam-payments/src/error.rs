//! Payment Error Types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Payment-related errors
#[derive(Error, Debug)]
pub enum PaymentError {
    /// Missing or malformed provider secret
    #[error("Configuration error: {0}")]
    Config(String),

    /// Provider API unreachable or returned an error
    #[error("{provider} error: {message}")]
    Provider {
        provider: &'static str,
        message: String,
    },

    /// Webhook signature verification failed
    #[error("Webhook signature invalid: {0}")]
    WebhookSignature(String),

    /// Webhook payload parsing failed
    #[error("Webhook parse error: {0}")]
    WebhookParse(String),

    /// No payment row matches the provider reference
    #[error("Payment not found: {0}")]
    PaymentNotFound(String),

    /// Webhook amount disagrees with the stored payment
    #[error("Amount mismatch for payment {payment_id}: expected {expected}, got {actual}")]
    AmountMismatch {
        payment_id: String,
        expected: i64,
        actual: i64,
    },

    /// Webhook currency disagrees with the stored payment
    #[error("Currency mismatch for payment {payment_id}: expected {expected}, got {actual}")]
    CurrencyMismatch {
        payment_id: String,
        expected: String,
        actual: String,
    },

    /// Requested credit package does not exist
    #[error("Unknown credit package: {0}")]
    UnknownPackage(String),

    /// Malformed purchase request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Provider unknown or switched off by configuration
    #[error("Payment provider not available: {0}")]
    ProviderDisabled(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),
}

impl PaymentError {
    pub(crate) fn provider(provider: &'static str, message: impl Into<String>) -> Self {
        PaymentError::Provider {
            provider,
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, PaymentError::Provider { .. } | PaymentError::Storage(_))
    }

    /// Get user-friendly message
    pub fn user_message(&self) -> &str {
        match self {
            PaymentError::Provider { .. } => "Payment processing failed. Please try again.",
            PaymentError::UnknownPackage(_) => "That credit package does not exist.",
            PaymentError::InvalidRequest(_) => "The purchase request is incomplete.",
            PaymentError::ProviderDisabled(_) => "That payment method is not available.",
            PaymentError::PaymentNotFound(_) => "Payment not found.",
            PaymentError::Config(_) => "Service configuration error.",
            _ => "An error occurred processing your request.",
        }
    }
}
