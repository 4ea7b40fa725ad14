//! HTTP Handlers

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;

use exam_db::SqlitePaymentStore;
use exam_payments::{
    PackageOffer, Payment, PaymentError, PaymentStore, ProviderKind, PurchaseRequest,
    PurchaseSession, WebhookOutcome,
};

use crate::state::AppState;

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub database_ok: bool,
    pub providers: Vec<ProviderKind>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Body returned to providers for deliveries we accepted
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum WebhookReply {
    Processed(WebhookOutcome),
    Unmatched { outcome: &'static str, reference: String },
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.into(),
        }),
    )
}

/// Status and code for a payment error seen by the web UI
fn payment_error(e: &PaymentError) -> ApiError {
    let (status, code) = match e {
        PaymentError::UnknownPackage(_) => (StatusCode::BAD_REQUEST, "UNKNOWN_PACKAGE"),
        PaymentError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
        PaymentError::ProviderDisabled(_) => (StatusCode::BAD_REQUEST, "PROVIDER_UNAVAILABLE"),
        PaymentError::PaymentNotFound(_) => (StatusCode::NOT_FOUND, "PAYMENT_NOT_FOUND"),
        PaymentError::Provider { .. } => (StatusCode::BAD_GATEWAY, "PROVIDER_ERROR"),
        PaymentError::Config(_) => (StatusCode::SERVICE_UNAVAILABLE, "PAYMENTS_MISCONFIGURED"),
        PaymentError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
        PaymentError::WebhookSignature(_)
        | PaymentError::WebhookParse(_)
        | PaymentError::AmountMismatch { .. }
        | PaymentError::CurrencyMismatch { .. } => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
    };
    api_error(status, code, e.user_message())
}

// ============================================================================
// Handlers
// ============================================================================

/// Run a synchronous store call off the async workers
async fn blocking<T, F>(state: &AppState, call: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&SqlitePaymentStore) -> T + Send + 'static,
{
    let store = state.store.clone();
    tokio::task::spawn_blocking(move || call(&store))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Store task failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR", "Storage task failed")
        })
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let database_ok = blocking(&state, |store| store.database().conn().is_ok())
        .await
        .unwrap_or(false);

    Json(HealthResponse {
        status: if database_ok { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        database_ok,
        providers: state.gateways().kinds(),
    })
}

/// Credit packages with the providers that can sell them
pub async fn list_packages(State(state): State<AppState>) -> Json<Vec<PackageOffer>> {
    Json(state.purchases.offers())
}

/// Start a credit purchase and return the hosted payment page
pub async fn create_checkout(
    State(state): State<AppState>,
    Json(payload): Json<PurchaseRequest>,
) -> Result<Json<PurchaseSession>, ApiError> {
    let provider = payload.provider;
    state.purchases.start(payload).await.map(Json).map_err(|e| {
        tracing::error!(provider = %provider, error = %e, "Checkout error");
        payment_error(&e)
    })
}

/// Payment status, polled by the success page
pub async fn get_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<String>,
) -> Result<Json<Payment>, ApiError> {
    let lookup_id = payment_id.clone();
    match blocking(&state, move |store| store.get(&lookup_id)).await? {
        Ok(Some(payment)) => Ok(Json(payment)),
        Ok(None) => Err(payment_error(&PaymentError::PaymentNotFound(payment_id))),
        Err(e) => {
            tracing::error!(payment_id = %payment_id, error = %e, "Payment lookup failed");
            Err(payment_error(&e))
        }
    }
}

/// Stripe webhook handler
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookReply>, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    process_webhook(state, ProviderKind::Stripe, body, signature).await
}

/// HitPay webhook handler; the signature travels in the form body
pub async fn hitpay_webhook(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<WebhookReply>, ApiError> {
    process_webhook(state, ProviderKind::HitPay, body, None).await
}

async fn process_webhook(
    state: AppState,
    provider: ProviderKind,
    body: Bytes,
    signature: Option<String>,
) -> Result<Json<WebhookReply>, ApiError> {
    // Settlement takes a SQLite write lock; keep it off the async workers
    let webhooks = state.webhooks.clone();
    let result = tokio::task::spawn_blocking(move || {
        webhooks.process(provider, &body, signature.as_deref())
    })
    .await
    .map_err(|e| {
        tracing::error!(provider = %provider, error = %e, "Webhook task failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "WEBHOOK_ERROR", "Webhook processing failed")
    })?;

    match result {
        Ok(outcome) => Ok(Json(WebhookReply::Processed(outcome))),

        // Acknowledge so the provider stops retrying something we can never match
        Err(PaymentError::PaymentNotFound(reference)) => {
            tracing::warn!(provider = %provider, reference = %reference, "Webhook for unknown payment");
            Ok(Json(WebhookReply::Unmatched {
                outcome: "unknown_payment",
                reference,
            }))
        }

        Err(e @ (PaymentError::WebhookSignature(_) | PaymentError::WebhookParse(_))) => {
            Err(api_error(StatusCode::BAD_REQUEST, "INVALID_SIGNATURE", e.to_string()))
        }

        Err(e @ (PaymentError::AmountMismatch { .. } | PaymentError::CurrencyMismatch { .. })) => {
            let code = if matches!(e, PaymentError::CurrencyMismatch { .. }) {
                "CURRENCY_MISMATCH"
            } else {
                "AMOUNT_MISMATCH"
            };
            tracing::error!(provider = %provider, error = %e, "Webhook does not match the payment - not settled");
            Err(api_error(StatusCode::BAD_REQUEST, code, e.to_string()))
        }

        Err(PaymentError::ProviderDisabled(name)) => Err(api_error(
            StatusCode::NOT_FOUND,
            "PROVIDER_UNAVAILABLE",
            format!("{name} webhooks are not enabled"),
        )),

        // Non-2xx makes the provider redeliver
        Err(e) => {
            tracing::error!(provider = %provider, error = %e, "Webhook processing error");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "WEBHOOK_ERROR",
                "Webhook processing failed",
            ))
        }
    }
}
