//! Router
//!
//! Webhook routes exist only for providers this process offers. With
//! `ENABLE_HITPAY` off, `/webhook/hitpay` is a plain 404.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use exam_payments::ProviderKind;

use crate::handlers::{
    create_checkout, get_payment, health_check, hitpay_webhook, list_packages, stripe_webhook,
};
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        // Health & info
        .route("/health", get(health_check))
        .route("/api/packages", get(list_packages))
        // Payments
        .route("/api/checkout", post(create_checkout))
        .route("/api/payments/{id}", get(get_payment));

    if state.gateways().is_enabled(ProviderKind::Stripe) {
        app = app.route("/webhook/stripe", post(stripe_webhook));
    }
    if state.gateways().is_enabled(ProviderKind::HitPay) {
        app = app.route("/webhook/hitpay", post(hitpay_webhook));
    }

    app.layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
