//! exam-server
//!
//! Axum server for credit purchases: package listing, checkout, payment
//! status and provider webhooks. A background task reconciles payments
//! whose webhook never arrived.

mod config;
mod handlers;
mod routes;
mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use exam_db::{Database, SqlitePaymentStore};
use exam_payments::{GatewaySet, ProviderKind, ReconcileReport, Reconciler};

use crate::config::AppConfig;
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load secrets
    let secrets_file = std::env::var("SECRETS_FILE").unwrap_or_else(|_| ".env".into());
    match dotenvy::from_filename(&secrets_file) {
        Ok(path) => tracing::info!(path = %path.display(), "Loaded secrets file"),
        Err(e) if e.not_found() => tracing::debug!(file = %secrets_file, "No secrets file"),
        Err(e) => tracing::warn!(file = %secrets_file, error = %e, "Could not read secrets file"),
    }

    let config = AppConfig::from_env();

    // Database
    let db = Database::open(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    let report = db.migrate().context("running migrations")?;
    tracing::info!(
        path = %config.database_path.display(),
        version = report.to_version,
        applied = report.applied.len(),
        "✓ Database ready"
    );
    let store = Arc::new(SqlitePaymentStore::new(db));

    // Payments
    let gateways = GatewaySet::from_config(&config.payments).context("building payment gateways")?;
    for kind in ProviderKind::ALL {
        if gateways.is_enabled(kind) {
            tracing::info!(provider = %kind, "✓ Payment provider enabled");
        } else {
            tracing::warn!(provider = %kind, "⚠ Payment provider disabled");
        }
    }
    if gateways.kinds().is_empty() {
        tracing::warn!("  No provider configured - set STRIPE_SECRET_KEY and STRIPE_WEBHOOK_SECRET");
    }

    let reconciler = Reconciler::new(store.clone(), gateways.clone(), config.reconcile);
    spawn_reconciler(reconciler, config.reconcile_interval);

    let addr = config.bind_addr.clone();
    let state = AppState::new(store, gateways, config);
    let app = build_router(state.clone());

    // Start server
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("exam-server running on http://{}", addr);
    if let Some(url) = &state.config.public_base_url {
        tracing::info!("Hosted at {}", url);
    }
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health             - Health check");
    tracing::info!("  GET  /api/packages       - Credit packages and providers");
    tracing::info!("  POST /api/checkout       - Start a credit purchase");
    tracing::info!("  GET  /api/payments/{{id}}  - Payment status");
    for kind in state.gateways().kinds() {
        tracing::info!("  POST /webhook/{:<13}- {} webhook", kind.as_str(), kind);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

fn spawn_reconciler(reconciler: Reconciler<SqlitePaymentStore>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match reconciler.sweep().await {
                Ok(report) if report == ReconcileReport::default() => {
                    tracing::debug!("Reconciliation sweep: nothing to do");
                }
                Ok(report) => tracing::info!(
                    checked = report.checked,
                    settled = report.settled,
                    still_pending = report.still_pending,
                    expired = report.expired,
                    errors = report.errors,
                    "Reconciliation sweep finished"
                ),
                Err(e) => tracing::error!(error = %e, "Reconciliation sweep failed"),
            }
        }
    });
}

/// Resolves on ctrl-c, or on SIGTERM under unix
///
/// `exam-ops clear-cache --restart` stops the server with SIGTERM. The
/// listener is registered before this returns so an early signal is kept.
fn shutdown_signal() -> impl Future<Output = ()> + Send + 'static {
    #[cfg(unix)]
    let terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());

    async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async move {
            match terminate {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {},
            () = terminate => {},
        }
        tracing::info!("Shutdown signal received");
    }
}
