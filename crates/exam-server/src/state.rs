//! Application State

use std::sync::Arc;

use exam_db::SqlitePaymentStore;
use exam_payments::{GatewaySet, PurchaseService, WebhookProcessor};

use crate::config::AppConfig;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Payment rows and credit balances
    pub store: Arc<SqlitePaymentStore>,

    /// Checkout flow over the enabled providers
    pub purchases: Arc<PurchaseService<SqlitePaymentStore>>,

    /// Signature check + idempotent settlement
    pub webhooks: Arc<WebhookProcessor<SqlitePaymentStore>>,

    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(store: Arc<SqlitePaymentStore>, gateways: GatewaySet, config: AppConfig) -> Self {
        Self {
            purchases: Arc::new(PurchaseService::new(store.clone(), gateways.clone())),
            webhooks: Arc::new(WebhookProcessor::new(store.clone(), gateways)),
            store,
            config: Arc::new(config),
        }
    }

    pub fn gateways(&self) -> &GatewaySet {
        self.purchases.gateways()
    }
}
