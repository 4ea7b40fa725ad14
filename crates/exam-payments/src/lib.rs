//! # exam-payments
//!
//! Credit purchases for the mock exam app, through Stripe Checkout or HitPay.
//!
//! ## Flow
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────┐     ┌─────────────┐
//! │  Pricing    │────▶│  Provider Hosted│────▶│  App        │
//! │  (package)  │     │  Payment Page   │     │  (success)  │
//! └─────────────┘     └─────────────────┘     └─────────────┘
//!        │                     │
//!        ▼                     ▼
//!   payment row           signed webhook ──▶ settle (once) ──▶ credits
//!   (pending)
//! ```
//!
//! The payment row is written before the provider is called. A webhook moves
//! it from `pending` to `completed` or `failed` exactly once; redeliveries
//! are acknowledged without touching the user's balance.
//!
//! Stripe is always offered when configured. HitPay is behind the
//! `ENABLE_HITPAY` flag: when off, it is not offered and its webhook is not
//! served.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use exam_payments::{GatewaySet, PaymentsConfig, PurchaseRequest, PurchaseService, ProviderKind};
//!
//! let gateways = GatewaySet::from_config(&PaymentsConfig::from_env())?;
//! let service = PurchaseService::new(store, gateways);
//!
//! let session = service.start(PurchaseRequest {
//!     user_id: "user-1".into(),
//!     package_id: "standard".into(),
//!     provider: ProviderKind::HitPay,
//!     email: None,
//!     success_url: "https://exams.example.com/credits?paid=1".into(),
//!     cancel_url: "https://exams.example.com/credits".into(),
//! }).await?;
//!
//! // Redirect user to: session.redirect_url
//! ```

pub mod config;
mod error;
pub mod hitpay;
mod package;
mod payment;
mod provider;
mod purchase;
mod reconcile;
mod signature;
pub mod stripe;
mod webhook;

pub use config::{HitPayConfig, PaymentsConfig, StripeConfig};
pub use error::{PaymentError, Result};
pub use hitpay::HitPayGateway;
pub use package::{find_package, packages, CreditPackage, PackageOffer, CATALOGUE_CURRENCY};
pub use payment::{
    MemoryPaymentStore, NewPayment, Payment, PaymentStatus, PaymentStore, ProviderKind,
    SettleOutcome, Settlement,
};
pub use provider::{Charge, ChargeRequest, GatewaySet, PaymentGateway, WebhookNotice};
pub use purchase::{PurchaseRequest, PurchaseService, PurchaseSession};
pub use reconcile::{ReconcileReport, ReconcileSettings, Reconciler};
pub use stripe::StripeGateway;
pub use webhook::{WebhookOutcome, WebhookProcessor};
