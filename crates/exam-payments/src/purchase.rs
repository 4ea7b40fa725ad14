//! Credit Purchase Flow
//!
//! UI → provider adapter → hosted page. The payment row is written as
//! `pending` before the provider is called, so a provider failure leaves a
//! pending row behind (the reconciliation sweep closes it out) and never a
//! charge we have no record of.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{PaymentError, Result};
use crate::package::{find_package, packages, PackageOffer};
use crate::payment::{run_blocking, NewPayment, PaymentStore, ProviderKind};
use crate::provider::{ChargeRequest, GatewaySet};

/// A user's request to buy a package
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PurchaseRequest {
    pub user_id: String,
    pub package_id: String,
    pub provider: ProviderKind,

    #[serde(default)]
    pub email: Option<String>,

    pub success_url: String,
    pub cancel_url: String,
}

/// Where to send the user next
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseSession {
    pub payment_id: String,
    pub provider: ProviderKind,
    pub redirect_url: String,
}

/// Credit purchase service
pub struct PurchaseService<S: PaymentStore> {
    store: Arc<S>,
    gateways: GatewaySet,
}

impl<S: PaymentStore + 'static> PurchaseService<S> {
    pub fn new(store: Arc<S>, gateways: GatewaySet) -> Self {
        Self { store, gateways }
    }

    pub fn gateways(&self) -> &GatewaySet {
        &self.gateways
    }

    /// Every package with the providers enabled in this process
    pub fn offers(&self) -> Vec<PackageOffer> {
        let providers = self.gateways.kinds();
        packages()
            .iter()
            .map(|package| PackageOffer {
                package: package.clone(),
                providers: providers.clone(),
            })
            .collect()
    }

    /// Record a pending payment and create the provider charge
    pub async fn start(&self, request: PurchaseRequest) -> Result<PurchaseSession> {
        if request.user_id.trim().is_empty() {
            return Err(PaymentError::InvalidRequest("user_id is required".into()));
        }

        let package = find_package(&request.package_id)
            .ok_or_else(|| PaymentError::UnknownPackage(request.package_id.clone()))?;
        let gateway = self.gateways.require(request.provider)?;

        let new_payment = NewPayment {
            user_id: request.user_id.clone(),
            amount: package.price,
            currency: package.currency.to_string(),
            credits: package.credits,
            provider: request.provider,
        };
        let payment = run_blocking(&self.store, move |store| store.create_pending(new_payment)).await?;

        let mut metadata = HashMap::new();
        metadata.insert("package_id".to_string(), package.id.to_string());

        let charge_request = ChargeRequest {
            payment_id: payment.id.clone(),
            user_id: payment.user_id.clone(),
            amount: payment.amount,
            currency: payment.currency.clone(),
            description: package.description(),
            customer_email: request.email,
            success_url: request.success_url,
            cancel_url: request.cancel_url,
            metadata,
        };

        let charge = match gateway.create_charge(&charge_request).await {
            Ok(charge) => charge,
            Err(e) => {
                tracing::warn!(
                    payment_id = %payment.id,
                    provider = %request.provider,
                    error = %e,
                    "Charge creation failed - payment left pending"
                );
                return Err(e);
            }
        };

        let (payment_id, provider_payment_id) =
            (payment.id.clone(), charge.provider_payment_id.clone());
        run_blocking(&self.store, move |store| {
            store.attach_provider_id(&payment_id, &provider_payment_id)
        })
        .await?;

        tracing::info!(
            payment_id = %payment.id,
            provider = %request.provider,
            provider_payment_id = %charge.provider_payment_id,
            package = package.id,
            "Started credit purchase"
        );

        Ok(PurchaseSession {
            payment_id: payment.id,
            provider: request.provider,
            redirect_url: charge.redirect_url,
        })
    }
}
