//! Credit Packages
//!
//! The fixed catalogue users can buy. Every package is offered through
//! every enabled provider.

use serde::Serialize;

use crate::payment::ProviderKind;

/// Catalogue currency
pub const CATALOGUE_CURRENCY: &str = "sgd";

/// A purchasable bundle of credits
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CreditPackage {
    pub id: &'static str,
    pub name: &'static str,
    pub credits: i64,

    /// Price in minor units of `currency`
    pub price: i64,
    pub currency: &'static str,
}

impl CreditPackage {
    /// Line item text shown on the provider's checkout page
    pub fn description(&self) -> String {
        format!("{} ({} exam credits)", self.name, self.credits)
    }
}

const PACKAGES: &[CreditPackage] = &[
    CreditPackage {
        id: "starter",
        name: "Starter",
        credits: 10,
        price: 1000,
        currency: CATALOGUE_CURRENCY,
    },
    CreditPackage {
        id: "standard",
        name: "Standard",
        credits: 30,
        price: 2500,
        currency: CATALOGUE_CURRENCY,
    },
    CreditPackage {
        id: "intensive",
        name: "Intensive",
        credits: 80,
        price: 6000,
        currency: CATALOGUE_CURRENCY,
    },
];

/// All packages, cheapest first
pub fn packages() -> &'static [CreditPackage] {
    PACKAGES
}

/// Look a package up by ID
pub fn find_package(id: &str) -> Option<&'static CreditPackage> {
    PACKAGES.iter().find(|p| p.id.eq_ignore_ascii_case(id.trim()))
}

/// A package together with the providers it can be bought through
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PackageOffer {
    #[serde(flatten)]
    pub package: CreditPackage,
    pub providers: Vec<ProviderKind>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogue_prices_positive_and_unique() {
        let mut ids: Vec<_> = packages().iter().map(|p| p.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), packages().len());
        assert!(packages().iter().all(|p| p.price > 0 && p.credits > 0));
    }

    #[test]
    fn test_find_package() {
        assert_eq!(find_package("Standard").map(|p| p.credits), Some(30));
        assert!(find_package("platinum").is_none());
    }

    #[test]
    fn test_offer_serializes_flat() {
        let offer = PackageOffer {
            package: packages()[0].clone(),
            providers: vec![ProviderKind::Stripe, ProviderKind::HitPay],
        };
        let json = serde_json::to_value(&offer).unwrap();
        assert_eq!(json["id"], "starter");
        assert_eq!(json["providers"], serde_json::json!(["stripe", "hitpay"]));
    }
}
