//! Payment provider implementations
//!
//! Concrete implementations of the PaymentProvider trait, one per gateway.

pub mod chapa;
pub mod client;
pub mod paystack;
pub mod stripe;

pub use chapa::{ChapaConfig, ChapaProvider};
pub use paystack::{PaystackConfig, PaystackProvider};
pub use stripe::{StripeConfig, StripeProvider};

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ProvidersConfig;
use crate::ledger::Gateway;
use crate::payments::traits::PaymentProvider;

/// Enabled providers keyed by the gateway they serve
pub type ProviderRegistry = HashMap<Gateway, Arc<dyn PaymentProvider>>;

/// Build every provider that has credentials configured
pub fn build_registry(config: &ProvidersConfig) -> anyhow::Result<ProviderRegistry> {
    let mut registry: ProviderRegistry = HashMap::new();

    if let Some(paystack) = &config.paystack {
        registry.insert(
            Gateway::CardRegional,
            Arc::new(PaystackProvider::new(paystack.clone())?),
        );
    }
    if let Some(stripe) = &config.stripe {
        registry.insert(
            Gateway::CardInternational,
            Arc::new(StripeProvider::new(stripe.clone())?),
        );
    }
    if let Some(chapa) = &config.chapa {
        registry.insert(
            Gateway::MobileMoney,
            Arc::new(ChapaProvider::new(chapa.clone())?),
        );
    }

    for gateway in registry.keys() {
        tracing::info!(
            gateway = %gateway,
            provider = gateway.provider_name(),
            "payment provider enabled"
        );
    }

    Ok(registry)
}
