//! Payment provider integration module
//!
//! A unified interface over the three coin-purchase gateways (Paystack,
//! Stripe, Chapa). Adapters translate between the provider wire formats and
//! the canonical [`types::ConfirmationEvent`]; they never touch the ledger.

pub mod providers;
pub mod signature;
pub mod traits;
pub mod types;

pub use traits::PaymentProvider;
pub use types::{ConfirmationEvent, PaymentRequest, PaymentSession};
