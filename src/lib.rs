//! Coin purchase backend
//!
//! Sells an in-app coin currency through three payment gateways and credits a
//! user's balance exactly once per real-world payment, however many times the
//! confirmation arrives.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod ledger;
pub mod payments;
pub mod telemetry;

pub use error::{PaymentError, PaymentResult};
