//! Postgres persistence for the coin ledger
//!
//! `error` is always compiled because the in-memory ledger reports through the
//! same error type; everything touching sqlx sits behind the `postgres` feature.

pub mod error;
#[cfg(feature = "postgres")]
pub mod ledger_repository;
#[cfg(feature = "postgres")]
pub mod transaction;

#[cfg(feature = "postgres")]
mod pool;

#[cfg(feature = "postgres")]
pub use pool::{health_check, init_pool, run_migrations, PoolConfig};

#[cfg(feature = "postgres")]
pub use ledger_repository::PgLedgerStore;
