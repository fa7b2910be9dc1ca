//! Write-back cache for monitored history values.
//!
//! Producers append values to a shared [`cache::Cache`]; sync workers
//! ([`sync::SyncCoordinator`]) drain it in batches, persist history through
//! a [`store::Store`] and fold numeric values into hourly trends.

pub mod cache;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod error;
pub mod export;
pub mod ids;
pub mod items;
pub mod lifecycle;
pub mod store;
pub mod sync;
pub mod trends;
pub mod triggers;
