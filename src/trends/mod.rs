//! Hourly trend rollups of numeric history.
//!
//! [`TrendAggregator`] keeps one open aggregate per item and closes it when
//! a sample for another hour arrives. [`TrendFlushEngine`] persists closed
//! aggregates, merging with rows written by other sync workers.

pub mod aggregate;
pub mod aggregator;
pub mod flush;

pub use aggregate::{TrendAccum, TrendAggregate};
pub use aggregator::TrendAggregator;
pub use flush::TrendFlushEngine;
