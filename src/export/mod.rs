//! Operational surfaces exposed by the daemon.

pub mod health;

pub use self::health::HealthMetrics;
