use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::cache::{Cache, CacheLimits, SyncMode};
use crate::config::{CacheConfig, Role};
use crate::items::ItemStateMerger;
use crate::sync::{Collaborators, SyncCoordinator};

/// Owns a cache from sizing to its final drain.
pub struct CacheLifecycle {
    cache: Arc<Cache>,
    deps: Collaborators,
    merger: Arc<ItemStateMerger>,
    role: Role,
    syncer_frequency: Duration,
    torn_down: AtomicBool,
}

impl CacheLifecycle {
    /// Sizes and allocates the cache described by `cfg`.
    pub fn init(cfg: &CacheConfig, role: Role, deps: Collaborators) -> Result<Self> {
        cfg.validate().context("invalid cache configuration")?;

        let limits = limits_for(cfg);
        tracing::info!(
            ring_capacity = limits.ring_capacity,
            text_capacity = limits.text_capacity,
            batch_limit = limits.batch_limit,
            role = ?role,
            "history cache initialized"
        );

        Ok(Self {
            cache: Arc::new(Cache::new(limits)),
            deps,
            merger: Arc::new(ItemStateMerger::new()),
            role,
            syncer_frequency: cfg.syncer_frequency,
            torn_down: AtomicBool::new(false),
        })
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// A sync worker sharing this cache, its item state and collaborators.
    pub fn coordinator(&self) -> SyncCoordinator {
        SyncCoordinator::new(
            Arc::clone(&self.cache),
            self.deps.clone(),
            Arc::clone(&self.merger),
            self.role,
            self.syncer_frequency,
        )
    }

    /// Refuses further values and drains everything left, open trends
    /// included. Returns the records persisted. Later calls do nothing.
    pub fn teardown(&self) -> Result<usize> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }

        self.cache.close();
        let processed = self
            .coordinator()
            .sync(SyncMode::FullDrain)
            .context("draining history cache")?;

        tracing::info!(processed, "history cache released");

        Ok(processed)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }
}

/// Derives ring and batch sizes from configured byte budgets.
pub fn limits_for(cfg: &CacheConfig) -> CacheLimits {
    let ring_capacity = (cfg.history_cache_size / CacheLimits::slot_size()).max(1);

    CacheLimits {
        ring_capacity,
        text_capacity: cfg.text_cache_size,
        trend_capacity: cfg.trend_cache_size,
        batch_limit: cfg.sync_batch_max.min(ring_capacity),
        backoff: cfg.backoff,
    }
}
