use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::record::{LogMeta, Timespec, ValueKind};
use crate::cache::{Cache, LocalValues, SyncMode};
use crate::clock::{ClockSource, SystemClock};
use crate::config::{Config, SimulateConfig};
use crate::error::CacheError;
use crate::export::HealthMetrics;
use crate::items::{ItemConfig, MemoryCatalog};
use crate::lifecycle::CacheLifecycle;
use crate::store::memory::MemoryStore;
use crate::sync::Collaborators;
use crate::triggers::NoopTriggers;

/// Runs the cache with its sync workers, health server and, optionally,
/// synthetic producers, all against in-memory collaborators.
pub struct Daemon {
    cfg: Config,
    health: Arc<HealthMetrics>,
    lifecycle: Arc<CacheLifecycle>,
    catalog: Arc<MemoryCatalog>,
    clock: Arc<dyn ClockSource>,
    syncers: Vec<JoinHandle<()>>,
    producers: Vec<thread::JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Daemon {
    /// Creates the cache and health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let catalog = Arc::new(MemoryCatalog::new());
        let clock: Arc<dyn ClockSource> = Arc::new(SystemClock);
        let deps = Collaborators {
            store: Arc::new(MemoryStore::new()),
            catalog: catalog.clone(),
            triggers: Arc::new(NoopTriggers),
            clock: Arc::clone(&clock),
        };

        let lifecycle = Arc::new(
            CacheLifecycle::init(&cfg.cache, cfg.role, deps).context("initializing cache")?,
        );

        Ok(Self {
            cfg,
            health,
            lifecycle,
            catalog,
            clock,
            syncers: Vec::new(),
            producers: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn cache(&self) -> &Arc<Cache> {
        self.lifecycle.cache()
    }

    /// Starts the health server and sync workers, plus producers when
    /// `simulate` is set.
    pub async fn start(&mut self, simulate: bool) -> Result<()> {
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        for id in 0..self.cfg.syncers {
            let handle = self.spawn_syncer(id);
            self.syncers.push(handle);
        }
        info!(
            syncers = self.cfg.syncers,
            frequency = ?self.cfg.cache.syncer_frequency,
            "sync workers started"
        );

        if simulate {
            self.start_producers()?;
        }

        info!("histcache fully started");

        Ok(())
    }

    /// Stops producers and workers, then drains the cache.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        for handle in self.syncers.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "sync worker panicked");
            }
        }

        // Closing the cache also releases producers blocked on a full ring.
        let lifecycle = Arc::clone(&self.lifecycle);
        let processed = tokio::task::spawn_blocking(move || lifecycle.teardown())
            .await
            .context("joining teardown task")?
            .context("tearing down cache")?;
        info!(processed, "final sync finished");

        let producers: Vec<_> = self.producers.drain(..).collect();
        tokio::task::spawn_blocking(move || {
            for handle in producers {
                if handle.join().is_err() {
                    error!("producer thread panicked");
                }
            }
        })
        .await
        .context("joining producer threads")?;

        self.health.refresh(self.lifecycle.cache());
        self.health.stop().await?;

        Ok(())
    }

    /// Spawn one periodic incremental sync worker.
    fn spawn_syncer(&self, id: usize) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);
        let cache = Arc::clone(self.lifecycle.cache());
        let coordinator = Arc::new(
            self.lifecycle
                .coordinator()
                .with_metrics(Arc::clone(&health)),
        );
        let frequency = self.cfg.cache.syncer_frequency;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frequency);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let coordinator = Arc::clone(&coordinator);
                        let pass = tokio::task::spawn_blocking(move || {
                            coordinator.sync(SyncMode::Incremental)
                        })
                        .await;

                        match pass {
                            Ok(Ok(processed)) => {
                                debug!(syncer = id, processed, "sync pass finished");
                            }
                            Ok(Err(e)) => {
                                warn!(syncer = id, error = %e, "sync pass failed");
                            }
                            Err(e) => {
                                error!(syncer = id, error = %e, "sync pass panicked");
                            }
                        }

                        health.refresh(&cache);
                    }
                }
            }
        })
    }

    fn start_producers(&mut self) -> Result<()> {
        let sim = self.cfg.simulate.clone();

        for item_id in 1..=sim.items {
            self.catalog
                .insert(item_id, ItemConfig::new(simulated_kind(&sim, item_id)));
        }

        for producer in 0..sim.producers {
            let cache = Arc::clone(self.lifecycle.cache());
            let clock = Arc::clone(&self.clock);
            let cancel = self.cancel.clone();
            let sim = sim.clone();

            let handle = thread::Builder::new()
                .name(format!("producer-{producer}"))
                .spawn(move || run_producer(producer, &cache, clock.as_ref(), &cancel, &sim))
                .context("spawning producer thread")?;
            self.producers.push(handle);
        }

        info!(
            producers = sim.producers,
            items = sim.items,
            "simulated producers started"
        );

        Ok(())
    }
}

fn simulated_kind(sim: &SimulateConfig, item_id: u64) -> ValueKind {
    if item_id % 100 < u64::from(sim.log_percent) {
        return ValueKind::Log;
    }
    if item_id % 2 == 0 {
        ValueKind::Float
    } else {
        ValueKind::UInt64
    }
}

fn run_producer(
    producer: usize,
    cache: &Cache,
    clock: &dyn ClockSource,
    cancel: &CancellationToken,
    sim: &SimulateConfig,
) {
    let mut pass: u64 = 0;

    while !cancel.is_cancelled() {
        let now = clock.now();
        let mut local = LocalValues::new(cache);

        let result = (1..=sim.items)
            .filter(|id| (*id as usize) % sim.producers == producer)
            .try_for_each(|item_id| {
                let ts = Timespec::from_secs(now);
                match simulated_kind(sim, item_id) {
                    ValueKind::Float => local.add_float(item_id, ts, (pass % 97) as f64 * 0.5),
                    ValueKind::UInt64 => local.add_uint(item_id, ts, pass * item_id),
                    _ => local.add_log(
                        item_id,
                        ts,
                        "simulated log line",
                        LogMeta {
                            source: Some(format!("producer-{producer}")),
                            last_log_size: pass * 19,
                            mtime: now as i32,
                            ..Default::default()
                        },
                    ),
                }
            })
            .and_then(|()| local.flush());

        match result {
            Ok(()) => {}
            Err(CacheError::Closed) => return,
            Err(e) => warn!(producer, error = %e, "simulated value rejected"),
        }

        pass += 1;
        drop(local);
        thread::sleep(sim.interval);
    }
}
