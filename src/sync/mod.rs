//! Moves drained history into the store.
//!
//! A [`SyncCoordinator`] repeatedly drains a batch from the shared cache,
//! persists it inside one store transaction and hands its items back.
//! Several coordinators may run against the same cache; in the server role
//! the in-flight set keeps any item in at most one of their batches.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::cache::record::{HistoryRecord, HistoryValue, Timespec};
use crate::cache::{Cache, SyncMode};
use crate::clock::ClockSource;
use crate::config::Role;
use crate::export::HealthMetrics;
use crate::items::{ItemCatalog, ItemStateMerger};
use crate::store::{HistoryRow, HistoryTable, Store};
use crate::triggers::TriggerProcessor;
use crate::trends::TrendFlushEngine;

/// How often a full drain reports progress.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// External services a sync round calls into.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub catalog: Arc<dyn ItemCatalog>,
    pub triggers: Arc<dyn TriggerProcessor>,
    pub clock: Arc<dyn ClockSource>,
}

/// Drives sync passes of one worker.
pub struct SyncCoordinator {
    cache: Arc<Cache>,
    deps: Collaborators,
    merger: Arc<ItemStateMerger>,
    trends: TrendFlushEngine,
    role: Role,
    max_delay: Duration,
    metrics: Option<Arc<HealthMetrics>>,
}

impl SyncCoordinator {
    /// `max_delay` bounds how long a value may stay queued behind an item
    /// another round holds before an incremental pass keeps going for it.
    pub fn new(
        cache: Arc<Cache>,
        deps: Collaborators,
        merger: Arc<ItemStateMerger>,
        role: Role,
        max_delay: Duration,
    ) -> Self {
        let trends = TrendFlushEngine::new(Arc::clone(&deps.store), cache.limits().batch_limit);

        Self {
            cache,
            deps,
            merger,
            trends,
            role,
            max_delay,
            metrics: None,
        }
    }

    /// Reports rounds to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Runs one sync pass and returns the number of records persisted.
    ///
    /// `Incremental` works the backlog down to less than one batch and then
    /// keeps going only while a value older than the delay bound waits
    /// behind an in-flight item. `FullDrain` empties the cache and, in the
    /// server role, flushes every open trend.
    ///
    /// A failed round is rolled back and its records are not re-queued.
    pub fn sync(&self, mode: SyncMode) -> Result<usize> {
        let full = mode == SyncMode::FullDrain;
        let batch = self.cache.limits().batch_limit;
        let exclusive = self.role == Role::Server;

        if full {
            self.cache.clear_in_flight();
            tracing::warn!("syncing history data...");
        }

        let total = self.cache.len();
        let mut rounds = (total / batch).max(1);
        let oldest_allowed = self.deps.clock.now() - self.max_delay.as_secs() as i64;

        let mut processed = 0usize;
        let mut last_report = Instant::now();

        loop {
            let drained = self.cache.consume_batch(batch, exclusive);
            if drained.records.is_empty() {
                break;
            }

            let mut item_ids: Vec<u64> = drained.records.iter().map(|r| r.item_id).collect();
            item_ids.sort_unstable();
            item_ids.dedup();

            let result = self.run_round(drained.records);
            self.cache.release_items(item_ids);
            processed += result?;

            rounds = rounds.saturating_sub(1);

            if full && last_report.elapsed() >= PROGRESS_INTERVAL {
                tracing::warn!(
                    percent = format_args!("{:.1}", progress(processed, total)),
                    "syncing history data..."
                );
                last_report = Instant::now();
            }

            let delayed = drained.skipped_clock.is_some_and(|c| c < oldest_allowed);
            if rounds == 0 && !full && !delayed {
                break;
            }
        }

        if full {
            tracing::warn!(processed, "syncing history data done");
            if self.role == Role::Server {
                self.sync_trends()?;
            }
        }

        Ok(processed)
    }

    /// Flushes every open trend aggregate in one transaction without
    /// touching the live aggregates. Returns the number persisted.
    pub fn sync_trends(&self) -> Result<usize> {
        tracing::warn!("syncing trends data...");

        let mut pending = {
            let mut open = self.cache.trends().lock();
            let pending = open.drain_all();
            self.cache.stats().set_trends_open(open.len());
            pending
        };

        let persisted = if pending.is_empty() {
            0
        } else {
            self.in_transaction(|| self.trends.flush(&mut pending, None))
                .context("flushing open trends")?
        };

        tracing::warn!(persisted, "syncing trends data done");

        Ok(persisted)
    }

    fn run_round(&self, mut records: Vec<HistoryRecord>) -> Result<usize> {
        let started = Instant::now();
        let count = records.len();

        let result = self.in_transaction(|| match self.role {
            Role::Server => self.process_server(&mut records),
            Role::Proxy => self.process_proxy(&records),
        });

        match &result {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.observe_round(count, started.elapsed());
                }
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    records = count,
                    "sync round failed, drained records are dropped"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.sync_errors.inc();
                }
            }
        }

        result.map(|()| count)
    }

    fn in_transaction<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let store = &self.deps.store;
        store.begin().context("beginning transaction")?;

        match f() {
            Ok(value) => {
                store.commit().context("committing transaction")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = store.rollback() {
                    tracing::error!(error = %rollback, "rolling back transaction");
                }
                Err(e)
            }
        }
    }

    fn process_server(&self, records: &mut [HistoryRecord]) -> Result<()> {
        let updates = self
            .merger
            .merge(self.deps.catalog.as_ref(), records)
            .context("merging item state")?;
        if !updates.is_empty() {
            self.deps
                .store
                .update_items(updates)
                .context("updating items")?;
        }

        let mut tables: HashMap<HistoryTable, Vec<HistoryRow>> = HashMap::new();
        for record in records.iter().filter(|r| r.persist_history && !r.is_null) {
            let Some(value) = record.effective_value() else {
                continue;
            };
            tables
                .entry(HistoryTable::for_kind(value.kind()))
                .or_default()
                .push(history_row(record, Some(value.clone())));
        }
        for (table, rows) in tables {
            self.insert_history(table, rows)?;
        }

        let touched: Vec<(u64, Timespec)> = records
            .iter()
            .filter(|r| !r.is_null)
            .map(|r| (r.item_id, r.ts))
            .collect();
        if !touched.is_empty() {
            self.deps
                .triggers
                .recalculate(&touched)
                .context("recalculating triggers")?;
        }

        let mut pending = {
            let mut open = self.cache.trends().lock();
            let pending = open.ingest_batch(records);
            self.cache.stats().set_trends_open(open.len());
            pending
        };
        self.trends
            .flush(&mut pending, Some(self.cache.trends()))
            .context("flushing closed trends")?;

        Ok(())
    }

    fn process_proxy(&self, records: &[HistoryRecord]) -> Result<()> {
        let rows = records
            .iter()
            .map(|r| history_row(r, r.value.clone()))
            .collect();
        self.insert_history(HistoryTable::Proxy, rows)?;

        let updates = ItemStateMerger::proxy_updates(records);
        if !updates.is_empty() {
            self.deps
                .store
                .update_items(updates)
                .context("updating items")?;
        }

        Ok(())
    }

    fn insert_history(&self, table: HistoryTable, mut rows: Vec<HistoryRow>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        if table.has_id() {
            let first = self
                .cache
                .ids()
                .next_id(self.deps.store.as_ref(), table.name(), rows.len() as u64)?;
            for (id, row) in (first..).zip(rows.iter_mut()) {
                row.id = Some(id);
            }
        }

        self.deps
            .store
            .insert_history(table, rows)
            .with_context(|| format!("inserting into {}", table.name()))
    }
}

fn history_row(record: &HistoryRecord, value: Option<HistoryValue>) -> HistoryRow {
    HistoryRow {
        id: None,
        item_id: record.item_id,
        clock: record.ts.sec,
        ns: record.ts.ns,
        value,
        log: record.log.clone(),
        state: record.state,
        error: record.error.clone(),
    }
}

fn progress(processed: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (100.0 * processed as f64 / total as f64).min(100.0)
}
