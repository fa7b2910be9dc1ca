use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;

use crate::cache::record::ValueKind;
use crate::clock::SECONDS_PER_HOUR;
use crate::store::{ClockMatch, Store, TrendQuery, TrendRow};

use super::aggregate::TrendAggregate;
use super::aggregator::TrendAggregator;

/// Persists closed trend aggregates, merging with rows other writers
/// already stored for the same item and hour.
pub struct TrendFlushEngine {
    store: Arc<dyn Store>,
    batch_limit: usize,
}

impl TrendFlushEngine {
    pub fn new(store: Arc<dyn Store>, batch_limit: usize) -> Self {
        Self {
            store,
            batch_limit: batch_limit.max(1),
        }
    }

    /// Flushes `pending` one `(hour, kind)` round at a time until it is
    /// empty. Returns the number of aggregates persisted.
    ///
    /// With `live`, items found absent from the store get their live
    /// aggregate marked for the following hour. On error, `pending` keeps
    /// whatever was not persisted yet.
    pub fn flush(
        &self,
        pending: &mut Vec<TrendAggregate>,
        live: Option<&Mutex<TrendAggregator>>,
    ) -> Result<usize> {
        let mut persisted = 0;

        while !pending.is_empty() {
            persisted += self.flush_round(pending, live)?;
        }

        Ok(persisted)
    }

    fn flush_round(
        &self,
        pending: &mut Vec<TrendAggregate>,
        live: Option<&Mutex<TrendAggregator>>,
    ) -> Result<usize> {
        let hour = pending[0].hour;
        let kind = pending[0].kind();
        let table = pending[0].table();

        let round = self.select_round(pending, hour, kind);

        // Items with no row at or after this hour cannot collide with
        // another writer, so they are inserted without a merge lookup.
        let unchecked: Vec<u64> = round
            .iter()
            .map(|&i| &pending[i])
            .filter(|agg| agg.quarantined_from.is_none())
            .map(|agg| agg.item_id)
            .collect();
        if !unchecked.is_empty() {
            let found: HashSet<u64> = self
                .store
                .select_trends(
                    table,
                    &TrendQuery {
                        clock: ClockMatch::AtLeast(hour),
                        item_ids: &unchecked,
                    },
                )
                .with_context(|| format!("failed to look up {} rows", table.name()))?
                .into_iter()
                .map(|row| row.item_id)
                .collect();

            for &i in &round {
                let agg = &mut pending[i];
                if agg.quarantined_from.is_none() && !found.contains(&agg.item_id) {
                    agg.quarantined_from = Some(hour);
                }
            }
        }

        let mergeable: Vec<u64> = round
            .iter()
            .map(|&i| &pending[i])
            .filter(|agg| agg.quarantined_from.map_or(true, |from| from > hour))
            .map(|agg| agg.item_id)
            .collect();
        let existing: HashMap<u64, TrendRow> = if mergeable.is_empty() {
            HashMap::new()
        } else {
            self.store
                .select_trends(
                    table,
                    &TrendQuery {
                        clock: ClockMatch::Exactly(hour),
                        item_ids: &mergeable,
                    },
                )
                .with_context(|| format!("failed to read {} rows to merge", table.name()))?
                .into_iter()
                .map(|row| (row.item_id, row))
                .collect()
        };

        let mut updates = Vec::new();
        let mut inserts = Vec::new();
        for &i in &round {
            let agg = &pending[i];
            match existing.get(&agg.item_id).and_then(|row| agg.merge(row)) {
                Some(merged) => updates.push(merged),
                None => inserts.push(agg.to_row()),
            }
        }

        if let Some(live) = live {
            let mut trends = live.lock();
            for &i in &round {
                let agg = &pending[i];
                if agg.quarantined_from.is_some() {
                    trends.quarantine(agg.item_id, hour + SECONDS_PER_HOUR);
                }
            }
        }

        let (n_updates, n_inserts) = (updates.len(), inserts.len());
        if !updates.is_empty() {
            self.store
                .update_trends(table, updates)
                .with_context(|| format!("failed to update {} rows", table.name()))?;
        }
        if !inserts.is_empty() {
            self.store
                .insert_trends(table, inserts)
                .with_context(|| format!("failed to insert {} rows", table.name()))?;
        }

        tracing::debug!(
            table = table.name(),
            hour,
            updated = n_updates,
            inserted = n_inserts,
            "trend round flushed"
        );

        let done: HashSet<usize> = round.into_iter().collect();
        let mut idx = 0;
        pending.retain(|_| {
            let keep = !done.contains(&idx);
            idx += 1;
            keep
        });

        Ok(done.len())
    }

    /// Indices of up to `batch_limit` pending aggregates of one hour and
    /// kind, at most one per item.
    fn select_round(&self, pending: &[TrendAggregate], hour: i64, kind: ValueKind) -> Vec<usize> {
        let mut seen = HashSet::new();
        pending
            .iter()
            .enumerate()
            .filter(|(_, agg)| agg.hour == hour && agg.kind() == kind)
            .filter(|(_, agg)| seen.insert(agg.item_id))
            .map(|(i, _)| i)
            .take(self.batch_limit)
            .collect()
    }
}
