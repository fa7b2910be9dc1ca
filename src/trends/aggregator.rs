use std::collections::HashMap;

use crate::cache::record::HistoryRecord;
use crate::clock::hour_start;

use super::aggregate::TrendAggregate;

/// Open hourly aggregates, at most one per item.
#[derive(Debug, Default)]
pub struct TrendAggregator {
    open: HashMap<u64, TrendAggregate>,
}

impl TrendAggregator {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            open: HashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    pub fn get(&self, item_id: u64) -> Option<&TrendAggregate> {
        self.open.get(&item_id)
    }

    /// Folds a drained record into its item's aggregate.
    ///
    /// Records that are null, not flagged for trends, or not numeric are
    /// ignored. When the record belongs to another hour or kind than the
    /// open aggregate, the old aggregate is moved to `pending` first.
    pub fn ingest(&mut self, record: &HistoryRecord, pending: &mut Vec<TrendAggregate>) {
        if record.is_null || !record.persist_trends {
            return;
        }
        let Some(value) = record.effective_value() else {
            return;
        };
        if !value.kind().is_numeric() {
            return;
        }

        let hour = hour_start(record.ts.sec);

        match self.open.get_mut(&record.item_id) {
            Some(agg) if agg.accepts(hour, value) => agg.ingest(value),
            Some(agg) => {
                if agg.count > 0 {
                    pending.push(*agg);
                }
                let quarantined_from = agg.quarantined_from;
                if let Some(fresh) = TrendAggregate::new(record.item_id, hour, value) {
                    *agg = TrendAggregate {
                        quarantined_from,
                        ..fresh
                    };
                }
            }
            None => {
                if let Some(fresh) = TrendAggregate::new(record.item_id, hour, value) {
                    self.open.insert(record.item_id, fresh);
                }
            }
        }
    }

    /// Ingests a whole batch and returns the aggregates it closed.
    pub fn ingest_batch(&mut self, records: &[HistoryRecord]) -> Vec<TrendAggregate> {
        let mut pending = Vec::new();
        for record in records {
            self.ingest(record, &mut pending);
        }
        pending
    }

    /// Removes and returns every open aggregate.
    pub fn drain_all(&mut self) -> Vec<TrendAggregate> {
        self.open.drain().map(|(_, agg)| agg).collect()
    }

    /// Marks the live aggregate of `item_id`, if any, as absent from the
    /// store starting at `from`.
    pub fn quarantine(&mut self, item_id: u64, from: i64) {
        if let Some(agg) = self.open.get_mut(&item_id) {
            agg.quarantined_from = Some(from);
        }
    }
}
