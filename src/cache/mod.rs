//! Shared history write-back cache.
//!
//! Producers append values under the cache lock; sync workers drain bounded
//! batches, persist them outside the lock and release their items again.
//! Strings live in a separate [`TextArena`](text::TextArena) so ring slots
//! stay fixed-size.

pub mod inflight;
pub mod local;
pub mod record;
pub mod ring;
pub mod stats;
pub mod text;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::CacheError;
use crate::ids::IdCache;
use crate::trends::{TrendAggregate, TrendAggregator};

use self::inflight::InFlightItems;
use self::record::{ItemValue, LogMeta, Payload, Slot, SlotLog, SlotValue, Timespec};
use self::ring::{Drained, HistoryRing};
use self::stats::{CacheStats, Stat, StatValue};
use self::text::TextArena;

pub use self::local::LocalValues;

/// How far a sync pass drains the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Process the backlog down to less than one batch.
    Incremental,
    /// Drain everything, including open trends. Used at shutdown.
    FullDrain,
}

/// Sizes derived from configuration at init time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    pub ring_capacity: usize,
    pub text_capacity: usize,
    /// Byte budget reported for open trends.
    pub trend_capacity: usize,
    /// Records drained per sync round.
    pub batch_limit: usize,
    /// Longest a blocked producer sleeps before rechecking for space.
    pub backoff: Duration,
}

impl CacheLimits {
    /// Bytes occupied by one ring slot.
    pub const fn slot_size() -> usize {
        std::mem::size_of::<Slot>()
    }

    pub const fn trend_size() -> usize {
        std::mem::size_of::<TrendAggregate>()
    }
}

struct CacheState {
    ring: HistoryRing,
    text: TextArena,
    in_flight: InFlightItems,
    /// Last synthetic nanosecond handed out.
    last_ts: Timespec,
}

/// History cache shared by producers and sync workers.
pub struct Cache {
    state: Mutex<CacheState>,
    space: Condvar,
    trends: Mutex<TrendAggregator>,
    ids: IdCache,
    stats: CacheStats,
    limits: CacheLimits,
    closed: AtomicBool,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("limits", &self.limits)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Cache {
    pub fn new(limits: CacheLimits) -> Self {
        let trend_slots = limits.trend_capacity / CacheLimits::trend_size();

        Self {
            state: Mutex::new(CacheState {
                ring: HistoryRing::new(limits.ring_capacity),
                text: TextArena::new(limits.text_capacity),
                in_flight: InFlightItems::with_capacity(limits.batch_limit),
                last_ts: Timespec::default(),
            }),
            space: Condvar::new(),
            trends: Mutex::new(TrendAggregator::with_capacity(trend_slots)),
            ids: IdCache::new(),
            stats: CacheStats::new(limits.text_capacity),
            limits,
            closed: AtomicBool::new(false),
        }
    }

    pub fn limits(&self) -> &CacheLimits {
        &self.limits
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn ids(&self) -> &IdCache {
        &self.ids
    }

    /// Open trend aggregates, guarded by the trends lock.
    pub fn trends(&self) -> &Mutex<TrendAggregator> {
        &self.trends
    }

    pub fn add_history_float(
        &self,
        item_id: u64,
        ts: Timespec,
        value: f64,
    ) -> Result<(), CacheError> {
        self.add_value(ItemValue {
            item_id,
            ts,
            payload: Payload::Float(value),
        })
    }

    pub fn add_history_uint(
        &self,
        item_id: u64,
        ts: Timespec,
        value: u64,
    ) -> Result<(), CacheError> {
        self.add_value(ItemValue {
            item_id,
            ts,
            payload: Payload::UInt64(value),
        })
    }

    pub fn add_history_str(
        &self,
        item_id: u64,
        ts: Timespec,
        value: &str,
    ) -> Result<(), CacheError> {
        self.add_value(ItemValue {
            item_id,
            ts,
            payload: local::str_payload(value),
        })
    }

    pub fn add_history_text(
        &self,
        item_id: u64,
        ts: Timespec,
        value: &str,
    ) -> Result<(), CacheError> {
        self.add_value(ItemValue {
            item_id,
            ts,
            payload: local::text_payload(value),
        })
    }

    pub fn add_history_log(
        &self,
        item_id: u64,
        ts: Timespec,
        value: &str,
        meta: LogMeta,
    ) -> Result<(), CacheError> {
        self.add_value(ItemValue {
            item_id,
            ts,
            payload: local::log_payload(value, meta),
        })
    }

    pub fn add_history_notsupported(
        &self,
        item_id: u64,
        ts: Timespec,
        error: &str,
    ) -> Result<(), CacheError> {
        self.add_value(ItemValue {
            item_id,
            ts,
            payload: local::notsupported_payload(error),
        })
    }

    /// Stores one value, blocking while the cache is full.
    pub fn add_value(&self, value: ItemValue) -> Result<(), CacheError> {
        self.check_fits(&value)?;

        let mut state = self.state.lock();
        self.store_locked(&mut state, value)?;
        self.publish_ring(&state);

        Ok(())
    }

    /// Stores a staged batch under one lock acquisition, blocking while the
    /// cache is full. `values` is left empty.
    ///
    /// A value too large for the text arena, or one for item 0, fails the
    /// call before anything is stored.
    pub fn add_values(&self, values: &mut Vec<ItemValue>) -> Result<(), CacheError> {
        if let Some(err) = values.iter().find_map(|v| self.check_fits(v).err()) {
            values.clear();
            return Err(err);
        }
        if values.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock();
        let mut result = Ok(());
        for value in values.drain(..) {
            if result.is_ok() {
                result = self.store_locked(&mut state, value);
            }
        }
        self.publish_ring(&state);

        result
    }

    fn check_fits(&self, value: &ItemValue) -> Result<(), CacheError> {
        // Zero marks a consumed slot in the ring.
        if value.item_id == 0 {
            return Err(CacheError::InvalidItem);
        }
        let len = value.payload.text_len();
        if len > self.limits.text_capacity {
            return Err(CacheError::ValueTooLarge {
                item_id: value.item_id,
                len,
                capacity: self.limits.text_capacity,
            });
        }
        Ok(())
    }

    fn store_locked(
        &self,
        state: &mut MutexGuard<'_, CacheState>,
        mut value: ItemValue,
    ) -> Result<(), CacheError> {
        let text_len = value.payload.text_len();

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(CacheError::Closed);
            }

            if state.ring.is_full() {
                state.ring.vacuum();
            }

            if !state.ring.is_full() && text_len > 0 && !state.text.fits(text_len) {
                let CacheState { ring, text, .. } = &mut **state;
                if text.compaction_worthwhile() {
                    ring.compact_text(text);
                }
            }

            if !state.ring.is_full() && state.text.fits(text_len) {
                break;
            }

            tracing::debug!(
                item_id = value.item_id,
                history_num = state.ring.len(),
                text_free = state.text.free(),
                "history cache is full, waiting for a sync round"
            );
            self.space.wait_for(state, self.limits.backoff);
        }

        fill_ns(&mut state.last_ts, &mut value.ts);
        self.stats.record(&value.payload);

        let CacheState { ring, text, .. } = &mut **state;
        let slot = to_slot(text, value);
        ring.push(slot);

        Ok(())
    }

    fn publish_ring(&self, state: &CacheState) {
        self.stats
            .set_ring(state.ring.len(), state.ring.gap_count(), state.text.free());
    }

    /// Drains up to `max` records for a sync round and wakes blocked
    /// producers. See [`HistoryRing::drain`] for `exclusive`.
    pub fn consume_batch(&self, max: usize, exclusive: bool) -> Drained {
        let mut state = self.state.lock();
        let CacheState {
            ring,
            text,
            in_flight,
            ..
        } = &mut *state;

        let drained = ring.drain(text, in_flight, max, exclusive);
        tracing::debug!(
            history_num = ring.len(),
            first = ring.first(),
            gap_count = ring.gap_count(),
            taken = drained.records.len(),
            "history batch drained"
        );
        self.publish_ring(&state);
        drop(state);

        if !drained.records.is_empty() {
            self.space.notify_all();
        }

        drained
    }

    /// Returns items of a finished batch to the pool of drainable items.
    pub fn release_items<I: IntoIterator<Item = u64>>(&self, item_ids: I) {
        self.state.lock().in_flight.remove_all(item_ids);
    }

    pub fn clear_in_flight(&self) {
        self.state.lock().in_flight.clear();
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Queued slots, gaps included.
    pub fn len(&self) -> usize {
        self.state.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().ring.live() == 0
    }

    /// Clock of the newest queued value of `item_id`.
    pub fn last_clock(&self, item_id: u64) -> Option<i64> {
        self.state.lock().ring.last_clock(item_id)
    }

    /// Refuses further values and wakes every blocked producer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = self.state.lock();
        self.space.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reads one statistic without taking the cache lock.
    pub fn get_stats(&self, stat: Stat) -> StatValue {
        let snap = self.stats.snapshot();
        let limits = &self.limits;

        let history_total = (limits.ring_capacity * CacheLimits::slot_size()) as u64;
        let history_used =
            snap.ring_count.saturating_sub(snap.ring_gaps) * CacheLimits::slot_size() as u64;
        let text_total = limits.text_capacity as u64;
        let trend_total = limits.trend_capacity as u64;
        let trend_used = (snap.trends_open * CacheLimits::trend_size() as u64).min(trend_total);

        match stat {
            Stat::HistoryCounter => StatValue::UInt(snap.history),
            Stat::HistoryFloatCounter => StatValue::UInt(snap.float),
            Stat::HistoryUintCounter => StatValue::UInt(snap.uint),
            Stat::HistoryStrCounter => StatValue::UInt(snap.str),
            Stat::HistoryLogCounter => StatValue::UInt(snap.log),
            Stat::HistoryTextCounter => StatValue::UInt(snap.text),
            Stat::NotSupportedCounter => StatValue::UInt(snap.not_supported),
            Stat::HistoryTotal => StatValue::UInt(history_total),
            Stat::HistoryUsed => StatValue::UInt(history_used),
            Stat::HistoryFree => StatValue::UInt(history_total.saturating_sub(history_used)),
            Stat::HistoryPFree => {
                let cap = limits.ring_capacity as u64;
                let free = cap.saturating_sub(snap.ring_count) + snap.ring_gaps;
                StatValue::Float(percent(free, cap))
            }
            Stat::TextTotal => StatValue::UInt(text_total),
            Stat::TextUsed => StatValue::UInt(text_total.saturating_sub(snap.text_free)),
            Stat::TextFree => StatValue::UInt(snap.text_free),
            Stat::TextPFree => StatValue::Float(percent(snap.text_free, text_total)),
            Stat::TrendTotal => StatValue::UInt(trend_total),
            Stat::TrendUsed => StatValue::UInt(trend_used),
            Stat::TrendFree => StatValue::UInt(trend_total - trend_used),
            Stat::TrendPFree => StatValue::Float(percent(trend_total - trend_used, trend_total)),
        }
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    100.0 * part as f64 / total as f64
}

/// Assigns a synthetic nanosecond part to timestamps that lack one, so
/// values of the same second keep their arrival order.
fn fill_ns(last: &mut Timespec, ts: &mut Timespec) {
    if ts.ns >= 0 {
        return;
    }

    ts.ns = last.ns;
    last.ns += 1;

    if (last.ns > 999_900_000 && last.sec != ts.sec) || last.ns == 1_000_000_000 {
        last.ns = 0;
    }
    last.sec = ts.sec;
}

fn to_slot(text: &mut TextArena, value: ItemValue) -> Slot {
    let mut log = None;

    let slot_value = match value.payload {
        Payload::Float(v) => SlotValue::Float(v),
        Payload::UInt64(v) => SlotValue::UInt64(v),
        Payload::Str(s) => SlotValue::Str(text.store(&s)),
        Payload::Text(s) => SlotValue::Text(text.store(&s)),
        Payload::NotSupported(s) => SlotValue::Error(text.store(&s)),
        Payload::Log { value: s, meta } => {
            let r = text.store(&s);
            log = Some(SlotLog {
                timestamp: meta.timestamp,
                source: meta.source.as_deref().map(|src| text.store(src)),
                severity: meta.severity,
                event_id: meta.event_id,
                last_log_size: meta.last_log_size,
                mtime: meta.mtime,
            });
            SlotValue::Log(r)
        }
    };

    Slot {
        item_id: value.item_id,
        ts: value.ts,
        run: 1,
        value: slot_value,
        log,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::cache::record::{HistoryValue, ItemState};

    fn limits(ring_capacity: usize, text_capacity: usize) -> CacheLimits {
        CacheLimits {
            ring_capacity,
            text_capacity,
            trend_capacity: 4096,
            batch_limit: 16,
            backoff: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_fill_ns_sequence() {
        let mut last = Timespec::default();

        let mut a = Timespec::from_secs(10);
        let mut b = Timespec::from_secs(10);
        let mut explicit = Timespec::new(10, 5);
        fill_ns(&mut last, &mut a);
        fill_ns(&mut last, &mut b);
        fill_ns(&mut last, &mut explicit);

        assert_eq!(a.ns, 0);
        assert_eq!(b.ns, 1);
        assert_eq!(explicit.ns, 5);
        assert_eq!(last, Timespec::new(10, 2));
    }

    #[test]
    fn test_fill_ns_wraps() {
        let mut last = Timespec::new(10, 999_999_999);
        let mut ts = Timespec::from_secs(10);
        fill_ns(&mut last, &mut ts);
        assert_eq!(ts.ns, 999_999_999);
        assert_eq!(last.ns, 0);

        let mut last = Timespec::new(10, 999_950_000);
        let mut ts = Timespec::from_secs(11);
        fill_ns(&mut last, &mut ts);
        assert_eq!(last, Timespec::new(11, 0));
    }

    #[test]
    fn test_strings_round_trip_through_arena() {
        let cache = Cache::new(limits(8, 256));
        cache
            .add_history_str(7, Timespec::new(10, 0), "hello")
            .expect("add");
        cache
            .add_history_log(
                8,
                Timespec::new(11, 0),
                "line",
                LogMeta {
                    source: Some("syslog".into()),
                    severity: 3,
                    ..Default::default()
                },
            )
            .expect("add");
        cache
            .add_history_notsupported(9, Timespec::new(12, 0), "timeout")
            .expect("add");

        let drained = cache.consume_batch(10, false);
        assert_eq!(drained.records.len(), 3);
        assert_eq!(
            drained.records[0].value,
            Some(HistoryValue::Str("hello".into()))
        );
        let log = drained.records[1].log.as_ref().expect("log meta");
        assert_eq!(log.source.as_deref(), Some("syslog"));
        assert_eq!(log.severity, 3);
        assert_eq!(drained.records[2].state, ItemState::NotSupported);
        assert_eq!(drained.records[2].error.as_deref(), Some("timeout"));
        assert!(drained.records[2].is_null);

        assert_eq!(cache.get_stats(Stat::TextUsed).as_u64(), Some(0));
    }

    #[test]
    fn test_oversized_value_rejected_before_storing() {
        let cache = Cache::new(limits(8, 8));
        let mut values = vec![
            ItemValue {
                item_id: 1,
                ts: Timespec::new(1, 0),
                payload: Payload::Float(1.0),
            },
            ItemValue {
                item_id: 2,
                ts: Timespec::new(1, 0),
                payload: Payload::Text("much too long".into()),
            },
        ];

        let err = cache.add_values(&mut values).unwrap_err();
        assert_eq!(
            err,
            CacheError::ValueTooLarge {
                item_id: 2,
                len: 14,
                capacity: 8
            }
        );
        assert!(values.is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_item_zero_rejected() {
        let cache = Cache::new(limits(8, 64));
        assert_eq!(
            cache.add_history_float(0, Timespec::new(1, 0), 1.0),
            Err(CacheError::InvalidItem)
        );
        cache
            .add_history_float(5, Timespec::new(2, 0), 2.0)
            .expect("add");

        let mut values = vec![
            ItemValue {
                item_id: 6,
                ts: Timespec::new(3, 0),
                payload: Payload::Float(3.0),
            },
            ItemValue {
                item_id: 0,
                ts: Timespec::new(3, 0),
                payload: Payload::Str("lost".into()),
            },
        ];
        assert_eq!(cache.add_values(&mut values), Err(CacheError::InvalidItem));
        assert!(values.is_empty());

        let drained = cache.consume_batch(4, true);
        assert_eq!(drained.records.len(), 1);
        assert_eq!(drained.records[0].item_id, 5);
        assert!(cache.is_empty());
        assert_eq!(cache.get_stats(Stat::HistoryUsed).as_u64(), Some(0));
    }

    #[test]
    fn test_text_compaction_makes_room() {
        let cache = Cache::new(limits(8, 16));
        cache
            .add_history_str(1, Timespec::new(1, 0), "aaaaaa")
            .expect("add");
        cache
            .add_history_str(2, Timespec::new(2, 0), "bbbbbb")
            .expect("add");
        cache.consume_batch(1, false);

        // 2 bytes left at the tail, 7 reclaimable below it.
        cache
            .add_history_str(3, Timespec::new(3, 0), "cccccc")
            .expect("add after compaction");

        let values: Vec<_> = cache
            .consume_batch(10, false)
            .records
            .into_iter()
            .filter_map(|r| r.value)
            .collect();
        assert_eq!(
            values,
            vec![
                HistoryValue::Str("bbbbbb".into()),
                HistoryValue::Str("cccccc".into())
            ]
        );
    }

    #[test]
    fn test_full_ring_blocks_until_drained() {
        let cache = Arc::new(Cache::new(limits(2, 64)));
        cache
            .add_history_float(1, Timespec::new(1, 0), 1.0)
            .expect("add");
        cache
            .add_history_float(1, Timespec::new(2, 0), 2.0)
            .expect("add");

        let producer = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.add_history_float(2, Timespec::new(3, 0), 3.0))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        let drained = cache.consume_batch(1, true);
        assert_eq!(drained.records.len(), 1);

        producer
            .join()
            .expect("producer thread")
            .expect("value stored once space freed");
        assert_eq!(cache.last_clock(2), Some(3));
    }

    #[test]
    fn test_full_ring_with_gaps_is_vacuumed_for_producer() {
        let cache = Arc::new(Cache::new(limits(8, 64)));
        for (sec, item_id) in [1u64, 1, 2, 3, 1, 1, 1, 1].into_iter().enumerate() {
            cache
                .add_history_float(item_id, Timespec::new(sec as i64 + 1, 0), 1.0)
                .expect("add");
        }

        // Takes the head and items 2 and 3; the latter leave gaps mid-ring.
        let drained = cache.consume_batch(8, true);
        assert_eq!(drained.records.len(), 3);
        assert_eq!(cache.len(), 7);
        assert_eq!(cache.state.lock().ring.gap_count(), 2);

        let producer = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for item_id in 5..=7 {
                    cache.add_history_float(item_id, Timespec::new(20, 0), 2.0)?;
                }
                Ok::<(), CacheError>(())
            })
        };

        for _ in 0..100 {
            if producer.is_finished() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let finished = producer.is_finished();
        cache.close();
        assert!(finished, "producer waited although vacuum could free slots");
        producer
            .join()
            .expect("producer thread")
            .expect("stored without a sync round");

        assert_eq!(cache.state.lock().ring.gap_count(), 0);
        let items: Vec<u64> = cache
            .consume_batch(16, false)
            .records
            .iter()
            .map(|r| r.item_id)
            .collect();
        assert_eq!(items, vec![1, 1, 1, 1, 1, 5, 6, 7]);
    }

    #[test]
    fn test_close_wakes_blocked_producer() {
        let cache = Arc::new(Cache::new(limits(1, 64)));
        cache
            .add_history_uint(1, Timespec::new(1, 0), 1)
            .expect("add");

        let producer = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.add_history_uint(2, Timespec::new(2, 0), 2))
        };
        thread::sleep(Duration::from_millis(20));
        cache.close();

        assert_eq!(
            producer.join().expect("producer thread"),
            Err(CacheError::Closed)
        );
    }

    #[test]
    fn test_stats_track_usage() {
        let cache = Cache::new(limits(10, 100));
        for i in 0..4 {
            cache
                .add_history_float(i + 1, Timespec::new(1, 0), 1.0)
                .expect("add");
        }
        cache.add_history_str(9, Timespec::new(1, 0), "abc").expect("add");

        assert_eq!(cache.get_stats(Stat::HistoryCounter).as_u64(), Some(5));
        assert_eq!(cache.get_stats(Stat::HistoryFloatCounter).as_u64(), Some(4));
        assert_eq!(
            cache.get_stats(Stat::HistoryUsed).as_u64(),
            Some(5 * CacheLimits::slot_size() as u64)
        );
        assert_eq!(cache.get_stats(Stat::TextUsed).as_u64(), Some(4));
        assert!((cache.get_stats(Stat::HistoryPFree).as_f64() - 50.0).abs() < 1e-9);
        assert!((cache.get_stats(Stat::TextPFree).as_f64() - 96.0).abs() < 1e-9);
    }
}
