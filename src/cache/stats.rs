use std::sync::atomic::{AtomicU64, Ordering};

use super::record::Payload;

/// Statistic selector for [`Cache::get_stats`](super::Cache::get_stats).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    HistoryCounter,
    HistoryFloatCounter,
    HistoryUintCounter,
    HistoryStrCounter,
    HistoryLogCounter,
    HistoryTextCounter,
    NotSupportedCounter,
    HistoryTotal,
    HistoryUsed,
    HistoryFree,
    HistoryPFree,
    TextTotal,
    TextUsed,
    TextFree,
    TextPFree,
    TrendTotal,
    TrendUsed,
    TrendFree,
    TrendPFree,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatValue {
    UInt(u64),
    Float(f64),
}

impl StatValue {
    pub fn as_u64(self) -> Option<u64> {
        match self {
            Self::UInt(v) => Some(v),
            Self::Float(_) => None,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Self::UInt(v) => v as f64,
            Self::Float(v) => v,
        }
    }
}

/// Lock-free counters and occupancy gauges.
///
/// Counters only grow. Gauges are written by whoever holds the lock
/// guarding the measured structure and read without it, so readers see
/// best-effort values.
#[derive(Debug, Default)]
pub struct CacheStats {
    history: AtomicU64,
    float: AtomicU64,
    uint: AtomicU64,
    str: AtomicU64,
    log: AtomicU64,
    text: AtomicU64,
    not_supported: AtomicU64,

    ring_count: AtomicU64,
    ring_gaps: AtomicU64,
    text_free: AtomicU64,
    trends_open: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub history: u64,
    pub float: u64,
    pub uint: u64,
    pub str: u64,
    pub log: u64,
    pub text: u64,
    pub not_supported: u64,
    pub ring_count: u64,
    pub ring_gaps: u64,
    pub text_free: u64,
    pub trends_open: u64,
}

impl CacheStats {
    pub fn new(text_capacity: usize) -> Self {
        let stats = Self::default();
        stats
            .text_free
            .store(text_capacity as u64, Ordering::Relaxed);
        stats
    }

    /// Counts one value accepted into the ring.
    pub fn record(&self, payload: &Payload) {
        let counter = match payload {
            Payload::NotSupported(_) => {
                self.not_supported.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Payload::Float(_) => &self.float,
            Payload::UInt64(_) => &self.uint,
            Payload::Str(_) => &self.str,
            Payload::Text(_) => &self.text,
            Payload::Log { .. } => &self.log,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.history.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_ring(&self, count: usize, gaps: usize, text_free: usize) {
        self.ring_count.store(count as u64, Ordering::Relaxed);
        self.ring_gaps.store(gaps as u64, Ordering::Relaxed);
        self.text_free.store(text_free as u64, Ordering::Relaxed);
    }

    pub(crate) fn set_trends_open(&self, open: usize) {
        self.trends_open.store(open as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            history: self.history.load(Ordering::Relaxed),
            float: self.float.load(Ordering::Relaxed),
            uint: self.uint.load(Ordering::Relaxed),
            str: self.str.load(Ordering::Relaxed),
            log: self.log.load(Ordering::Relaxed),
            text: self.text.load(Ordering::Relaxed),
            not_supported: self.not_supported.load(Ordering::Relaxed),
            ring_count: self.ring_count.load(Ordering::Relaxed),
            ring_gaps: self.ring_gaps.load(Ordering::Relaxed),
            text_free: self.text_free.load(Ordering::Relaxed),
            trends_open: self.trends_open.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::record::LogMeta;

    #[test]
    fn test_record_counts_by_kind() {
        let stats = CacheStats::new(1024);
        stats.record(&Payload::Float(1.0));
        stats.record(&Payload::Float(2.0));
        stats.record(&Payload::Str("s".into()));
        stats.record(&Payload::Log {
            value: "l".into(),
            meta: LogMeta::default(),
        });
        stats.record(&Payload::NotSupported("timeout".into()));

        let snap = stats.snapshot();
        assert_eq!(snap.history, 4);
        assert_eq!(snap.float, 2);
        assert_eq!(snap.str, 1);
        assert_eq!(snap.log, 1);
        assert_eq!(snap.not_supported, 1);
        assert_eq!(snap.text_free, 1024);
    }

    #[test]
    fn test_stat_value_conversions() {
        assert_eq!(StatValue::UInt(3).as_u64(), Some(3));
        assert_eq!(StatValue::Float(2.5).as_u64(), None);
        assert!((StatValue::UInt(3).as_f64() - 3.0).abs() < f64::EPSILON);
    }
}
