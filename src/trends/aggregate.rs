use crate::cache::record::{HistoryValue, ValueKind};
use crate::store::{TrendRow, TrendTable, TrendValues};

/// Running min/avg/max of one hour, typed by the item's value kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrendAccum {
    Float { min: f64, avg: f64, max: f64 },
    /// Averages of unsigned values are kept as a wide sum to avoid drift.
    UInt { min: u64, sum: u128, max: u64 },
}

/// Open hourly rollup for one item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendAggregate {
    pub item_id: u64,
    pub hour: i64,
    pub count: u32,
    pub values: TrendAccum,
    /// Hour from which this item's rows are known to be absent from the
    /// store. Rounds at or after it skip the merge lookup.
    pub quarantined_from: Option<i64>,
}

impl TrendAggregate {
    /// Opens an aggregate seeded with `value`. Returns `None` for kinds
    /// that do not feed trends.
    pub fn new(item_id: u64, hour: i64, value: &HistoryValue) -> Option<Self> {
        let values = match value {
            HistoryValue::Float(v) => TrendAccum::Float {
                min: *v,
                avg: *v,
                max: *v,
            },
            HistoryValue::UInt64(v) => TrendAccum::UInt {
                min: *v,
                sum: u128::from(*v),
                max: *v,
            },
            _ => return None,
        };

        Some(Self {
            item_id,
            hour,
            count: 1,
            values,
            quarantined_from: None,
        })
    }

    pub fn kind(&self) -> ValueKind {
        match self.values {
            TrendAccum::Float { .. } => ValueKind::Float,
            TrendAccum::UInt { .. } => ValueKind::UInt64,
        }
    }

    pub fn table(&self) -> TrendTable {
        match self.values {
            TrendAccum::Float { .. } => TrendTable::Float,
            TrendAccum::UInt { .. } => TrendTable::UInt,
        }
    }

    /// Whether `value` can be folded into this aggregate.
    pub fn accepts(&self, hour: i64, value: &HistoryValue) -> bool {
        self.hour == hour && self.kind() == value.kind()
    }

    /// Folds one sample in. Samples of another kind are ignored.
    pub fn ingest(&mut self, value: &HistoryValue) {
        match (&mut self.values, value) {
            (TrendAccum::Float { min, avg, max }, HistoryValue::Float(v)) => {
                if *v < *min {
                    *min = *v;
                }
                if *v > *max {
                    *max = *v;
                }
                let n = f64::from(self.count);
                *avg = (n * *avg + *v) / (n + 1.0);
            }
            (TrendAccum::UInt { min, sum, max }, HistoryValue::UInt64(v)) => {
                if *v < *min {
                    *min = *v;
                }
                if *v > *max {
                    *max = *v;
                }
                *sum += u128::from(*v);
            }
            _ => return,
        }
        self.count += 1;
    }

    /// Row holding this aggregate's values verbatim.
    pub fn to_row(&self) -> TrendRow {
        let values = match self.values {
            TrendAccum::Float { min, avg, max } => TrendValues::Float { min, avg, max },
            TrendAccum::UInt { min, sum, max } => TrendValues::UInt {
                min,
                avg: wide_avg(sum, self.count),
                max,
            },
        };

        TrendRow {
            item_id: self.item_id,
            clock: self.hour,
            count: self.count,
            values,
        }
    }

    /// Row combining this aggregate with an already persisted row of the
    /// same item and hour. Returns `None` if the row holds another kind.
    pub fn merge(&self, persisted: &TrendRow) -> Option<TrendRow> {
        let count = self.count.saturating_add(persisted.count);

        let values = match (self.values, persisted.values) {
            (
                TrendAccum::Float { min, avg, max },
                TrendValues::Float {
                    min: p_min,
                    avg: p_avg,
                    max: p_max,
                },
            ) => {
                let n = f64::from(self.count);
                let p_n = f64::from(persisted.count);
                TrendValues::Float {
                    min: if p_min < min { p_min } else { min },
                    avg: (avg * n + p_avg * p_n) / (n + p_n),
                    max: if p_max > max { p_max } else { max },
                }
            }
            (
                TrendAccum::UInt { min, sum, max },
                TrendValues::UInt {
                    min: p_min,
                    avg: p_avg,
                    max: p_max,
                },
            ) => {
                let total = sum + u128::from(persisted.count) * u128::from(p_avg);
                TrendValues::UInt {
                    min: min.min(p_min),
                    avg: wide_avg(total, count),
                    max: max.max(p_max),
                }
            }
            _ => return None,
        };

        Some(TrendRow {
            item_id: self.item_id,
            clock: self.hour,
            count,
            values,
        })
    }
}

fn wide_avg(sum: u128, count: u32) -> u64 {
    if count == 0 {
        return 0;
    }
    u64::try_from(sum / u128::from(count)).unwrap_or(u64::MAX)
}
