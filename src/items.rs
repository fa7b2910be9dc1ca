//! Item configuration lookups and per-item post-processing of drained
//! history.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use parking_lot::{Mutex, RwLock};

use crate::cache::record::{
    truncate_chars, HistoryRecord, HistoryValue, ItemState, Timespec, ValueKind, ERROR_LEN,
};
use crate::store::ItemUpdate;

/// Floats at or above this magnitude do not fit the history columns.
const FLOAT_LIMIT: f64 = 1e12;

/// How raw values are turned into stored values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreMode {
    #[default]
    AsIs,
    /// Change since the previous value divided by elapsed seconds.
    SpeedPerSecond,
    /// Change since the previous value.
    SimpleChange,
}

/// Configuration of one monitored item as seen by the sync workers.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemConfig {
    pub kind: ValueKind,
    pub active: bool,
    pub host_monitored: bool,
    pub store_mode: StoreMode,
    pub multiplier: Option<f64>,
    pub keep_history: bool,
    pub keep_trends: bool,
    pub state: ItemState,
    pub error: Option<String>,
}

impl ItemConfig {
    /// An active, monitored item that keeps history and trends.
    pub fn new(kind: ValueKind) -> Self {
        Self {
            kind,
            active: true,
            host_monitored: true,
            store_mode: StoreMode::AsIs,
            multiplier: None,
            keep_history: true,
            keep_trends: true,
            state: ItemState::Active,
            error: None,
        }
    }
}

/// Source of item configuration.
pub trait ItemCatalog: Send + Sync {
    /// Returns the configuration of every listed item that still exists.
    fn lookup(&self, item_ids: &[u64]) -> Result<HashMap<u64, ItemConfig>>;

    /// Records state transitions decided while merging a batch.
    fn apply(&self, updates: &[ItemUpdate]);
}

/// In-memory [`ItemCatalog`].
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    items: RwLock<HashMap<u64, ItemConfig>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, item_id: u64, config: ItemConfig) {
        self.items.write().insert(item_id, config);
    }

    pub fn remove(&self, item_id: u64) {
        self.items.write().remove(&item_id);
    }

    pub fn get(&self, item_id: u64) -> Option<ItemConfig> {
        self.items.read().get(&item_id).cloned()
    }
}

impl ItemCatalog for MemoryCatalog {
    fn lookup(&self, item_ids: &[u64]) -> Result<HashMap<u64, ItemConfig>> {
        let items = self.items.read();
        Ok(item_ids
            .iter()
            .filter_map(|id| items.get(id).map(|cfg| (*id, cfg.clone())))
            .collect())
    }

    fn apply(&self, updates: &[ItemUpdate]) {
        let mut items = self.items.write();
        for update in updates {
            let Some(cfg) = items.get_mut(&update.item_id) else {
                continue;
            };
            if let Some(state) = update.state {
                cfg.state = state;
            }
            if let Some(error) = &update.error {
                cfg.error = (!error.is_empty()).then(|| error.clone());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PrevValue {
    value: HistoryValue,
    ts: Timespec,
}

/// Applies item configuration to drained records and works out the item
/// column changes they imply.
///
/// Keeps the previous raw value of every delta item between batches.
#[derive(Debug, Default)]
pub struct ItemStateMerger {
    prev: Mutex<HashMap<u64, PrevValue>>,
}

impl ItemStateMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks records of gone, disabled or mismatched items as null, sets
    /// the persistence flags and derived values of the rest, and returns
    /// the item updates, ordered by item id.
    pub fn merge(
        &self,
        catalog: &dyn ItemCatalog,
        records: &mut [HistoryRecord],
    ) -> Result<Vec<ItemUpdate>> {
        let mut item_ids: Vec<u64> = records.iter().map(|r| r.item_id).collect();
        item_ids.sort_unstable();
        item_ids.dedup();

        let configs = catalog.lookup(&item_ids)?;
        let mut updates: BTreeMap<u64, ItemUpdate> = BTreeMap::new();
        let mut prev = self.prev.lock();

        for record in records.iter_mut() {
            record.persist_history = false;
            record.persist_trends = false;

            let Some(cfg) = configs.get(&record.item_id) else {
                // Deleted item: its delta bookkeeping goes with it.
                prev.remove(&record.item_id);
                record.is_null = true;
                continue;
            };
            if !cfg.active || !cfg.host_monitored {
                record.is_null = true;
                continue;
            }

            if record.state == ItemState::NotSupported {
                record.is_null = true;
                let error = record.error.clone().unwrap_or_default();
                let known = cfg.error.as_deref() == Some(error.as_str());
                if cfg.state != ItemState::NotSupported || !known {
                    let update = entry(&mut updates, record.item_id);
                    update.state = Some(ItemState::NotSupported);
                    update.error = Some(error);
                }
                continue;
            }

            let Some(value) = record.value.clone() else {
                record.is_null = true;
                continue;
            };
            if value.kind() != cfg.kind {
                record.is_null = true;
                continue;
            }

            record.persist_history = cfg.keep_history;
            record.persist_trends = cfg.keep_trends && cfg.kind.is_numeric();

            if let Some(log) = &record.log {
                let update = entry(&mut updates, record.item_id);
                update.last_log_size = Some(log.last_log_size);
                update.mtime = Some(log.mtime);
            }

            let derived = if cfg.kind.is_numeric() {
                let previous = if cfg.store_mode == StoreMode::AsIs {
                    None
                } else {
                    prev.insert(
                        record.item_id,
                        PrevValue {
                            value: value.clone(),
                            ts: record.ts,
                        },
                    )
                };
                derive(cfg, &value, record.ts, previous.as_ref())
            } else {
                Derived::Value(value.clone())
            };

            let update = entry(&mut updates, record.item_id);
            match derived {
                Derived::Value(v) => {
                    let was_unsupported = update.state == Some(ItemState::NotSupported)
                        || (update.state.is_none() && cfg.state == ItemState::NotSupported);
                    if was_unsupported {
                        update.state = Some(ItemState::Active);
                        update.error = Some(String::new());
                    }
                    update.prev_value = update.last_value.take();
                    update.last_value = Some(v.clone());
                    update.last_ts = Some(record.ts);
                    if cfg.kind.is_numeric() {
                        record.derived = Some(v);
                    }
                }
                Derived::Null => {
                    record.is_null = true;
                }
                Derived::Unsupported(error) => {
                    record.is_null = true;
                    record.state = ItemState::NotSupported;
                    record.error = Some(error.clone());
                    update.state = Some(ItemState::NotSupported);
                    update.error = Some(error);
                }
            }
        }
        drop(prev);

        let updates: Vec<ItemUpdate> = updates.into_values().filter(|u| !u.is_empty()).collect();
        catalog.apply(&updates);

        Ok(updates)
    }

    /// Item updates for a proxy batch: the log position of the newest log
    /// record of each item.
    pub fn proxy_updates(records: &[HistoryRecord]) -> Vec<ItemUpdate> {
        let mut updates: BTreeMap<u64, ItemUpdate> = BTreeMap::new();
        let mut newest: HashMap<u64, Timespec> = HashMap::new();

        for record in records {
            let Some(log) = &record.log else {
                continue;
            };
            let seen = newest.entry(record.item_id).or_insert(record.ts);
            if record.ts < *seen {
                continue;
            }
            *seen = record.ts;

            let update = entry(&mut updates, record.item_id);
            update.last_log_size = Some(log.last_log_size);
            update.mtime = Some(log.mtime);
        }

        updates.into_values().collect()
    }
}

fn entry(updates: &mut BTreeMap<u64, ItemUpdate>, item_id: u64) -> &mut ItemUpdate {
    updates
        .entry(item_id)
        .or_insert_with(|| ItemUpdate::new(item_id))
}

enum Derived {
    Value(HistoryValue),
    /// No value can be computed yet, e.g. the first sample of a delta item.
    Null,
    Unsupported(String),
}

fn derive(
    cfg: &ItemConfig,
    value: &HistoryValue,
    ts: Timespec,
    prev: Option<&PrevValue>,
) -> Derived {
    let base = match cfg.store_mode {
        StoreMode::AsIs => value.clone(),
        StoreMode::SimpleChange | StoreMode::SpeedPerSecond => {
            let Some(prev) = prev else {
                return Derived::Null;
            };
            let delta = match (&prev.value, value) {
                (HistoryValue::Float(p), HistoryValue::Float(v)) if p <= v => {
                    HistoryValue::Float(v - p)
                }
                (HistoryValue::UInt64(p), HistoryValue::UInt64(v)) if p <= v => {
                    HistoryValue::UInt64(v - p)
                }
                _ => return Derived::Null,
            };

            if cfg.store_mode == StoreMode::SimpleChange {
                delta
            } else {
                if prev.ts.sec == 0 || prev.ts >= ts {
                    return Derived::Null;
                }
                let seconds = ts.seconds_since(&prev.ts);
                match delta {
                    HistoryValue::Float(d) => HistoryValue::Float(d / seconds),
                    HistoryValue::UInt64(d) => HistoryValue::UInt64((d as f64 / seconds) as u64),
                    other => other,
                }
            }
        }
    };

    let scaled = match (base, cfg.multiplier) {
        (HistoryValue::Float(v), Some(m)) => HistoryValue::Float(v * m),
        (HistoryValue::UInt64(v), Some(m)) => {
            let r = v as f64 * m;
            if !(r.is_finite() && r >= 0.0 && r < u64::MAX as f64) {
                return Derived::Unsupported(not_suitable(r, ValueKind::UInt64));
            }
            HistoryValue::UInt64(r as u64)
        }
        (base, _) => base,
    };

    match scaled {
        HistoryValue::Float(v) if !v.is_finite() || v.abs() >= FLOAT_LIMIT => {
            Derived::Unsupported(not_suitable(v, ValueKind::Float))
        }
        v => Derived::Value(v),
    }
}

fn not_suitable(value: f64, kind: ValueKind) -> String {
    let type_name = match kind {
        ValueKind::Float => "Numeric (float)",
        ValueKind::UInt64 => "Numeric (unsigned)",
        ValueKind::Str => "Character",
        ValueKind::Text => "Text",
        ValueKind::Log => "Log",
    };
    let msg =
        format!("Type of received value [{value:.6}] is not suitable for value type [{type_name}]");
    truncate_chars(&msg, ERROR_LEN).to_owned()
}
