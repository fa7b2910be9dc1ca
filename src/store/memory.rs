use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Result};
use parking_lot::Mutex;

use super::{HistoryRow, HistoryTable, ItemUpdate, Store, TrendQuery, TrendRow, TrendTable};

/// In-process [`Store`] used by the simulator and the test suite.
///
/// Writes apply immediately; transaction calls are only counted. Failures
/// can be injected for the next N write calls.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicU64,
    begins: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

#[derive(Debug, Default)]
struct Inner {
    history: HashMap<HistoryTable, Vec<HistoryRow>>,
    trends: HashMap<TrendTable, BTreeMap<(u64, i64), TrendRow>>,
    items: HashMap<u64, ItemUpdate>,
    max_ids: HashMap<String, u64>,
}

/// Transaction call counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxCounts {
    pub begins: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` write calls fail.
    pub fn fail_next_writes(&self, n: u64) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    fn check_write(&self, what: &str) -> Result<()> {
        let pending = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            bail!("injected failure writing {what}");
        }
        Ok(())
    }

    /// Seeds the id counter of `table`.
    pub fn set_max_id(&self, table: &str, id: u64) {
        self.inner.lock().max_ids.insert(table.to_string(), id);
    }

    pub fn history(&self, table: HistoryTable) -> Vec<HistoryRow> {
        self.inner
            .lock()
            .history
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }

    /// All trend rows of `table`, ordered by item then clock.
    pub fn trends(&self, table: TrendTable) -> Vec<TrendRow> {
        self.inner
            .lock()
            .trends
            .get(&table)
            .map(|rows| rows.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn trend(&self, table: TrendTable, item_id: u64, clock: i64) -> Option<TrendRow> {
        self.inner
            .lock()
            .trends
            .get(&table)
            .and_then(|rows| rows.get(&(item_id, clock)).copied())
    }

    /// Accumulated item column changes.
    pub fn item(&self, item_id: u64) -> Option<ItemUpdate> {
        self.inner.lock().items.get(&item_id).cloned()
    }

    pub fn tx_counts(&self) -> TxCounts {
        TxCounts {
            begins: self.begins.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }
}

impl Store for MemoryStore {
    fn begin(&self) -> Result<()> {
        self.begins.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn insert_history(&self, table: HistoryTable, rows: Vec<HistoryRow>) -> Result<()> {
        self.check_write(table.name())?;

        let mut inner = self.inner.lock();
        if let Some(max) = rows.iter().filter_map(|r| r.id).max() {
            let current = inner.max_ids.entry(table.name().to_string()).or_default();
            *current = (*current).max(max);
        }
        inner.history.entry(table).or_default().extend(rows);

        Ok(())
    }

    fn select_trends(&self, table: TrendTable, query: &TrendQuery<'_>) -> Result<Vec<TrendRow>> {
        let inner = self.inner.lock();
        let Some(rows) = inner.trends.get(&table) else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for &item_id in query.item_ids {
            out.extend(
                rows.range((item_id, i64::MIN)..=(item_id, i64::MAX))
                    .map(|(_, row)| *row)
                    .filter(|row| query.clock.matches(row.clock)),
            );
        }

        Ok(out)
    }

    fn insert_trends(&self, table: TrendTable, rows: Vec<TrendRow>) -> Result<()> {
        self.check_write(table.name())?;

        let mut inner = self.inner.lock();
        let target = inner.trends.entry(table).or_default();
        for row in &rows {
            if target.contains_key(&(row.item_id, row.clock)) {
                bail!(
                    "duplicate key in {}: itemid={} clock={}",
                    table.name(),
                    row.item_id,
                    row.clock
                );
            }
        }
        for row in rows {
            target.insert((row.item_id, row.clock), row);
        }

        Ok(())
    }

    fn update_trends(&self, table: TrendTable, rows: Vec<TrendRow>) -> Result<()> {
        self.check_write(table.name())?;

        let mut inner = self.inner.lock();
        let target = inner.trends.entry(table).or_default();
        for row in rows {
            if let Some(existing) = target.get_mut(&(row.item_id, row.clock)) {
                *existing = row;
            }
        }

        Ok(())
    }

    fn update_items(&self, updates: Vec<ItemUpdate>) -> Result<()> {
        self.check_write("items")?;

        let mut inner = self.inner.lock();
        for update in updates {
            let entry = inner
                .items
                .entry(update.item_id)
                .or_insert_with(|| ItemUpdate::new(update.item_id));
            if update.last_value.is_some() {
                entry.last_value = update.last_value;
            }
            if update.prev_value.is_some() {
                entry.prev_value = update.prev_value;
            }
            if update.last_ts.is_some() {
                entry.last_ts = update.last_ts;
            }
            if update.state.is_some() {
                entry.state = update.state;
            }
            if update.error.is_some() {
                entry.error = update.error;
            }
            if update.last_log_size.is_some() {
                entry.last_log_size = update.last_log_size;
            }
            if update.mtime.is_some() {
                entry.mtime = update.mtime;
            }
        }

        Ok(())
    }

    fn max_id(&self, table: &str) -> Result<u64> {
        Ok(self.inner.lock().max_ids.get(table).copied().unwrap_or(0))
    }
}
