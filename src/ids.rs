use std::collections::HashMap;

use anyhow::{Context, Result};
use parking_lot::Mutex;

use crate::error::CacheError;
use crate::store::Store;

/// Maximum number of tables the id cache tracks.
pub const MAX_ID_TABLES: usize = 10;

/// Hands out ranges of row ids per table.
///
/// A table is seeded from the store's current maximum the first time it is
/// asked for, and served from memory afterwards.
#[derive(Debug, Default)]
pub struct IdCache {
    last: Mutex<HashMap<String, u64>>,
}

impl IdCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `n` consecutive ids for `table` and returns the first one.
    pub fn next_id(&self, store: &dyn Store, table: &str, n: u64) -> Result<u64> {
        let mut last = self.last.lock();

        if let Some(current) = last.get_mut(table) {
            let first = *current + 1;
            *current = reserve(table, *current, n)?;
            return Ok(first);
        }

        if last.len() >= MAX_ID_TABLES {
            return Err(CacheError::IdTablesExhausted {
                table: table.to_string(),
            }
            .into());
        }

        let max = store
            .max_id(table)
            .with_context(|| format!("failed to read max id of {table}"))?;
        last.insert(table.to_string(), reserve(table, max, n)?);

        Ok(max + 1)
    }

    pub fn tables(&self) -> usize {
        self.last.lock().len()
    }
}

fn reserve(table: &str, current: u64, n: u64) -> Result<u64> {
    current.checked_add(n).ok_or_else(|| {
        CacheError::IdOverflow {
            table: table.to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[test]
    fn test_seeds_from_store_then_counts_in_memory() {
        let store = MemoryStore::new();
        store.set_max_id("history_log", 100);
        let ids = IdCache::new();

        assert_eq!(ids.next_id(&store, "history_log", 5).expect("ids"), 101);
        store.set_max_id("history_log", 1_000);
        assert_eq!(ids.next_id(&store, "history_log", 1).expect("ids"), 106);
        assert_eq!(ids.next_id(&store, "history_text", 1).expect("ids"), 1);
    }

    #[test]
    fn test_table_limit() {
        let store = MemoryStore::new();
        let ids = IdCache::new();
        for i in 0..MAX_ID_TABLES {
            ids.next_id(&store, &format!("t{i}"), 1).expect("ids");
        }

        let err = ids.next_id(&store, "one_too_many", 1).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CacheError>(),
            Some(&CacheError::IdTablesExhausted {
                table: "one_too_many".into()
            })
        );
        assert_eq!(ids.tables(), MAX_ID_TABLES);
    }
}
