use std::sync::Arc;
use std::time::Duration;

use histcache::cache::record::{HistoryValue, ItemState, LogMeta, Timespec, ValueKind};
use histcache::cache::stats::Stat;
use histcache::cache::{CacheLimits, SyncMode};
use histcache::clock::ManualClock;
use histcache::config::{CacheConfig, Role};
use histcache::items::{ItemConfig, MemoryCatalog};
use histcache::lifecycle::CacheLifecycle;
use histcache::store::memory::MemoryStore;
use histcache::store::{HistoryTable, TrendRow, TrendTable, TrendValues};
use histcache::sync::Collaborators;
use histcache::triggers::RecordingTriggers;

struct Harness {
    store: Arc<MemoryStore>,
    catalog: Arc<MemoryCatalog>,
    triggers: Arc<RecordingTriggers>,
    clock: Arc<ManualClock>,
    lifecycle: CacheLifecycle,
}

fn cache_config() -> CacheConfig {
    CacheConfig {
        history_cache_size: CacheLimits::slot_size() * 64,
        text_cache_size: 4096,
        trend_cache_size: 4096,
        sync_batch_max: 16,
        syncer_frequency: Duration::from_secs(5),
        backoff: Duration::from_millis(10),
    }
}

fn harness_with_store(role: Role, store: Arc<MemoryStore>) -> Harness {
    let catalog = Arc::new(MemoryCatalog::new());
    let triggers = Arc::new(RecordingTriggers::new());
    let clock = Arc::new(ManualClock::new(0));

    let deps = Collaborators {
        store: store.clone(),
        catalog: catalog.clone(),
        triggers: triggers.clone(),
        clock: clock.clone(),
    };
    let lifecycle = CacheLifecycle::init(&cache_config(), role, deps).expect("init cache");

    Harness {
        store,
        catalog,
        triggers,
        clock,
        lifecycle,
    }
}

fn harness(role: Role) -> Harness {
    harness_with_store(role, Arc::new(MemoryStore::new()))
}

fn float_trend(row: &TrendRow) -> (u32, f64, f64, f64) {
    match row.values {
        TrendValues::Float { min, avg, max } => (row.count, min, avg, max),
        TrendValues::UInt { .. } => panic!("expected a float trend"),
    }
}

#[test]
fn full_drain_splits_trends_by_hour() {
    let h = harness(Role::Server);
    h.catalog.insert(42, ItemConfig::new(ValueKind::Float));
    let cache = h.lifecycle.cache();

    for (clock, value) in [(100, 1.0), (200, 3.0), (3700, 9.0)] {
        cache
            .add_history_float(42, Timespec::new(clock, 0), value)
            .expect("add");
    }

    let processed = h
        .lifecycle
        .coordinator()
        .sync(SyncMode::FullDrain)
        .expect("sync");
    assert_eq!(processed, 3);
    assert!(cache.is_empty());

    let rows = h.store.trends(TrendTable::Float);
    assert_eq!(rows.len(), 2);

    let first = h.store.trend(TrendTable::Float, 42, 0).expect("hour 0");
    assert_eq!(float_trend(&first), (2, 1.0, 2.0, 3.0));

    let second = h.store.trend(TrendTable::Float, 42, 3600).expect("hour 1");
    assert_eq!(float_trend(&second), (1, 9.0, 9.0, 9.0));

    assert_eq!(h.store.history(HistoryTable::Float).len(), 3);
}

#[test]
fn string_values_drain_in_arrival_order_and_leave_the_ring() {
    let h = harness(Role::Server);
    h.catalog.insert(7, ItemConfig::new(ValueKind::Str));
    let cache = h.lifecycle.cache();

    cache
        .add_history_str(7, Timespec::new(10, 0), "hello")
        .expect("add");
    cache
        .add_history_str(7, Timespec::new(11, 0), "world")
        .expect("add");
    assert_eq!(cache.last_clock(7), Some(11));

    let drained = cache.consume_batch(10, false);
    let values: Vec<_> = drained
        .records
        .iter()
        .filter_map(|r| r.value.as_ref().and_then(HistoryValue::as_text))
        .collect();
    assert_eq!(values, vec!["hello", "world"]);
    // last_clock only sees queued values; once drained, the newest clock
    // lives on in the item update (see item_last_clock_follows_newest_value).
    assert_eq!(cache.last_clock(7), None);
}

#[test]
fn item_last_clock_follows_newest_value() {
    let h = harness(Role::Server);
    h.catalog.insert(7, ItemConfig::new(ValueKind::Str));
    let cache = h.lifecycle.cache();

    cache
        .add_history_str(7, Timespec::new(10, 0), "hello")
        .expect("add");
    cache
        .add_history_str(7, Timespec::new(11, 0), "world")
        .expect("add");

    h.lifecycle
        .coordinator()
        .sync(SyncMode::FullDrain)
        .expect("sync");

    let item = h.store.item(7).expect("item updated");
    assert_eq!(item.last_ts.map(|ts| ts.sec), Some(11));
    assert_eq!(item.last_value, Some(HistoryValue::Str("world".into())));

    let rows = h.store.history(HistoryTable::Str);
    let clocks: Vec<i64> = rows.iter().map(|r| r.clock).collect();
    assert_eq!(clocks, vec![10, 11]);
}

#[test]
fn concurrent_writers_merge_into_one_trend_row() {
    let store = Arc::new(MemoryStore::new());
    let a = harness_with_store(Role::Server, Arc::clone(&store));
    let b = harness_with_store(Role::Server, Arc::clone(&store));
    let hour = 7200;

    for h in [&a, &b] {
        h.catalog.insert(5, ItemConfig::new(ValueKind::Float));
    }
    for (i, value) in [1.0, 2.0, 3.0, 4.0, 5.0].into_iter().enumerate() {
        a.lifecycle
            .cache()
            .add_history_float(5, Timespec::new(hour + i as i64, 0), value)
            .expect("add");
    }
    for (i, value) in [10.0, 20.0, 30.0].into_iter().enumerate() {
        b.lifecycle
            .cache()
            .add_history_float(5, Timespec::new(hour + 100 + i as i64, 0), value)
            .expect("add");
    }

    a.lifecycle
        .coordinator()
        .sync(SyncMode::FullDrain)
        .expect("first writer");
    let row = store.trend(TrendTable::Float, 5, hour).expect("first row");
    assert_eq!(row.count, 5);

    b.lifecycle
        .coordinator()
        .sync(SyncMode::FullDrain)
        .expect("second writer");

    assert_eq!(store.trends(TrendTable::Float).len(), 1);
    let row = store.trend(TrendTable::Float, 5, hour).expect("merged row");
    let (count, min, avg, max) = float_trend(&row);
    assert_eq!(count, 8);
    assert_eq!(min, 1.0);
    assert_eq!(max, 30.0);
    assert!((avg - 75.0 / 8.0).abs() < 1e-9);
}

#[test]
fn not_supported_value_stays_out_of_trends() {
    let h = harness(Role::Server);
    h.catalog.insert(9, ItemConfig::new(ValueKind::Float));
    let cache = h.lifecycle.cache();

    cache
        .add_history_notsupported(9, Timespec::new(50, 0), "timeout")
        .expect("add");

    h.lifecycle
        .coordinator()
        .sync(SyncMode::FullDrain)
        .expect("sync");

    let item = h.store.item(9).expect("item updated");
    assert_eq!(item.state, Some(ItemState::NotSupported));
    assert_eq!(item.error.as_deref(), Some("timeout"));

    assert!(h.store.history(HistoryTable::Float).is_empty());
    assert!(h.store.trends(TrendTable::Float).is_empty());
    assert!(cache.trends().lock().get(9).is_none());
    assert!(h.triggers.calls().is_empty());
    assert_eq!(cache.get_stats(Stat::NotSupportedCounter).as_u64(), Some(1));
}

#[test]
fn hour_is_flushed_before_next_hour_counts() {
    let h = harness(Role::Server);
    h.catalog.insert(1, ItemConfig::new(ValueKind::Float));
    let cache = h.lifecycle.cache();
    let coordinator = h.lifecycle.coordinator();

    for (clock, value) in [(3610, 2.0), (3620, 4.0), (7205, 100.0)] {
        cache
            .add_history_float(1, Timespec::new(clock, 0), value)
            .expect("add");
    }

    // One value per pass: the item leaves a single record per batch.
    assert_eq!(coordinator.sync(SyncMode::Incremental).expect("sync"), 1);
    assert_eq!(coordinator.sync(SyncMode::Incremental).expect("sync"), 1);
    assert!(h.store.trends(TrendTable::Float).is_empty());

    assert_eq!(coordinator.sync(SyncMode::Incremental).expect("sync"), 1);
    let rows = h.store.trends(TrendTable::Float);
    assert_eq!(rows.len(), 1);
    assert_eq!(float_trend(&rows[0]), (2, 2.0, 3.0, 4.0));
    assert_eq!(rows[0].clock, 3600);

    let open = cache.trends().lock();
    let live = open.get(1).expect("live aggregate");
    assert_eq!(live.hour, 7200);
    assert_eq!(live.count, 1);
}

#[test]
fn delayed_values_extend_incremental_pass() {
    let h = harness(Role::Server);
    h.catalog.insert(1, ItemConfig::new(ValueKind::Float));
    let cache = h.lifecycle.cache();

    for clock in [100, 101, 102] {
        cache
            .add_history_float(1, Timespec::new(clock, 0), 1.0)
            .expect("add");
    }

    // Everything queued is older than the delay bound.
    h.clock.set(1000);
    let processed = h
        .lifecycle
        .coordinator()
        .sync(SyncMode::Incremental)
        .expect("sync");
    assert_eq!(processed, 3);
    assert!(cache.is_empty());
}

#[test]
fn trend_rows_cover_every_hour_once() {
    let h = harness(Role::Server);
    h.catalog.insert(3, ItemConfig::new(ValueKind::Float));
    let cache = h.lifecycle.cache();

    let hours = 3;
    let per_hour = 4;
    for hour in 0..hours {
        for i in 0..per_hour {
            cache
                .add_history_float(3, Timespec::new(hour * 3600 + i * 60, 0), i as f64)
                .expect("add");
        }
    }

    h.lifecycle
        .coordinator()
        .sync(SyncMode::FullDrain)
        .expect("sync");

    let rows = h.store.trends(TrendTable::Float);
    let clocks: Vec<i64> = rows.iter().map(|r| r.clock).collect();
    assert_eq!(clocks, vec![0, 3600, 7200]);
    let total: u32 = rows.iter().map(|r| r.count).sum();
    assert_eq!(total, (hours * per_hour) as u32);
}

#[test]
fn uint_trends_use_wide_sums() {
    let h = harness(Role::Server);
    h.catalog.insert(4, ItemConfig::new(ValueKind::UInt64));
    let cache = h.lifecycle.cache();

    cache
        .add_history_uint(4, Timespec::new(10, 0), u64::MAX)
        .expect("add");
    cache
        .add_history_uint(4, Timespec::new(20, 0), u64::MAX - 2)
        .expect("add");

    h.lifecycle
        .coordinator()
        .sync(SyncMode::FullDrain)
        .expect("sync");

    let row = h.store.trend(TrendTable::UInt, 4, 0).expect("uint row");
    assert_eq!(row.count, 2);
    assert_eq!(
        row.values,
        TrendValues::UInt {
            min: u64::MAX - 2,
            avg: u64::MAX - 1,
            max: u64::MAX,
        }
    );
}

#[test]
fn triggers_see_non_null_values() {
    let h = harness(Role::Server);
    h.catalog.insert(1, ItemConfig::new(ValueKind::Float));
    h.catalog.insert(2, ItemConfig::new(ValueKind::Float));
    let cache = h.lifecycle.cache();

    cache
        .add_history_float(1, Timespec::new(10, 0), 1.0)
        .expect("add");
    cache
        .add_history_notsupported(2, Timespec::new(10, 0), "no data")
        .expect("add");
    // Unknown items are dropped by the merge.
    cache
        .add_history_float(3, Timespec::new(10, 0), 1.0)
        .expect("add");

    let processed = h
        .lifecycle
        .coordinator()
        .sync(SyncMode::Incremental)
        .expect("sync");
    assert_eq!(processed, 3);

    assert_eq!(
        h.triggers.calls(),
        vec![vec![(1, Timespec::new(10, 0))]]
    );
    let rows = h.store.history(HistoryTable::Float);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].item_id, 1);
}

#[test]
fn text_and_log_rows_get_generated_ids() {
    let h = harness(Role::Server);
    h.catalog.insert(1, ItemConfig::new(ValueKind::Text));
    h.catalog.insert(2, ItemConfig::new(ValueKind::Log));
    h.store.set_max_id("history_text", 41);
    let cache = h.lifecycle.cache();

    cache
        .add_history_text(1, Timespec::new(10, 0), "report")
        .expect("add");
    cache
        .add_history_log(
            2,
            Timespec::new(10, 0),
            "line",
            LogMeta {
                source: Some("app".into()),
                last_log_size: 512,
                mtime: 77,
                ..Default::default()
            },
        )
        .expect("add");

    h.lifecycle
        .coordinator()
        .sync(SyncMode::FullDrain)
        .expect("sync");

    let text = h.store.history(HistoryTable::Text);
    assert_eq!(text.len(), 1);
    assert_eq!(text[0].id, Some(42));

    let log = h.store.history(HistoryTable::Log);
    assert_eq!(log[0].id, Some(1));
    assert_eq!(
        log[0].log.as_ref().and_then(|l| l.source.as_deref()),
        Some("app")
    );

    let item = h.store.item(2).expect("log item updated");
    assert_eq!(item.last_log_size, Some(512));
    assert_eq!(item.mtime, Some(77));
}

#[test]
fn proxy_persists_raw_rows() {
    let h = harness(Role::Proxy);
    h.store.set_max_id("proxy_history", 100);
    let cache = h.lifecycle.cache();

    cache
        .add_history_float(1, Timespec::new(10, 0), 1.5)
        .expect("add");
    cache
        .add_history_notsupported(2, Timespec::new(11, 0), "timeout")
        .expect("add");
    cache
        .add_history_log(
            3,
            Timespec::new(12, 0),
            "line",
            LogMeta {
                last_log_size: 64,
                mtime: 5,
                ..Default::default()
            },
        )
        .expect("add");

    let processed = h
        .lifecycle
        .coordinator()
        .sync(SyncMode::FullDrain)
        .expect("sync");
    assert_eq!(processed, 3);

    let rows = h.store.history(HistoryTable::Proxy);
    let ids: Vec<_> = rows.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![Some(101), Some(102), Some(103)]);
    assert_eq!(rows[0].value, Some(HistoryValue::Float(1.5)));
    assert_eq!(rows[1].state, ItemState::NotSupported);
    assert_eq!(rows[1].error.as_deref(), Some("timeout"));

    assert_eq!(h.store.item(3).and_then(|u| u.last_log_size), Some(64));
    assert!(h.store.trends(TrendTable::Float).is_empty());
    assert!(h.triggers.calls().is_empty());
}

#[test]
fn failed_round_rolls_back_and_drops_records() {
    let h = harness(Role::Server);
    h.catalog.insert(1, ItemConfig::new(ValueKind::Float));
    let cache = h.lifecycle.cache();
    let coordinator = h.lifecycle.coordinator();

    cache
        .add_history_float(1, Timespec::new(10, 0), 1.0)
        .expect("add");
    h.store.fail_next_writes(1);

    let err = coordinator.sync(SyncMode::Incremental).unwrap_err();
    assert!(format!("{err:#}").contains("injected failure"));

    let tx = h.store.tx_counts();
    assert_eq!((tx.begins, tx.commits, tx.rollbacks), (1, 0, 1));
    assert!(cache.is_empty());
    assert_eq!(cache.in_flight(), 0);
    assert!(h.store.history(HistoryTable::Float).is_empty());

    cache
        .add_history_float(1, Timespec::new(20, 0), 2.0)
        .expect("add");
    assert_eq!(coordinator.sync(SyncMode::Incremental).expect("sync"), 1);
    assert_eq!(h.store.history(HistoryTable::Float).len(), 1);
}
