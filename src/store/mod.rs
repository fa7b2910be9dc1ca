pub mod memory;

use anyhow::Result;

use crate::cache::record::{HistoryValue, ItemState, LogMeta, Timespec, ValueKind};

/// History tables a batch of rows can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistoryTable {
    Float,
    UInt,
    Str,
    Text,
    Log,
    /// Raw values collected by a proxy, all kinds in one table.
    Proxy,
}

impl HistoryTable {
    pub fn for_kind(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Float => Self::Float,
            ValueKind::UInt64 => Self::UInt,
            ValueKind::Str => Self::Str,
            ValueKind::Text => Self::Text,
            ValueKind::Log => Self::Log,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Float => "history",
            Self::UInt => "history_uint",
            Self::Str => "history_str",
            Self::Text => "history_text",
            Self::Log => "history_log",
            Self::Proxy => "proxy_history",
        }
    }

    /// Whether rows carry a generated id.
    pub fn has_id(self) -> bool {
        matches!(self, Self::Text | Self::Log | Self::Proxy)
    }
}

/// Trend tables, one per numeric kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrendTable {
    Float,
    UInt,
}

impl TrendTable {
    pub fn name(self) -> &'static str {
        match self {
            Self::Float => "trends",
            Self::UInt => "trends_uint",
        }
    }
}

/// One history row.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    pub id: Option<u64>,
    pub item_id: u64,
    pub clock: i64,
    pub ns: i32,
    pub value: Option<HistoryValue>,
    pub log: Option<LogMeta>,
    pub state: ItemState,
    pub error: Option<String>,
}

/// Aggregated values of a trend row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrendValues {
    Float { min: f64, avg: f64, max: f64 },
    UInt { min: u64, avg: u64, max: u64 },
}

impl TrendValues {
    pub fn table(&self) -> TrendTable {
        match self {
            Self::Float { .. } => TrendTable::Float,
            Self::UInt { .. } => TrendTable::UInt,
        }
    }
}

/// One persisted hourly trend, keyed by `(item_id, clock)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendRow {
    pub item_id: u64,
    pub clock: i64,
    pub count: u32,
    pub values: TrendValues,
}

/// Clock predicate of a trend lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMatch {
    AtLeast(i64),
    Exactly(i64),
}

impl ClockMatch {
    pub fn matches(self, clock: i64) -> bool {
        match self {
            Self::AtLeast(c) => clock >= c,
            Self::Exactly(c) => clock == c,
        }
    }
}

/// Selects trend rows of the listed items whose clock satisfies `clock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrendQuery<'a> {
    pub clock: ClockMatch,
    pub item_ids: &'a [u64],
}

/// Column changes for one item after a sync round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemUpdate {
    pub item_id: u64,
    pub last_value: Option<HistoryValue>,
    pub prev_value: Option<HistoryValue>,
    pub last_ts: Option<Timespec>,
    pub state: Option<ItemState>,
    pub error: Option<String>,
    pub last_log_size: Option<u64>,
    pub mtime: Option<i32>,
}

impl ItemUpdate {
    pub fn new(item_id: u64) -> Self {
        Self {
            item_id,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.last_value.is_none()
            && self.prev_value.is_none()
            && self.last_ts.is_none()
            && self.state.is_none()
            && self.error.is_none()
            && self.last_log_size.is_none()
            && self.mtime.is_none()
    }
}

/// Persistent storage reached by the sync workers.
///
/// Implementations own every query-language concern; the cache only hands
/// over structured batches. Calls may arrive from several sync threads.
pub trait Store: Send + Sync {
    fn begin(&self) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;

    fn insert_history(&self, table: HistoryTable, rows: Vec<HistoryRow>) -> Result<()>;

    fn select_trends(&self, table: TrendTable, query: &TrendQuery<'_>) -> Result<Vec<TrendRow>>;
    fn insert_trends(&self, table: TrendTable, rows: Vec<TrendRow>) -> Result<()>;
    /// Overwrites rows matched by `(item_id, clock)`.
    fn update_trends(&self, table: TrendTable, rows: Vec<TrendRow>) -> Result<()>;

    fn update_items(&self, updates: Vec<ItemUpdate>) -> Result<()>;

    /// Largest id currently used in `table`, or 0.
    fn max_id(&self, table: &str) -> Result<u64>;
}
