use std::fmt;

use super::text::TextRef;

/// Maximum characters kept for a `Str` value.
pub const STR_VALUE_LEN: usize = 255;
/// Maximum characters kept for `Text` and `Log` values.
pub const TEXT_VALUE_LEN: usize = 65_535;
/// Maximum characters kept for a log source.
pub const LOG_SOURCE_LEN: usize = 64;
/// Maximum characters kept for an item error message.
pub const ERROR_LEN: usize = 128;

/// Value type of a monitored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Float,
    UInt64,
    Str,
    Text,
    Log,
}

impl ValueKind {
    /// Returns the label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::UInt64 => "uint",
            Self::Str => "str",
            Self::Text => "text",
            Self::Log => "log",
        }
    }

    /// Whether values of this kind feed hourly trends.
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Float | Self::UInt64)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collection state of an item at the time a value was produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ItemState {
    #[default]
    Active,
    NotSupported,
}

/// Wall-clock timestamp with nanosecond precision.
///
/// A negative `ns` means "not known"; the cache assigns a synthetic,
/// monotonically increasing value when the record is stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timespec {
    pub sec: i64,
    pub ns: i32,
}

impl Timespec {
    pub const fn new(sec: i64, ns: i32) -> Self {
        Self { sec, ns }
    }

    /// Timestamp with an unknown nanosecond part.
    pub const fn from_secs(sec: i64) -> Self {
        Self { sec, ns: -1 }
    }

    /// Seconds elapsed since `earlier`, as a float.
    pub fn seconds_since(&self, earlier: &Timespec) -> f64 {
        (self.sec - earlier.sec) as f64 + f64::from(self.ns - earlier.ns) / 1_000_000_000.0
    }
}

/// A history value owned outside the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryValue {
    Float(f64),
    UInt64(u64),
    Str(String),
    Text(String),
    Log(String),
}

impl HistoryValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Float(_) => ValueKind::Float,
            Self::UInt64(_) => ValueKind::UInt64,
            Self::Str(_) => ValueKind::Str,
            Self::Text(_) => ValueKind::Text,
            Self::Log(_) => ValueKind::Log,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UInt64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Str(s) | Self::Text(s) | Self::Log(s) => Some(s),
            _ => None,
        }
    }
}

/// Metadata carried by log values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogMeta {
    pub timestamp: i32,
    pub source: Option<String>,
    pub severity: i32,
    pub event_id: i32,
    pub last_log_size: u64,
    pub mtime: i32,
}

/// A value handed to the cache by a producer.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemValue {
    pub item_id: u64,
    pub ts: Timespec,
    pub payload: Payload,
}

/// Producer payload, one variant per ingest operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Float(f64),
    UInt64(u64),
    Str(String),
    Text(String),
    Log { value: String, meta: LogMeta },
    NotSupported(String),
}

impl Payload {
    /// Arena bytes needed to hold the payload's strings, terminators included.
    pub fn text_len(&self) -> usize {
        match self {
            Self::Float(_) | Self::UInt64(_) => 0,
            Self::Str(s) | Self::Text(s) | Self::NotSupported(s) => s.len() + 1,
            Self::Log { value, meta } => {
                value.len() + 1 + meta.source.as_ref().map_or(0, |s| s.len() + 1)
            }
        }
    }
}

/// A record drained from the ring buffer, owning all of its strings.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub item_id: u64,
    pub ts: Timespec,
    pub state: ItemState,
    /// Raw value as produced. `None` for values that arrived not supported.
    pub value: Option<HistoryValue>,
    /// Post-processed numeric value (multiplier, delta). Meaningless when `is_null`.
    pub derived: Option<HistoryValue>,
    pub error: Option<String>,
    pub is_null: bool,
    pub log: Option<LogMeta>,
    pub persist_history: bool,
    pub persist_trends: bool,
}

impl HistoryRecord {
    pub fn kind(&self) -> Option<ValueKind> {
        self.value.as_ref().map(HistoryValue::kind)
    }

    /// Value to persist: the derived value when one was computed, else the raw one.
    pub fn effective_value(&self) -> Option<&HistoryValue> {
        self.derived.as_ref().or(self.value.as_ref())
    }
}

/// Payload of a resident ring slot. Strings live in the text arena.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) enum SlotValue {
    #[default]
    Empty,
    Float(f64),
    UInt64(u64),
    Str(TextRef),
    Text(TextRef),
    Log(TextRef),
    Error(TextRef),
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct SlotLog {
    pub timestamp: i32,
    pub source: Option<TextRef>,
    pub severity: i32,
    pub event_id: i32,
    pub last_log_size: u64,
    pub mtime: i32,
}

/// One ring buffer slot. `item_id == 0` marks a gap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Slot {
    pub item_id: u64,
    pub ts: Timespec,
    /// Cached length of the run of same-item slots starting here. A lower
    /// bound, extended on demand.
    pub run: u32,
    pub value: SlotValue,
    pub log: Option<SlotLog>,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            item_id: 0,
            ts: Timespec::default(),
            run: 1,
            value: SlotValue::Empty,
            log: None,
        }
    }
}

impl Slot {
    pub fn is_gap(&self) -> bool {
        self.item_id == 0
    }

    /// Arena handles held by this slot, in allocation order.
    pub fn text_refs_mut(&mut self) -> impl Iterator<Item = &mut TextRef> {
        let value = match &mut self.value {
            SlotValue::Str(r) | SlotValue::Text(r) | SlotValue::Log(r) | SlotValue::Error(r) => {
                Some(r)
            }
            _ => None,
        };
        let source = self.log.as_mut().and_then(|l| l.source.as_mut());
        value.into_iter().chain(source)
    }
}

/// Truncates `s` to at most `max_chars` characters, on a char boundary.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
