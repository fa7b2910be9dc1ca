use super::record::{
    truncate_chars, ItemValue, LogMeta, Payload, Timespec, ERROR_LEN, LOG_SOURCE_LEN,
    STR_VALUE_LEN, TEXT_VALUE_LEN,
};
use super::Cache;
use crate::error::CacheError;

/// Values staged before they are flushed into the shared cache.
pub const LOCAL_VALUES_MAX: usize = 256;

pub(crate) fn str_payload(value: &str) -> Payload {
    Payload::Str(truncate_chars(value, STR_VALUE_LEN).to_owned())
}

pub(crate) fn text_payload(value: &str) -> Payload {
    Payload::Text(truncate_chars(value, TEXT_VALUE_LEN).to_owned())
}

pub(crate) fn log_payload(value: &str, mut meta: LogMeta) -> Payload {
    if let Some(source) = meta.source.as_mut() {
        let kept = truncate_chars(source, LOG_SOURCE_LEN).len();
        source.truncate(kept);
    }

    Payload::Log {
        value: truncate_chars(value, TEXT_VALUE_LEN).to_owned(),
        meta,
    }
}

pub(crate) fn notsupported_payload(error: &str) -> Payload {
    Payload::NotSupported(truncate_chars(error, ERROR_LEN).to_owned())
}

/// Producer-side staging buffer.
///
/// Values are truncated to their column limits as they are staged and
/// moved into the cache under a single lock acquisition once
/// [`LOCAL_VALUES_MAX`] are queued, or on [`flush`](Self::flush). Dropping
/// the buffer flushes what is left.
pub struct LocalValues<'a> {
    cache: &'a Cache,
    values: Vec<ItemValue>,
}

impl<'a> LocalValues<'a> {
    pub fn new(cache: &'a Cache) -> Self {
        Self {
            cache,
            values: Vec::with_capacity(LOCAL_VALUES_MAX),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn add_float(&mut self, item_id: u64, ts: Timespec, value: f64) -> Result<(), CacheError> {
        self.stage(item_id, ts, Payload::Float(value))
    }

    pub fn add_uint(&mut self, item_id: u64, ts: Timespec, value: u64) -> Result<(), CacheError> {
        self.stage(item_id, ts, Payload::UInt64(value))
    }

    pub fn add_str(&mut self, item_id: u64, ts: Timespec, value: &str) -> Result<(), CacheError> {
        self.stage(item_id, ts, str_payload(value))
    }

    pub fn add_text(&mut self, item_id: u64, ts: Timespec, value: &str) -> Result<(), CacheError> {
        self.stage(item_id, ts, text_payload(value))
    }

    pub fn add_log(
        &mut self,
        item_id: u64,
        ts: Timespec,
        value: &str,
        meta: LogMeta,
    ) -> Result<(), CacheError> {
        self.stage(item_id, ts, log_payload(value, meta))
    }

    pub fn add_notsupported(
        &mut self,
        item_id: u64,
        ts: Timespec,
        error: &str,
    ) -> Result<(), CacheError> {
        self.stage(item_id, ts, notsupported_payload(error))
    }

    fn stage(&mut self, item_id: u64, ts: Timespec, payload: Payload) -> Result<(), CacheError> {
        if self.values.len() >= LOCAL_VALUES_MAX {
            self.flush()?;
        }

        self.values.push(ItemValue {
            item_id,
            ts,
            payload,
        });

        Ok(())
    }

    /// Moves every staged value into the cache.
    pub fn flush(&mut self) -> Result<(), CacheError> {
        self.cache.add_values(&mut self.values)
    }
}

impl Drop for LocalValues<'_> {
    fn drop(&mut self) {
        if self.values.is_empty() {
            return;
        }
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "dropped staged history values");
        }
    }
}
