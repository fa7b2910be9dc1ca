use anyhow::Result;
use parking_lot::Mutex;

use crate::cache::record::Timespec;

/// Recalculates triggers that depend on freshly synced items.
pub trait TriggerProcessor: Send + Sync {
    /// Called once per server round with the `(item_id, ts)` of every
    /// non-null record in the batch, in drain order.
    fn recalculate(&self, touched: &[(u64, Timespec)]) -> Result<()>;
}

/// Ignores trigger work.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTriggers;

impl TriggerProcessor for NoopTriggers {
    fn recalculate(&self, _touched: &[(u64, Timespec)]) -> Result<()> {
        Ok(())
    }
}

/// Keeps every call, for inspection.
#[derive(Debug, Default)]
pub struct RecordingTriggers {
    calls: Mutex<Vec<Vec<(u64, Timespec)>>>,
}

impl RecordingTriggers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Vec<(u64, Timespec)>> {
        self.calls.lock().clone()
    }
}

impl TriggerProcessor for RecordingTriggers {
    fn recalculate(&self, touched: &[(u64, Timespec)]) -> Result<()> {
        self.calls.lock().push(touched.to_vec());
        Ok(())
    }
}
