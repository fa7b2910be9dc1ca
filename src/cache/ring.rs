use super::inflight::InFlightItems;
use super::record::{HistoryRecord, HistoryValue, ItemState, LogMeta, Slot, SlotValue};
use super::text::TextArena;

/// Records taken by one [`HistoryRing::drain`] call.
#[derive(Debug, Default)]
pub struct Drained {
    pub records: Vec<HistoryRecord>,
    /// Oldest clock among values left behind because their item was in
    /// flight or queued behind its own run head.
    pub skipped_clock: Option<i64>,
}

/// Fixed-capacity circular buffer of history slots.
///
/// Live slots occupy logical positions `[0, count)` starting at physical
/// index `first`. Consuming a slot that is not at the head leaves a gap
/// (`item_id == 0`) that is reclaimed by head trimming or [`vacuum`].
///
/// [`vacuum`]: HistoryRing::vacuum
#[derive(Debug)]
pub struct HistoryRing {
    slots: Vec<Slot>,
    first: usize,
    count: usize,
    gap_count: usize,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![Slot::default(); capacity.max(1)],
            first: 0,
            count: 0,
            gap_count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Occupied slots, gaps included.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    pub fn gap_count(&self) -> usize {
        self.gap_count
    }

    /// Slots holding a value that has not been drained yet.
    pub fn live(&self) -> usize {
        self.count - self.gap_count
    }

    pub fn first(&self) -> usize {
        self.first
    }

    fn physical(&self, logical: usize) -> usize {
        (self.first + logical) % self.capacity()
    }

    /// Appends a slot at the tail. Returns false when the ring is full.
    pub(crate) fn push(&mut self, mut slot: Slot) -> bool {
        if self.is_full() {
            return false;
        }

        let idx = self.physical(self.count);
        slot.run = 1;
        self.slots[idx] = slot;
        self.count += 1;

        true
    }

    /// Squeezes gaps out of the ring by sliding live runs toward the tail.
    ///
    /// Does nothing while gaps make up at most 1% of the capacity. Returns
    /// the number of slots reclaimed.
    pub fn vacuum(&mut self) -> usize {
        let cap = self.capacity();
        if self.gap_count <= cap / 100 {
            return 0;
        }

        let mut f = (self.first + self.count) % cap;
        let mut n_gap = 0;
        let mut n_data = 0;

        for _ in 0..self.count {
            f = if f == 0 { cap - 1 } else { f - 1 };

            if self.slots[f].is_gap() {
                if n_data != 0 {
                    self.move_run(f + 1, n_data, n_gap);
                    n_data = 0;
                }
                n_gap += 1;
            } else if n_gap != 0 {
                n_data += 1;

                if f == 0 {
                    self.move_run(0, n_data, n_gap);
                    n_data = 0;
                }
            }
        }

        if n_data != 0 {
            self.move_run(f, n_data, n_gap);
        }

        self.first = (self.first + n_gap) % cap;
        self.count -= n_gap;
        self.gap_count -= n_gap;

        // Slots moved, so cached run lengths no longer describe their neighbours.
        for logical in 0..self.count {
            let idx = self.physical(logical);
            self.slots[idx].run = 1;
        }

        tracing::debug!(reclaimed = n_gap, live = self.count, "history ring vacuumed");

        n_gap
    }

    /// Moves `n_data` physically contiguous slots starting at `src` forward
    /// by `n_gap` positions, splitting the copy when the target wraps.
    fn move_run(&mut self, src: usize, n_data: usize, n_gap: usize) {
        let cap = self.capacity();
        let dst = src + n_gap;

        if dst >= cap {
            let dst = dst - cap;
            self.slots.copy_within(src..src + n_data, dst);
        } else if dst + n_data <= cap {
            self.slots.copy_within(src..src + n_data, dst);
        } else {
            let n_data2 = dst + n_data - cap;
            let n_data1 = n_data - n_data2;
            self.slots.copy_within(src + n_data1..src + n_data, 0);
            self.slots.copy_within(src..src + n_data1, dst);
        }
    }

    /// Relocates every live string to the bottom of the arena, in ring order.
    pub(crate) fn compact_text(&mut self, text: &mut TextArena) {
        text.begin_compaction();

        for logical in 0..self.count {
            let idx = self.physical(logical);
            let slot = &mut self.slots[idx];
            if slot.is_gap() {
                continue;
            }
            for r in slot.text_refs_mut() {
                *r = text.relocate(*r);
            }
        }

        tracing::debug!(free = text.free(), "history text compacted");
    }

    /// Returns the length of the run of same-item slots starting at
    /// physical `index`, looking at no more than `n` slots, and caches it.
    fn skip_run(&mut self, index: usize, n: usize) -> usize {
        let cap = self.capacity();
        let item_id = self.slots[index].item_id;
        let mut num = self.slots[index].run.max(1) as usize;

        while num < n {
            let f = (index + num) % cap;
            if self.slots[f].item_id != item_id {
                break;
            }
            num += self.slots[f].run.max(1) as usize;
        }

        let num = num.min(n);
        self.slots[index].run = num as u32;
        if num > 1 {
            self.slots[(index + 1) % cap].run = (num - 1) as u32;
        }

        num
    }

    /// Drains up to `max` records starting at the head.
    ///
    /// With `exclusive`, each item contributes at most one record per call
    /// and items found in `in_flight` are skipped a whole run at a time.
    /// Taken items are added to `in_flight`. Without it, records are taken
    /// in ring order regardless of item.
    pub fn drain(
        &mut self,
        text: &mut TextArena,
        in_flight: &mut InFlightItems,
        max: usize,
        exclusive: bool,
    ) -> Drained {
        let cap = self.capacity();
        let mut drained = Drained {
            records: Vec::with_capacity(max.min(self.live())),
            skipped_clock: None,
        };
        let mut iterations = 0usize;
        let mut n = self.count;
        let mut f = self.first;

        while n > 0 && drained.records.len() < max {
            let num = self.skip_run(f, n);

            if self.slots[f].is_gap() {
                if f == self.first {
                    self.first = (self.first + num) % cap;
                    self.count -= num;
                    self.gap_count -= num;
                }
                n -= num;
                f = (f + num) % cap;
                continue;
            }

            let step = if exclusive {
                // Give up once few of the examined slots turn into records,
                // which happens when a handful of items flood the ring.
                if max <= iterations && drained.records.len() * 10 < iterations {
                    break;
                }
                iterations += 1;

                let item_id = self.slots[f].item_id;
                if in_flight.contains(item_id) {
                    drained.skipped_clock.get_or_insert(self.slots[f].ts.sec);
                    n -= num;
                    f = (f + num) % cap;
                    continue;
                }
                if num > 1 {
                    drained
                        .skipped_clock
                        .get_or_insert(self.slots[(f + 1) % cap].ts.sec);
                }

                in_flight.insert(item_id);
                num
            } else {
                1
            };

            let record = self.take(f, text);
            drained.records.push(record);

            n -= step;
            f = (f + step) % cap;
        }

        self.trim_tail();

        if self.count == 0 {
            text.reset();
        }

        drained
    }

    /// Copies the slot at physical `idx` out and marks it consumed.
    fn take(&mut self, idx: usize, text: &mut TextArena) -> HistoryRecord {
        let slot = self.slots[idx];
        self.slots[idx] = Slot::default();

        if idx == self.first {
            self.first = (self.first + 1) % self.capacity();
            self.count -= 1;
        } else {
            self.gap_count += 1;
        }

        let (state, value, error) = match slot.value {
            SlotValue::Empty => (ItemState::Active, None, None),
            SlotValue::Float(v) => (ItemState::Active, Some(HistoryValue::Float(v)), None),
            SlotValue::UInt64(v) => (ItemState::Active, Some(HistoryValue::UInt64(v)), None),
            SlotValue::Str(r) => (ItemState::Active, Some(HistoryValue::Str(text.take(r))), None),
            SlotValue::Text(r) => (ItemState::Active, Some(HistoryValue::Text(text.take(r))), None),
            SlotValue::Log(r) => (ItemState::Active, Some(HistoryValue::Log(text.take(r))), None),
            SlotValue::Error(r) => (ItemState::NotSupported, None, Some(text.take(r))),
        };

        let log = slot.log.map(|l| LogMeta {
            timestamp: l.timestamp,
            source: l.source.map(|r| text.take(r)),
            severity: l.severity,
            event_id: l.event_id,
            last_log_size: l.last_log_size,
            mtime: l.mtime,
        });

        HistoryRecord {
            item_id: slot.item_id,
            ts: slot.ts,
            state,
            value,
            derived: None,
            error,
            is_null: state == ItemState::NotSupported,
            log,
            persist_history: false,
            persist_trends: false,
        }
    }

    fn trim_tail(&mut self) {
        while self.count > 0 {
            let idx = self.physical(self.count - 1);
            if !self.slots[idx].is_gap() {
                break;
            }
            self.count -= 1;
            self.gap_count -= 1;
        }
    }

    /// Clock of the newest queued value for `item_id`.
    pub fn last_clock(&self, item_id: u64) -> Option<i64> {
        (0..self.count)
            .rev()
            .map(|logical| &self.slots[self.physical(logical)])
            .find(|slot| slot.item_id == item_id)
            .map(|slot| slot.ts.sec)
    }
}
