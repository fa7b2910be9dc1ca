/// Handle to a string stored in a [`TextArena`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextRef {
    offset: u32,
    len: u32,
}

impl TextRef {
    /// String length in bytes, terminator excluded.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Arena bytes occupied, terminator included.
    pub fn footprint(&self) -> usize {
        self.len as usize + 1
    }

    pub fn offset(&self) -> usize {
        self.offset as usize
    }
}

/// Bump-allocated byte region holding NUL-terminated strings.
///
/// Strings are appended at `last`. Releasing a string only credits `free`;
/// the bytes are reclaimed when the owner walks its live handles through
/// [`TextArena::relocate`] after [`TextArena::begin_compaction`].
#[derive(Debug)]
pub struct TextArena {
    buf: Vec<u8>,
    last: usize,
    free: usize,
}

impl TextArena {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(u32::MAX as usize);
        Self {
            buf: vec![0; capacity],
            last: 0,
            free: capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes not held by live strings, including reclaimable holes.
    pub fn free(&self) -> usize {
        self.free
    }

    pub fn used(&self) -> usize {
        self.capacity() - self.free
    }

    /// Contiguous bytes available at the bump pointer.
    pub fn tail_free(&self) -> usize {
        self.capacity() - self.last
    }

    /// Whether `footprint` bytes fit at the bump pointer.
    pub fn fits(&self, footprint: usize) -> bool {
        footprint <= self.tail_free()
    }

    /// Bytes below the bump pointer that compaction would give back.
    pub fn reclaimable(&self) -> usize {
        self.free.saturating_sub(self.tail_free())
    }

    /// Whether compacting could recover a meaningful amount of space.
    pub fn compaction_worthwhile(&self) -> bool {
        self.reclaimable() > self.capacity() / 1024
    }

    /// Copies `s` plus a terminator to the bump pointer.
    ///
    /// The caller checks [`TextArena::fits`] first.
    pub fn store(&mut self, s: &str) -> TextRef {
        let bytes = s.as_bytes();
        let start = self.last;
        let end = start + bytes.len();
        self.buf[start..end].copy_from_slice(bytes);
        self.buf[end] = 0;
        self.last = end + 1;
        self.free -= bytes.len() + 1;

        TextRef {
            offset: start as u32,
            len: bytes.len() as u32,
        }
    }

    pub fn get(&self, r: TextRef) -> &str {
        let bytes = &self.buf[r.offset()..r.offset() + r.len()];
        std::str::from_utf8(bytes).unwrap_or_default()
    }

    /// Copies the string out and credits its bytes back to `free`.
    pub fn take(&mut self, r: TextRef) -> String {
        let s = self.get(r).to_owned();
        self.free += r.footprint();
        s
    }

    /// Rewinds the bump pointer ahead of a relocation pass.
    pub fn begin_compaction(&mut self) {
        self.last = 0;
    }

    /// Slides a live string down to the bump pointer. Handles must be
    /// visited in ascending offset order so moves never overwrite live data.
    pub fn relocate(&mut self, r: TextRef) -> TextRef {
        let dst = self.last;
        let src = r.offset();
        if src != dst {
            self.buf.copy_within(src..src + r.footprint(), dst);
        }
        self.last = dst + r.footprint();

        TextRef {
            offset: dst as u32,
            len: r.len,
        }
    }

    /// Drops every string. Used once no slot references the arena.
    pub fn reset(&mut self) {
        self.last = 0;
        self.free = self.capacity();
    }
}
