//! Per-lane relay buffer.
//!
//! A fixed-capacity byte buffer with a live range `[start..end)`. The
//! protocol layer consumes from the front with `peek`/`consume`; the relay
//! fills the back via `spare`/`commit` and drains the front via
//! `readable`/`advance`. When `start` crosses the middle the live range is
//! shifted back to offset 0 so fresh reads always have room.
//!
//! Invariant: `0 <= start <= end <= CAPACITY`.

pub(crate) const CAPACITY: usize = 2048;

pub(crate) struct LaneBuffer {
    data: Box<[u8; CAPACITY]>,
    start: usize,
    end: usize,
}

impl LaneBuffer {
    pub(crate) fn new() -> Self {
        Self {
            data: Box::new([0; CAPACITY]),
            start: 0,
            end: 0,
        }
    }

    /// Bytes waiting to be written to the opposite lane.
    pub(crate) fn readable(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub(crate) fn has_room(&self) -> bool {
        self.end < CAPACITY
    }

    /// Free space at the back, for the next socket read.
    pub(crate) fn spare(&mut self) -> &mut [u8] {
        &mut self.data[self.end..]
    }

    /// Commits `n` bytes just read into `spare()`.
    pub(crate) fn commit(&mut self, n: usize) {
        debug_assert!(self.end + n <= CAPACITY);
        self.end += n;
    }

    /// Returns the first `n` buffered bytes without consuming them, or
    /// `None` when fewer are available.
    pub(crate) fn peek(&self, n: usize) -> Option<&[u8]> {
        if self.start + n > self.end {
            return None;
        }
        Some(&self.data[self.start..self.start + n])
    }

    /// Consumes and returns the first `n` buffered bytes, or `None` when
    /// fewer are available.
    pub(crate) fn consume(&mut self, n: usize) -> Option<&[u8]> {
        if self.start + n > self.end {
            return None;
        }
        let at = self.start;
        self.start += n;
        Some(&self.data[at..at + n])
    }

    /// Reserves `n` bytes at the back for a queued reply.
    pub(crate) fn alloc(&mut self, n: usize) -> &mut [u8] {
        assert!(self.end + n <= CAPACITY, "reply does not fit in lane buffer");
        let at = self.end;
        self.end += n;
        &mut self.data[at..at + n]
    }

    /// Marks `n` front bytes as written out, compacting once `start`
    /// crosses the middle.
    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(self.start + n <= self.end);
        self.start += n;
        if self.start >= CAPACITY / 2 {
            self.data.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
    }
}
