//! Reassembly buffer for announcements split across reads.
//!
//! Terminal output arrives in chunks of arbitrary size, so a sequence may
//! start in one read and finish several reads later. The buffer keeps a
//! bounded window of recent bytes and hands the whole window back for
//! re-parsing on every chunk. Bytes up to the end of a decoded sequence are
//! dropped once it has been consumed.

use crate::osc7::{DirectoryAnnouncement, Osc7Parser};

/// Default window size in bytes.
pub const DEFAULT_BUFFER_CAPACITY: usize = 2048;

/// Introducer of an OSC 7 sequence.
const OSC7_START: &[u8] = b"\x1b]7;";

/// Bounded accumulation window for OSC 7 parsing.
#[derive(Debug, Clone)]
pub struct Osc7Buffer {
    data: Vec<u8>,
    capacity: usize,
}

impl Osc7Buffer {
    /// Create a buffer with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    /// Create a buffer holding at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a chunk and return the accumulated window.
    ///
    /// On overflow the window restarts at the last sequence introducer when
    /// the rest of the window from there fits the capacity. Otherwise only
    /// the trailing half of the capacity is kept.
    pub fn add(&mut self, chunk: &[u8]) -> &[u8] {
        self.data.extend_from_slice(chunk);

        if self.data.len() > self.capacity {
            let start = match self.last_introducer() {
                Some(start) if self.data.len() - start <= self.capacity => start,
                _ => self.data.len() - self.capacity / 2,
            };
            self.data.drain(..start);
        }

        &self.data
    }

    fn last_introducer(&self) -> Option<usize> {
        self.data
            .windows(OSC7_START.len())
            .rposition(|window| window == OSC7_START)
    }

    /// Drop the first `consumed` bytes of the window.
    pub fn clear_processed(&mut self, consumed: usize) {
        let consumed = consumed.min(self.data.len());
        self.data.drain(..consumed);
    }

    /// Discard everything.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Number of buffered bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer holds no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Maximum number of buffered bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a chunk and decode the newest complete announcement.
    ///
    /// The window is trimmed past the consumed sequence whether or not it
    /// decoded successfully.
    pub fn feed(&mut self, parser: &Osc7Parser, chunk: &[u8]) -> Option<DirectoryAnnouncement> {
        let window = self.add(chunk);
        let found = parser.last_match(window)?;
        self.clear_processed(found.end);
        found.result.ok()
    }
}

impl Default for Osc7Buffer {
    fn default() -> Self {
        Self::new()
    }
}
