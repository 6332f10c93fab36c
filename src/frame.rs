//! Frame records and bounded buffering.
//!
//! - `FrameRecord`: One timestamped frame from a single source. Payload is opaque.
//! - `FrameBuffer`: Bounded FIFO ring. Evicts the oldest entry when full.
//!
//! `FrameRecord` is deliberately not `Clone`. A frame moves from its producer into a
//! buffer and from the buffer into at most one `SynchronizedPair`, so a frame can never
//! appear in two pairs.

use std::collections::{BTreeMap, VecDeque};

use crate::Timestamp;

/// Default per-source buffer capacity.
pub const DEFAULT_BUFFER_FRAMES: usize = 60;

// ----------------------------------------------------------------------------
// FrameRecord: one frame from one source
// ----------------------------------------------------------------------------

/// A single frame handed to the synchronizer by an acquisition collaborator.
#[derive(Debug)]
pub struct FrameRecord {
    /// Raw image bytes. The kernel never decodes them.
    pub payload: Vec<u8>,
    pub timestamp: Timestamp,
    pub source_id: String,
    /// Per-source sequence number, assigned from the source's received count.
    pub sequence_number: u64,
    pub metadata: BTreeMap<String, String>,
}

impl FrameRecord {
    pub fn new(payload: Vec<u8>, timestamp: Timestamp, source_id: &str, sequence_number: u64) -> Self {
        Self {
            payload,
            timestamp,
            source_id: source_id.to_string(),
            sequence_number,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub(crate) fn byte_len(&self) -> usize {
        self.payload.len()
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer: bounded ring buffer
// ----------------------------------------------------------------------------

/// Bounded FIFO ring buffer.
///
/// - Oldest entry at the front, newest at the back
/// - `push` evicts from the front when at capacity and reports the eviction
/// - Capacity is fixed at construction
#[derive(Debug)]
pub struct FrameBuffer<T> {
    buffer: VecDeque<T>,
    max_frames: usize,
}

impl<T> FrameBuffer<T> {
    pub fn new(max_frames: usize) -> Self {
        let max_frames = max_frames.max(1);
        Self {
            buffer: VecDeque::with_capacity(max_frames),
            max_frames,
        }
    }

    /// Push an entry. Returns the evicted entry if the buffer was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.buffer.len() >= self.max_frames {
            self.buffer.pop_front()
        } else {
            None
        };
        self.buffer.push_back(item);
        evicted
    }

    /// Oldest entry (non-consuming).
    pub fn oldest(&self) -> Option<&T> {
        self.buffer.front()
    }

    pub fn pop_oldest(&mut self) -> Option<T> {
        self.buffer.pop_front()
    }

    /// Remove the entry at `index` (0 = oldest).
    pub fn remove(&mut self, index: usize) -> Option<T> {
        self.buffer.remove(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.buffer.iter()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_frames
    }

    /// Fill ratio in `0.0..=1.0`.
    pub fn utilization(&self) -> f64 {
        self.buffer.len() as f64 / self.max_frames as f64
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl<T> FrameBuffer<T> {
    /// Memory usage estimate, summing `size_of` over every buffered entry.
    pub fn memory_bytes(&self, size_of: impl Fn(&T) -> usize) -> usize {
        self.buffer.iter().map(size_of).sum()
    }
}

impl<T> Default for FrameBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_FRAMES)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
