//! Two-stream frame synchronization.
//!
//! `FrameSynchronizer` pairs a primary stream (e.g. a fixed camera) with a secondary
//! stream (e.g. a depth camera) by timestamp. Matching is greedy and real-time:
//! the oldest primary frame is matched against the closest secondary frame, and if
//! nothing falls inside the tolerance window the primary frame is dropped. The
//! synchronizer never waits for a better match.
//!
//! All buffer reads and writes for one instance happen under a single mutex.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::frame::{FrameBuffer, FrameRecord, DEFAULT_BUFFER_FRAMES};
use crate::Timestamp;

pub const DEFAULT_TOLERANCE_MS: u64 = 100;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    pub tolerance_ms: u64,
    pub max_buffer: usize,
    pub primary_source_id: String,
    pub secondary_source_id: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tolerance_ms: DEFAULT_TOLERANCE_MS,
            max_buffer: DEFAULT_BUFFER_FRAMES,
            primary_source_id: "primary".to_string(),
            secondary_source_id: "secondary".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tolerance_ms == 0 {
            return Err(anyhow!("sync tolerance_ms must be greater than zero"));
        }
        if self.max_buffer == 0 {
            return Err(anyhow!("sync max_buffer must be greater than zero"));
        }
        crate::validate_identifier("primary_source_id", &self.primary_source_id)?;
        crate::validate_identifier("secondary_source_id", &self.secondary_source_id)?;
        if self.primary_source_id == self.secondary_source_id {
            return Err(anyhow!("primary and secondary source ids must differ"));
        }
        Ok(())
    }
}

/// Coarse precision band relative to the configured tolerance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncQuality {
    Excellent,
    Good,
    Acceptable,
    Poor,
}

impl SyncQuality {
    /// excellent <= 25% of tolerance, good <= 50%, acceptable <= 75%, else poor.
    pub fn assess(time_diff_ms: f64, tolerance_ms: u64) -> Self {
        let tolerance = tolerance_ms as f64;
        if time_diff_ms <= tolerance * 0.25 {
            SyncQuality::Excellent
        } else if time_diff_ms <= tolerance * 0.5 {
            SyncQuality::Good
        } else if time_diff_ms <= tolerance * 0.75 {
            SyncQuality::Acceptable
        } else {
            SyncQuality::Poor
        }
    }
}

/// A matched primary/secondary frame pair. Built once per match, never mutated.
#[derive(Debug)]
pub struct SynchronizedPair {
    pub primary: FrameRecord,
    pub secondary: FrameRecord,
    /// Depth-like payload that arrived with the secondary frame.
    pub auxiliary: Option<Vec<u8>>,
    pub time_diff_ms: f64,
    pub quality: SyncQuality,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub primary_received: u64,
    pub secondary_received: u64,
    pub synchronized_pairs: u64,
    /// No-match drops plus overflow evictions.
    pub dropped_primary: u64,
    /// Overflow evictions.
    pub dropped_secondary: u64,
    pub avg_time_diff_ms: f64,
    pub max_time_diff_ms: f64,
    pub sync_rate: f64,
    pub drop_rate_primary: f64,
    pub drop_rate_secondary: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferStatus {
    pub primary_len: usize,
    pub secondary_len: usize,
    pub primary_utilization: f64,
    pub secondary_utilization: f64,
    /// Payload bytes held by each buffer, depth data included.
    pub primary_bytes: usize,
    pub secondary_bytes: usize,
}

#[derive(Debug)]
struct SecondaryEntry {
    frame: FrameRecord,
    depth: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct SyncCounters {
    primary_received: u64,
    secondary_received: u64,
    pairs: u64,
    dropped_primary: u64,
    dropped_secondary: u64,
    mean_time_diff_ms: f64,
    max_time_diff_ms: f64,
}

impl SyncCounters {
    fn record_pair(&mut self, time_diff_ms: f64) {
        self.pairs += 1;
        self.mean_time_diff_ms += (time_diff_ms - self.mean_time_diff_ms) / self.pairs as f64;
        if time_diff_ms > self.max_time_diff_ms {
            self.max_time_diff_ms = time_diff_ms;
        }
    }
}

struct SyncState {
    primary: FrameBuffer<FrameRecord>,
    secondary: FrameBuffer<SecondaryEntry>,
    counters: SyncCounters,
}

pub struct FrameSynchronizer {
    cfg: SyncConfig,
    state: Mutex<SyncState>,
}

impl FrameSynchronizer {
    pub fn new(cfg: SyncConfig) -> Result<Self> {
        cfg.validate()?;
        log::info!(
            "frame synchronizer ready: tolerance={}ms buffer={} sources={}/{}",
            cfg.tolerance_ms,
            cfg.max_buffer,
            cfg.primary_source_id,
            cfg.secondary_source_id
        );
        let state = SyncState {
            primary: FrameBuffer::new(cfg.max_buffer),
            secondary: FrameBuffer::new(cfg.max_buffer),
            counters: SyncCounters::default(),
        };
        Ok(Self {
            cfg,
            state: Mutex::new(state),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.cfg
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a primary frame. Returns its sequence number.
    pub fn add_primary(&self, payload: Vec<u8>, timestamp: Timestamp) -> u64 {
        self.add_primary_with_metadata(payload, timestamp, BTreeMap::new())
    }

    pub fn add_primary_with_metadata(
        &self,
        payload: Vec<u8>,
        timestamp: Timestamp,
        metadata: BTreeMap<String, String>,
    ) -> u64 {
        let mut state = self.lock();
        let seq = state.counters.primary_received;
        let frame = FrameRecord::new(payload, timestamp, &self.cfg.primary_source_id, seq)
            .with_metadata(metadata);
        state.counters.primary_received += 1;
        if let Some(evicted) = state.primary.push(frame) {
            state.counters.dropped_primary += 1;
            log::debug!(
                "primary buffer full, evicted frame #{} at {}",
                evicted.sequence_number,
                evicted.timestamp
            );
        }
        log::debug!(
            "primary frame #{} added at {} (buffer={})",
            seq,
            timestamp,
            state.primary.len()
        );
        seq
    }

    /// Queue a secondary frame with an optional depth payload. Returns its sequence number.
    pub fn add_secondary(&self, payload: Vec<u8>, depth: Option<Vec<u8>>, timestamp: Timestamp) -> u64 {
        self.add_secondary_with_metadata(payload, depth, timestamp, BTreeMap::new())
    }

    pub fn add_secondary_with_metadata(
        &self,
        payload: Vec<u8>,
        depth: Option<Vec<u8>>,
        timestamp: Timestamp,
        metadata: BTreeMap<String, String>,
    ) -> u64 {
        let mut state = self.lock();
        let seq = state.counters.secondary_received;
        let frame = FrameRecord::new(payload, timestamp, &self.cfg.secondary_source_id, seq)
            .with_metadata(metadata);
        state.counters.secondary_received += 1;
        if let Some(evicted) = state.secondary.push(SecondaryEntry { frame, depth }) {
            state.counters.dropped_secondary += 1;
            log::debug!(
                "secondary buffer full, evicted frame #{} at {}",
                evicted.frame.sequence_number,
                evicted.frame.timestamp
            );
        }
        log::debug!(
            "secondary frame #{} added at {} (buffer={})",
            seq,
            timestamp,
            state.secondary.len()
        );
        seq
    }

    /// Try to match the oldest primary frame.
    ///
    /// Returns `None` when either buffer is empty, or when no secondary frame is
    /// within tolerance. In the latter case the primary frame is dropped.
    pub fn try_get_pair(&self) -> Option<SynchronizedPair> {
        let mut state = self.lock();
        let primary_ts = state.primary.oldest()?.timestamp;
        if state.secondary.is_empty() {
            return None;
        }

        // First minimum wins on ties.
        let (index, diff_ms) = state
            .secondary
            .iter()
            .enumerate()
            .map(|(i, entry)| (i, entry.frame.timestamp.abs_diff_ms(primary_ts)))
            .min_by_key(|&(_, diff)| diff)?;

        if diff_ms > self.cfg.tolerance_ms {
            let dropped = state.primary.pop_oldest()?;
            state.counters.dropped_primary += 1;
            log::warn!(
                "no secondary match for primary frame #{} at {} (closest {}ms)",
                dropped.sequence_number,
                dropped.timestamp,
                diff_ms
            );
            return None;
        }

        let primary = state.primary.pop_oldest()?;
        let SecondaryEntry { frame: secondary, depth } = state.secondary.remove(index)?;

        let time_diff_ms = diff_ms as f64;
        let quality = SyncQuality::assess(time_diff_ms, self.cfg.tolerance_ms);
        state.counters.record_pair(time_diff_ms);

        log::debug!(
            "synchronized pair: primary #{} secondary #{} diff={:.2}ms quality={:?}",
            primary.sequence_number,
            secondary.sequence_number,
            time_diff_ms,
            quality
        );

        Some(SynchronizedPair {
            primary,
            secondary,
            auxiliary: depth,
            time_diff_ms,
            quality,
        })
    }

    /// Drain every pair that can be made right now.
    pub fn drain_pairs(&self) -> Vec<SynchronizedPair> {
        let mut pairs = Vec::new();
        loop {
            let before = self.buffer_status().primary_len;
            match self.try_get_pair() {
                Some(pair) => pairs.push(pair),
                None => {
                    // Stop when nothing was consumed (an empty buffer on either side).
                    if self.buffer_status().primary_len == before {
                        break;
                    }
                }
            }
        }
        pairs
    }

    pub fn buffer_status(&self) -> BufferStatus {
        let state = self.lock();
        BufferStatus {
            primary_len: state.primary.len(),
            secondary_len: state.secondary.len(),
            primary_utilization: state.primary.utilization(),
            secondary_utilization: state.secondary.utilization(),
            primary_bytes: state.primary.memory_bytes(FrameRecord::byte_len),
            secondary_bytes: state
                .secondary
                .memory_bytes(|e| e.frame.byte_len() + e.depth.as_ref().map_or(0, Vec::len)),
        }
    }

    pub fn stats(&self) -> SyncStats {
        let state = self.lock();
        let c = &state.counters;
        let total_received = c.primary_received + c.secondary_received;
        let sync_rate = if total_received > 0 {
            c.pairs as f64 / (total_received as f64 / 2.0)
        } else {
            0.0
        };
        let rate = |dropped: u64, received: u64| {
            if received > 0 {
                dropped as f64 / received as f64
            } else {
                0.0
            }
        };
        SyncStats {
            primary_received: c.primary_received,
            secondary_received: c.secondary_received,
            synchronized_pairs: c.pairs,
            dropped_primary: c.dropped_primary,
            dropped_secondary: c.dropped_secondary,
            avg_time_diff_ms: c.mean_time_diff_ms,
            max_time_diff_ms: c.max_time_diff_ms,
            sync_rate,
            drop_rate_primary: rate(c.dropped_primary, c.primary_received),
            drop_rate_secondary: rate(c.dropped_secondary, c.secondary_received),
        }
    }

    pub fn reset_statistics(&self) {
        self.lock().counters = SyncCounters::default();
        log::info!("frame synchronizer statistics reset");
    }

    pub fn clear_buffers(&self) {
        let mut state = self.lock();
        state.primary.clear();
        state.secondary.clear();
        log::info!("frame synchronizer buffers cleared");
    }
}
