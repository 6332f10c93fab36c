//! 3D movement tracking.
//!
//! `MovementTracker` keeps one `ObjectTrack` per object id. Each track holds a bounded
//! position history (oldest evicted first) and `MovementMetrics` recomputed on every
//! update from the most recent `smoothing_window` positions.
//!
//! Positions come from an external detection collaborator in meters. The tracker does
//! not detect anything itself.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::Timestamp;

pub const DEFAULT_MAX_HISTORY: usize = 100;
pub const DEFAULT_SMOOTHING_WINDOW: usize = 5;
pub const DEFAULT_IDLE_THRESHOLD_M: f64 = 0.1;
pub const DEFAULT_IDLE_DURATION_SECS: f64 = 10.0;
pub const DEFAULT_TRACK_TIMEOUT_SECS: f64 = 60.0;
/// Tracks touched within this window count as active in `stats`.
pub const DEFAULT_ACTIVE_WINDOW_SECS: f64 = 5.0;

/// Below this displacement the direction vector is undefined.
const MIN_DIRECTION_DISPLACEMENT_M: f64 = 0.01;
/// EWMA smoothing factor for `avg_speed`.
const AVG_SPEED_ALPHA: f64 = 0.1;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub idle_threshold_m: f64,
    pub idle_duration_secs: f64,
    pub max_history: usize,
    pub smoothing_window: usize,
    pub track_timeout_secs: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            idle_threshold_m: DEFAULT_IDLE_THRESHOLD_M,
            idle_duration_secs: DEFAULT_IDLE_DURATION_SECS,
            max_history: DEFAULT_MAX_HISTORY,
            smoothing_window: DEFAULT_SMOOTHING_WINDOW,
            track_timeout_secs: DEFAULT_TRACK_TIMEOUT_SECS,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.idle_threshold_m.is_finite() && self.idle_threshold_m >= 0.0) {
            return Err(anyhow!("idle_threshold_m must be a finite value >= 0"));
        }
        if !(self.idle_duration_secs.is_finite() && self.idle_duration_secs >= 0.0) {
            return Err(anyhow!("idle_duration_secs must be a finite value >= 0"));
        }
        if self.smoothing_window < 2 {
            return Err(anyhow!("smoothing_window must be at least 2"));
        }
        if self.max_history < self.smoothing_window {
            return Err(anyhow!(
                "max_history ({}) must be >= smoothing_window ({})",
                self.max_history,
                self.smoothing_window
            ));
        }
        if !(self.track_timeout_secs.is_finite() && self.track_timeout_secs > 0.0) {
            return Err(anyhow!("track_timeout_secs must be greater than zero"));
        }
        Ok(())
    }
}

// -------------------- Positions --------------------

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub timestamp: Timestamp,
    pub confidence: f64,
}

impl Position3D {
    pub fn new(xyz: [f64; 3], timestamp: Timestamp, confidence: f64) -> Self {
        Self {
            x: xyz[0],
            y: xyz[1],
            z: xyz[2],
            timestamp,
            confidence,
        }
    }

    pub fn as_array(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    pub fn distance_to(&self, other: &Position3D) -> f64 {
        norm(sub(self.as_array(), other.as_array()))
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.x.is_finite() && self.y.is_finite() && self.z.is_finite()) {
            return Err(anyhow!(
                "position must have finite coordinates, got ({}, {}, {})",
                self.x,
                self.y,
                self.z
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(anyhow!(
                "position confidence must be within 0..=1, got {}",
                self.confidence
            ));
        }
        Ok(())
    }
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn norm(v: [f64; 3]) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

// -------------------- Metrics and Tracks --------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MovementMetrics {
    pub total_distance: f64,
    pub avg_speed: f64,
    pub max_speed: f64,
    pub current_speed: f64,
    /// Unit vector from the oldest to the newest position in the smoothing window.
    pub direction_vector: Option<[f64; 3]>,
    pub is_moving: bool,
    pub idle_duration_secs: f64,
    pub last_movement_time: Option<Timestamp>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObjectTrack {
    pub object_id: String,
    pub object_type: String,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    pub positions: VecDeque<Position3D>,
    pub metrics: MovementMetrics,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(skip)]
    speed_samples: u64,
}

impl ObjectTrack {
    fn new(object_id: &str, object_type: &str, first_seen: Timestamp, capacity: usize) -> Self {
        Self {
            object_id: object_id.to_string(),
            object_type: object_type.to_string(),
            first_seen,
            last_seen: first_seen,
            positions: VecDeque::with_capacity(capacity),
            metrics: MovementMetrics::default(),
            metadata: BTreeMap::new(),
            speed_samples: 0,
        }
    }

    pub fn latest_position(&self) -> Option<&Position3D> {
        self.positions.back()
    }
}

/// Result of one position update.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackUpdate {
    pub metrics: MovementMetrics,
    /// Distance from the previous position, `None` on first sight.
    pub step_distance: Option<f64>,
    pub is_new_track: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerStats {
    pub total_objects_tracked: u64,
    pub total_tracks: usize,
    pub active_objects: usize,
    pub total_distance_all_objects: f64,
    pub avg_speed_all_objects: f64,
}

struct TrackerState {
    tracks: HashMap<String, ObjectTrack>,
    total_objects_tracked: u64,
}

pub struct MovementTracker {
    cfg: TrackerConfig,
    state: Mutex<TrackerState>,
}

impl MovementTracker {
    pub fn new(cfg: TrackerConfig) -> Result<Self> {
        cfg.validate()?;
        log::info!(
            "movement tracker ready: idle_threshold={}m idle_duration={}s history={} window={}",
            cfg.idle_threshold_m,
            cfg.idle_duration_secs,
            cfg.max_history,
            cfg.smoothing_window
        );
        Ok(Self {
            cfg,
            state: Mutex::new(TrackerState {
                tracks: HashMap::new(),
                total_objects_tracked: 0,
            }),
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.cfg
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a new position for `object_id` and return the recomputed metrics.
    pub fn update(
        &self,
        object_id: &str,
        xyz: [f64; 3],
        timestamp: Timestamp,
        object_type: &str,
        confidence: f64,
    ) -> Result<MovementMetrics> {
        self.observe(object_id, xyz, timestamp, object_type, confidence)
            .map(|update| update.metrics)
    }

    /// Like `update`, also reporting the step distance and whether the track is new.
    pub fn observe(
        &self,
        object_id: &str,
        xyz: [f64; 3],
        timestamp: Timestamp,
        object_type: &str,
        confidence: f64,
    ) -> Result<TrackUpdate> {
        crate::validate_identifier("object_id", object_id)?;
        let position = Position3D::new(xyz, timestamp, confidence);
        position.validate()?;

        let mut state = self.lock();
        let is_new_track = !state.tracks.contains_key(object_id);
        if is_new_track {
            state.total_objects_tracked += 1;
            log::info!("new object track: {} ({})", object_id, object_type);
        }
        let track = state.tracks.entry(object_id.to_string()).or_insert_with(|| {
            ObjectTrack::new(object_id, object_type, timestamp, self.cfg.max_history)
        });

        let step_distance = track.latest_position().map(|prev| position.distance_to(prev));

        if track.positions.len() >= self.cfg.max_history {
            track.positions.pop_front();
        }
        track.positions.push_back(position);
        if timestamp > track.last_seen {
            track.last_seen = timestamp;
        }

        recompute_metrics(track, &self.cfg);

        log::debug!(
            "object {} at ({:.2}, {:.2}, {:.2}) speed={:.2}m/s moving={}",
            object_id,
            position.x,
            position.y,
            position.z,
            track.metrics.current_speed,
            track.metrics.is_moving
        );

        Ok(TrackUpdate {
            metrics: track.metrics.clone(),
            step_distance,
            is_new_track,
        })
    }

    /// Attach a metadata entry to an existing track. Returns `false` for unknown ids.
    pub fn annotate(&self, object_id: &str, key: &str, value: impl Into<serde_json::Value>) -> bool {
        match self.lock().tracks.get_mut(object_id) {
            Some(track) => {
                track.metadata.insert(key.to_string(), value.into());
                true
            }
            None => false,
        }
    }

    pub fn track(&self, object_id: &str) -> Option<ObjectTrack> {
        self.lock().tracks.get(object_id).cloned()
    }

    pub fn metrics(&self, object_id: &str) -> Option<MovementMetrics> {
        self.lock().tracks.get(object_id).map(|t| t.metrics.clone())
    }

    /// Cumulative path length over the last `seconds`, measured back from the track's
    /// most recent observation. `None` with fewer than two positions in the window.
    pub fn distance_in_window(&self, object_id: &str, seconds: f64) -> Option<f64> {
        let state = self.lock();
        let track = state.tracks.get(object_id)?;
        let cutoff = track.last_seen.add_millis(-((seconds * 1000.0).round() as i64));
        let in_window: Vec<&Position3D> = track
            .positions
            .iter()
            .filter(|p| p.timestamp >= cutoff)
            .collect();
        if in_window.len() < 2 {
            return None;
        }
        Some(in_window.windows(2).map(|w| w[1].distance_to(w[0])).sum())
    }

    pub fn current_speed(&self, object_id: &str) -> Option<f64> {
        self.lock()
            .tracks
            .get(object_id)
            .map(|t| t.metrics.current_speed)
    }

    pub fn direction(&self, object_id: &str) -> Option<[f64; 3]> {
        self.lock()
            .tracks
            .get(object_id)
            .and_then(|t| t.metrics.direction_vector)
    }

    /// `None` for unknown objects. Uses the configured idle duration when no threshold is given.
    pub fn is_idle(&self, object_id: &str, threshold_secs: Option<f64>) -> Option<bool> {
        let threshold = threshold_secs.unwrap_or(self.cfg.idle_duration_secs);
        self.lock()
            .tracks
            .get(object_id)
            .map(|t| !t.metrics.is_moving && t.metrics.idle_duration_secs >= threshold)
    }

    pub fn position_history(&self, object_id: &str, limit: Option<usize>) -> Option<Vec<Position3D>> {
        let state = self.lock();
        let track = state.tracks.get(object_id)?;
        let skip = limit
            .map(|limit| track.positions.len().saturating_sub(limit))
            .unwrap_or(0);
        Some(track.positions.iter().skip(skip).copied().collect())
    }

    pub fn active_tracks(&self, timeout_secs: f64) -> Vec<ObjectTrack> {
        self.active_tracks_at(Timestamp::now(), timeout_secs)
    }

    /// Tracks last seen strictly within `timeout_secs` of `now`.
    pub fn active_tracks_at(&self, now: Timestamp, timeout_secs: f64) -> Vec<ObjectTrack> {
        self.lock()
            .tracks
            .values()
            .filter(|t| now.seconds_since(t.last_seen) < timeout_secs)
            .cloned()
            .collect()
    }

    pub fn remove_track(&self, object_id: &str) -> bool {
        let removed = self.lock().tracks.remove(object_id).is_some();
        if removed {
            log::info!("track removed: {}", object_id);
        }
        removed
    }

    pub fn cleanup(&self, timeout_secs: f64) -> usize {
        self.cleanup_at(Timestamp::now(), timeout_secs)
    }

    pub fn cleanup_at(&self, now: Timestamp, timeout_secs: f64) -> usize {
        self.evict_stale_at(now, timeout_secs).len()
    }

    /// Remove tracks idle for longer than `timeout_secs` and return their ids.
    pub fn evict_stale_at(&self, now: Timestamp, timeout_secs: f64) -> Vec<String> {
        let mut state = self.lock();
        let stale: Vec<String> = state
            .tracks
            .values()
            .filter(|t| now.seconds_since(t.last_seen) > timeout_secs)
            .map(|t| t.object_id.clone())
            .collect();
        for object_id in &stale {
            state.tracks.remove(object_id);
        }
        if !stale.is_empty() {
            log::info!("cleaned up {} stale tracks", stale.len());
        }
        stale
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats_at(Timestamp::now())
    }

    pub fn stats_at(&self, now: Timestamp) -> TrackerStats {
        let state = self.lock();
        let total_tracks = state.tracks.len();
        let total_distance: f64 = state.tracks.values().map(|t| t.metrics.total_distance).sum();
        let avg_speed = if total_tracks > 0 {
            state.tracks.values().map(|t| t.metrics.avg_speed).sum::<f64>() / total_tracks as f64
        } else {
            0.0
        };
        let active_objects = state
            .tracks
            .values()
            .filter(|t| now.seconds_since(t.last_seen) < DEFAULT_ACTIVE_WINDOW_SECS)
            .count();
        TrackerStats {
            total_objects_tracked: state.total_objects_tracked,
            total_tracks,
            active_objects,
            total_distance_all_objects: total_distance,
            avg_speed_all_objects: avg_speed,
        }
    }
}

fn recompute_metrics(track: &mut ObjectTrack, cfg: &TrackerConfig) {
    let n = track.positions.len();
    if n < 2 {
        return;
    }
    let latest = track.positions[n - 1];
    let previous = track.positions[n - 2];
    let earliest = track.positions[n.saturating_sub(cfg.smoothing_window)];
    let metrics = &mut track.metrics;

    let step = latest.distance_to(&previous);
    metrics.total_distance += step;

    // Zero or negative elapsed time leaves speed untouched.
    let dt = latest.timestamp.seconds_since(previous.timestamp);
    if dt > 0.0 {
        let speed = step / dt;
        metrics.current_speed = speed;
        if speed > metrics.max_speed {
            metrics.max_speed = speed;
        }
        metrics.avg_speed = if track.speed_samples == 0 {
            speed
        } else {
            AVG_SPEED_ALPHA * speed + (1.0 - AVG_SPEED_ALPHA) * metrics.avg_speed
        };
        track.speed_samples += 1;
    }

    let displacement = sub(latest.as_array(), earliest.as_array());
    let magnitude = norm(displacement);
    metrics.direction_vector = if magnitude > MIN_DIRECTION_DISPLACEMENT_M {
        Some([
            displacement[0] / magnitude,
            displacement[1] / magnitude,
            displacement[2] / magnitude,
        ])
    } else {
        None
    };

    metrics.is_moving = magnitude > cfg.idle_threshold_m;
    if metrics.is_moving {
        metrics.last_movement_time = Some(latest.timestamp);
        metrics.idle_duration_secs = 0.0;
    } else {
        let since = metrics.last_movement_time.unwrap_or(track.first_seen);
        metrics.idle_duration_secs = latest.timestamp.seconds_since(since).max(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn tracker() -> MovementTracker {
        MovementTracker::new(TrackerConfig::default()).unwrap()
    }

    fn at(secs: f64) -> Timestamp {
        Timestamp::from_secs_f64(1_700_000_000.0 + secs)
    }

    #[test]
    fn first_sight_creates_track_with_zero_metrics() {
        let t = tracker();
        let update = t.observe("p1", [1.0, 2.0, 0.0], at(0.0), "person", 0.9).unwrap();
        assert!(update.is_new_track);
        assert_eq!(update.step_distance, None);
        assert_eq!(update.metrics, MovementMetrics::default());
        assert_eq!(t.stats_at(at(0.0)).total_objects_tracked, 1);
    }

    #[test]
    fn step_distances_accumulate() {
        let t = tracker();
        t.update("p1", [-1.0, 5.0, 0.0], at(0.0), "person", 1.0).unwrap();
        let second = t.observe("p1", [5.0, 5.0, 0.0], at(1.0), "person", 1.0).unwrap();
        assert_eq!(second.step_distance, Some(6.0));
        assert!((second.metrics.total_distance - 6.0).abs() < 1e-9);
        assert!((second.metrics.current_speed - 6.0).abs() < 1e-9);

        let third = t.observe("p1", [15.0, 5.0, 0.0], at(2.0), "person", 1.0).unwrap();
        assert_eq!(third.step_distance, Some(10.0));
        assert!((third.metrics.total_distance - 16.0).abs() < 1e-9);
        assert_eq!(third.metrics.max_speed, 10.0);
        // EWMA seeded with the first speed sample.
        assert!((third.metrics.avg_speed - (0.1 * 10.0 + 0.9 * 6.0)).abs() < 1e-9);
    }

    #[test]
    fn total_distance_never_decreases() {
        let t = tracker();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut last_total = 0.0;
        for i in 0..500 {
            let xyz = [
                rng.gen_range(-5.0..5.0),
                rng.gen_range(-5.0..5.0),
                rng.gen_range(0.0..3.0),
            ];
            // Occasional duplicate timestamps must not break monotonicity.
            let ts = at((i / 2) as f64 * 0.1);
            let metrics = t.update("walker", xyz, ts, "person", 1.0).unwrap();
            assert!(metrics.total_distance >= last_total);
            last_total = metrics.total_distance;
        }
        assert_eq!(t.track("walker").unwrap().positions.len(), DEFAULT_MAX_HISTORY);
    }

    #[test]
    fn zero_elapsed_time_keeps_previous_speed() {
        let t = tracker();
        t.update("p1", [0.0, 0.0, 0.0], at(0.0), "person", 1.0).unwrap();
        t.update("p1", [1.0, 0.0, 0.0], at(1.0), "person", 1.0).unwrap();
        let m = t.update("p1", [3.0, 0.0, 0.0], at(1.0), "person", 1.0).unwrap();
        assert_eq!(m.current_speed, 1.0);
        assert_eq!(m.total_distance, 3.0);
    }

    #[test]
    fn direction_cleared_below_one_centimeter() {
        let t = tracker();
        t.update("p1", [0.0, 0.0, 0.0], at(0.0), "person", 1.0).unwrap();
        let m = t.update("p1", [0.0, 2.0, 0.0], at(1.0), "person", 1.0).unwrap();
        assert_eq!(m.direction_vector, Some([0.0, 1.0, 0.0]));
        assert_eq!(t.direction("p1"), Some([0.0, 1.0, 0.0]));

        let t = tracker();
        t.update("p2", [0.0, 0.0, 0.0], at(0.0), "person", 1.0).unwrap();
        let m = t.update("p2", [0.005, 0.0, 0.0], at(1.0), "person", 1.0).unwrap();
        assert_eq!(m.direction_vector, None);
        assert!(!m.is_moving);
    }

    #[test]
    fn stationary_object_becomes_idle_then_resets_on_movement() {
        let t = tracker();
        for i in 0..=12 {
            t.update("p1", [1.0, 1.0, 0.0], at(i as f64), "person", 1.0).unwrap();
        }
        let m = t.metrics("p1").unwrap();
        assert!(!m.is_moving);
        assert!((m.idle_duration_secs - 12.0).abs() < 1e-9);
        assert_eq!(t.is_idle("p1", None), Some(true));
        assert_eq!(t.is_idle("p1", Some(20.0)), Some(false));

        let m = t.update("p1", [3.0, 1.0, 0.0], at(13.0), "person", 1.0).unwrap();
        assert!(m.is_moving);
        assert_eq!(m.idle_duration_secs, 0.0);
        assert_eq!(m.last_movement_time, Some(at(13.0)));
        assert_eq!(t.is_idle("unknown", None), None);
    }

    #[test]
    fn invalid_positions_are_rejected_without_mutation() {
        let t = tracker();
        assert!(t.update("p1", [f64::NAN, 0.0, 0.0], at(0.0), "person", 1.0).is_err());
        assert!(t.update("p1", [0.0, f64::INFINITY, 0.0], at(0.0), "person", 1.0).is_err());
        assert!(t.update("p1", [0.0, 0.0, 0.0], at(0.0), "person", 1.5).is_err());
        assert!(t.update("bad id", [0.0, 0.0, 0.0], at(0.0), "person", 1.0).is_err());
        assert!(t.track("p1").is_none());
        assert_eq!(t.stats_at(at(0.0)).total_objects_tracked, 0);
    }

    #[test]
    fn last_seen_is_monotonic() {
        let t = tracker();
        t.update("p1", [0.0, 0.0, 0.0], at(5.0), "person", 1.0).unwrap();
        t.update("p1", [1.0, 0.0, 0.0], at(3.0), "person", 1.0).unwrap();
        assert_eq!(t.track("p1").unwrap().last_seen, at(5.0));
    }

    #[test]
    fn extreme_timestamps_do_not_overflow() {
        let t = tracker();
        let min = Timestamp::from_millis(i64::MIN);
        let max = Timestamp::from_millis(i64::MAX);
        t.update("p1", [0.0, 0.0, 0.0], min, "person", 1.0).unwrap();
        let metrics = t.update("p1", [1.0, 0.0, 0.0], max, "person", 1.0).unwrap();
        assert!(metrics.current_speed.is_finite());
        assert_eq!(t.evict_stale_at(max, 60.0).len(), 0);
        assert_eq!(t.evict_stale_at(min, -1.0).len(), 0);
    }

    #[test]
    fn annotations_stay_on_the_track() {
        let t = tracker();
        assert!(!t.annotate("p1", "camera_id", "cam1"));
        t.update("p1", [0.0, 0.0, 0.0], at(0.0), "person", 1.0).unwrap();
        assert!(t.annotate("p1", "camera_id", "cam1"));
        t.update("p1", [1.0, 0.0, 0.0], at(1.0), "person", 1.0).unwrap();
        let track = t.track("p1").unwrap();
        assert_eq!(track.metadata.get("camera_id"), Some(&serde_json::json!("cam1")));
    }

    #[test]
    fn distance_in_window_uses_recent_positions() {
        let t = tracker();
        for (i, x) in [0.0, 1.0, 2.0, 4.0, 8.0].iter().enumerate() {
            t.update("p1", [*x, 0.0, 0.0], at(i as f64), "person", 1.0).unwrap();
        }
        assert_eq!(t.distance_in_window("p1", 1.0), Some(4.0));
        assert_eq!(t.distance_in_window("p1", 2.0), Some(6.0));
        assert_eq!(t.distance_in_window("p1", 0.5), None);
        assert_eq!(t.distance_in_window("nobody", 1.0), None);
        assert_eq!(t.position_history("p1", Some(2)).unwrap().len(), 2);
    }

    #[test]
    fn cleanup_and_active_use_last_seen() {
        let t = tracker();
        t.update("old", [0.0, 0.0, 0.0], at(0.0), "person", 1.0).unwrap();
        t.update("new", [0.0, 0.0, 0.0], at(100.0), "person", 1.0).unwrap();

        let active = t.active_tracks_at(at(102.0), 5.0);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].object_id, "new");

        assert_eq!(t.cleanup_at(at(102.0), 60.0), 1);
        assert!(t.track("old").is_none());
        assert!(t.remove_track("new"));
        assert!(!t.remove_track("new"));
        assert_eq!(t.stats_at(at(102.0)).total_tracks, 0);
    }
}
