//! Event Fusion Kernel
//!
//! This crate fuses asynchronous multi-sensor observations into a stream of
//! semantic events and fans those events out to live subscribers.
//!
//! # Architecture
//!
//! The pipeline is four subsystems, leaves first:
//!
//! 1. **Frame Synchronizer** (`sync`): pairs two timestamped frame streams within a tolerance window.
//! 2. **Movement Tracker** (`tracking`): bounded 3D position history and movement metrics per object.
//! 3. **Zone/Event Detector** (`detect`, `zone`): per-object zone state machine plus threshold rules.
//! 4. **Event Distributor** (`distribute`): bounded event queue and filtered multi-subscriber fan-out.
//!
//! Every bounded buffer drops its oldest entry on overflow and counts the drop.
//! Producers never block on consumers.
//!
//! # Module Structure
//!
//! - `frame`: Frame records and the bounded ring buffer they queue in
//! - `config`: File + environment configuration
//! - `context`: `FusionContext`, the explicitly constructed owner of all subsystems
//! - `storage`: Persistence seam (`EventStore`)
//! - Core types: Timestamp, EventType, Event

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod context;
pub mod detect;
pub mod distribute;
pub mod frame;
pub mod storage;
pub mod sync;
pub mod tracking;
pub mod zone;

pub use context::{FusionContext, FusionStats, Observation};
pub use detect::{DetectorStats, EventDetector, EventHandler, FallSignals, RuleConfig};
pub use distribute::{
    DispatchHandle, DistributorConfig, DistributorStats, EventDistributor, EventFilter,
    Subscription, SubscriptionId,
};
pub use frame::{FrameBuffer, FrameRecord};
pub use storage::{EventStore, InMemoryEventStore};
pub use sync::{
    BufferStatus, FrameSynchronizer, SyncConfig, SyncQuality, SyncStats, SynchronizedPair,
};
pub use tracking::{
    MovementMetrics, MovementTracker, ObjectTrack, Position3D, TrackUpdate, TrackerConfig,
    TrackerStats,
};
pub use zone::{Zone, ZoneRules, ZoneSpec, ZoneType};

// -------------------- Timestamps --------------------

/// Wall-clock instant in whole milliseconds since the UNIX epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Timestamp(millis)
    }

    pub const fn from_millis(millis: i64) -> Self {
        Timestamp(millis)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Timestamp((secs * 1000.0).round() as i64)
    }

    pub const fn as_millis(self) -> i64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1000.0
    }

    pub fn add_millis(self, millis: i64) -> Self {
        Timestamp(self.0.saturating_add(millis))
    }

    /// Absolute distance between two instants in milliseconds.
    pub fn abs_diff_ms(self, other: Timestamp) -> u64 {
        self.0.abs_diff(other.0)
    }

    /// Signed seconds elapsed from `earlier` to `self`.
    pub fn seconds_since(self, earlier: Timestamp) -> f64 {
        self.0.saturating_sub(earlier.0) as f64 / 1000.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// -------------------- Event Types --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ZoneEntry,
    ZoneExit,
    Idle,
    DistanceChange,
    SpeedAlert,
    Fall,
    NewObject,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::ZoneEntry,
        EventType::ZoneExit,
        EventType::Idle,
        EventType::DistanceChange,
        EventType::SpeedAlert,
        EventType::Fall,
        EventType::NewObject,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::ZoneEntry => "zone_entry",
            EventType::ZoneExit => "zone_exit",
            EventType::Idle => "idle",
            EventType::DistanceChange => "distance_change",
            EventType::SpeedAlert => "speed_alert",
            EventType::Fall => "fall",
            EventType::NewObject => "new_object",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        EventType::ALL
            .iter()
            .copied()
            .find(|ty| ty.as_str() == wanted)
            .ok_or_else(|| anyhow!("unknown event type '{}'", wanted))
    }
}

// -------------------- Events --------------------

/// Semantic event emitted by the detector.
///
/// Events are immutable once built. `event_id` stays `None` until the
/// persistence collaborator assigns one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Option<u64>,
    pub timestamp: Timestamp,
    pub camera_id: String,
    pub event_type: EventType,
    pub confidence: f64,
    pub position_xyz: Option<[f64; 3]>,
    pub movement_distance: Option<f64>,
    pub movement_speed: Option<f64>,
    pub movement_direction: Option<[f64; 3]>,
    pub object_id: Option<String>,
    pub object_type: Option<String>,
    pub zone_id: Option<u32>,
    pub zone_name: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Event {
    pub fn new(
        camera_id: &str,
        event_type: EventType,
        confidence: f64,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            event_id: None,
            timestamp,
            camera_id: camera_id.to_string(),
            event_type,
            confidence,
            position_xyz: None,
            movement_distance: None,
            movement_speed: None,
            movement_direction: None,
            object_id: None,
            object_type: None,
            zone_id: None,
            zone_name: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_object(mut self, object_id: &str, object_type: &str) -> Self {
        self.object_id = Some(object_id.to_string());
        self.object_type = Some(object_type.to_string());
        self
    }

    pub fn with_position(mut self, position: [f64; 3]) -> Self {
        self.position_xyz = Some(position);
        self
    }

    pub fn with_zone(mut self, zone_id: u32, zone_name: Option<&str>) -> Self {
        self.zone_id = Some(zone_id);
        self.zone_name = zone_name.map(str::to_string);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Returns a copy carrying the id assigned by the persistence layer.
    pub fn assigned(mut self, event_id: u64) -> Self {
        self.event_id = Some(event_id);
        self
    }
}

// -------------------- Identifier Discipline --------------------

/// Camera and object identifiers are short opaque tokens.
///
/// Allowed: "cam1", "zed_2i", "person_17", "dock.north:3"
/// Disallowed: empty strings, whitespace, slashes.
pub fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    static IDENT_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = IDENT_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9_.:-]{1,128}$").expect("identifier pattern is valid")
    });
    if !re.is_match(value) {
        return Err(anyhow!(
            "invalid {} '{}': must match ^[A-Za-z0-9_.:-]{{1,128}}$",
            kind,
            value
        ));
    }
    Ok(())
}
