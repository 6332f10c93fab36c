//! Threshold rules.
//!
//! Each rule is a pure function of the current observation and movement figures. A rule
//! returns `Some(Event)` when it fires. Rules keep no state, so a condition that persists
//! fires again on every check.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::context::Observation;
use crate::tracking::MovementMetrics;
use crate::{Event, EventType};

pub const DEFAULT_IDLE_DURATION_SECS: f64 = 10.0;
pub const DEFAULT_DISTANCE_ALERT_M: f64 = 0.5;
pub const DEFAULT_SPEED_ALERT_MPS: f64 = 2.0;
pub const DEFAULT_FALL_BODY_ANGLE_DEG: f64 = 45.0;
pub const DEFAULT_FALL_DEPTH_DROP_M: f64 = 0.5;
pub const DEFAULT_RECENT_EVENTS: usize = 100;

pub const ZONE_EVENT_CONFIDENCE: f64 = 0.95;
pub const IDLE_CONFIDENCE: f64 = 0.9;
pub const DISTANCE_CONFIDENCE: f64 = 0.95;
pub const SPEED_CONFIDENCE: f64 = 0.9;
pub const FALL_ANGLE_CONFIDENCE: f64 = 0.85;
pub const FALL_DEPTH_CONFIDENCE: f64 = 0.8;

/// Typed rule thresholds shared by every zone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub idle_duration_secs: f64,
    pub distance_alert_m: f64,
    pub speed_alert_mps: f64,
    /// Body angle from horizontal below which a skeleton counts as fallen.
    pub fall_body_angle_deg: f64,
    pub fall_depth_drop_m: f64,
    pub recent_events: usize,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            idle_duration_secs: DEFAULT_IDLE_DURATION_SECS,
            distance_alert_m: DEFAULT_DISTANCE_ALERT_M,
            speed_alert_mps: DEFAULT_SPEED_ALERT_MPS,
            fall_body_angle_deg: DEFAULT_FALL_BODY_ANGLE_DEG,
            fall_depth_drop_m: DEFAULT_FALL_DEPTH_DROP_M,
            recent_events: DEFAULT_RECENT_EVENTS,
        }
    }
}

impl RuleConfig {
    pub fn validate(&self) -> Result<()> {
        let non_negative = [
            ("idle_duration_secs", self.idle_duration_secs),
            ("distance_alert_m", self.distance_alert_m),
            ("fall_depth_drop_m", self.fall_depth_drop_m),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(anyhow!("{} must be a finite value >= 0, got {}", name, value));
            }
        }
        if !(self.speed_alert_mps.is_finite() && self.speed_alert_mps > 0.0) {
            return Err(anyhow!(
                "speed_alert_mps must be greater than zero, got {}",
                self.speed_alert_mps
            ));
        }
        if !(self.fall_body_angle_deg > 0.0 && self.fall_body_angle_deg <= 90.0) {
            return Err(anyhow!(
                "fall_body_angle_deg must be within (0, 90], got {}",
                self.fall_body_angle_deg
            ));
        }
        if self.recent_events == 0 {
            return Err(anyhow!("recent_events must be greater than zero"));
        }
        Ok(())
    }
}

/// Signals from an external pose/depth collaborator used by the fall heuristic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FallSignals {
    pub body_angle_deg: Option<f64>,
    pub depth_drop_m: Option<f64>,
}

fn base_event(obs: &Observation, event_type: EventType, confidence: f64) -> Event {
    Event::new(&obs.camera_id, event_type, confidence, obs.timestamp)
        .with_object(&obs.object_id, &obs.object_type)
        .with_position(obs.position)
}

pub fn idle(obs: &Observation, metrics: &MovementMetrics, threshold_secs: f64) -> Option<Event> {
    if metrics.is_moving || metrics.idle_duration_secs < threshold_secs {
        return None;
    }
    log::info!(
        "idle detected: {} ({:.1}s)",
        obs.object_id,
        metrics.idle_duration_secs
    );
    Some(
        base_event(obs, EventType::Idle, IDLE_CONFIDENCE)
            .with_metadata("idle_duration_sec", metrics.idle_duration_secs)
            .with_metadata("threshold_sec", threshold_secs),
    )
}

pub fn distance_change(obs: &Observation, distance_m: f64, threshold_m: f64) -> Option<Event> {
    if distance_m < threshold_m {
        return None;
    }
    log::info!("distance change detected: {} ({:.2}m)", obs.object_id, distance_m);
    let mut event = base_event(obs, EventType::DistanceChange, DISTANCE_CONFIDENCE)
        .with_metadata("distance_m", distance_m)
        .with_metadata("threshold_m", threshold_m);
    event.movement_distance = Some(distance_m);
    Some(event)
}

pub fn speed_alert(
    obs: &Observation,
    speed_mps: f64,
    direction: Option<[f64; 3]>,
    threshold_mps: f64,
) -> Option<Event> {
    if speed_mps < threshold_mps {
        return None;
    }
    log::warn!(
        "speed alert: {} ({:.2}m/s, threshold {}m/s)",
        obs.object_id,
        speed_mps,
        threshold_mps
    );
    let mut event = base_event(obs, EventType::SpeedAlert, SPEED_CONFIDENCE)
        .with_metadata("speed_ms", speed_mps)
        .with_metadata("threshold_ms", threshold_mps);
    event.movement_speed = Some(speed_mps);
    event.movement_direction = direction;
    Some(event)
}

/// Fires when the body is near horizontal or the depth dropped suddenly.
/// Confidence is the larger of the two signals that fired.
pub fn fall(obs: &Observation, signals: &FallSignals, cfg: &RuleConfig) -> Option<Event> {
    let mut confidence: Option<f64> = None;
    if let Some(angle) = signals.body_angle_deg {
        if angle < cfg.fall_body_angle_deg {
            confidence = Some(FALL_ANGLE_CONFIDENCE);
        }
    }
    if let Some(drop) = signals.depth_drop_m {
        if drop > cfg.fall_depth_drop_m {
            confidence = Some(confidence.map_or(FALL_DEPTH_CONFIDENCE, |c| c.max(FALL_DEPTH_CONFIDENCE)));
        }
    }
    let confidence = confidence?;
    log::warn!("fall detected: {} (confidence {})", obs.object_id, confidence);

    let mut event = base_event(obs, EventType::Fall, confidence);
    if let Some(angle) = signals.body_angle_deg {
        event = event.with_metadata("body_angle_deg", angle);
    }
    if let Some(drop) = signals.depth_drop_m {
        event = event.with_metadata("depth_change", drop);
    }
    Some(event)
}
