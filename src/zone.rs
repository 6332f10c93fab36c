//! Polygonal zones of interest.
//!
//! A `Zone` is a named polygon on one camera's 2D plane. Zones are built from a
//! `ZoneSpec` (the external zone-management input), validated once, and never mutated
//! in place afterwards. The detector swaps whole `ZoneSet`s when zones change.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub const MIN_POLYGON_POINTS: usize = 3;
pub const DEFAULT_ZONE_PRIORITY: u8 = 5;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneType {
    Restricted,
    #[default]
    Monitoring,
    Safe,
    Hazard,
}

impl ZoneType {
    pub fn as_str(self) -> &'static str {
        match self {
            ZoneType::Restricted => "restricted",
            ZoneType::Monitoring => "monitoring",
            ZoneType::Safe => "safe",
            ZoneType::Hazard => "hazard",
        }
    }
}

impl fmt::Display for ZoneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-zone behaviour.
///
/// Entry/exit switches only suppress the event. The object's zone state still changes.
/// Overrides apply while the object is inside the zone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneRules {
    pub entry_alert: bool,
    pub exit_alert: bool,
    pub idle_duration_secs: Option<f64>,
    pub speed_alert_mps: Option<f64>,
}

impl Default for ZoneRules {
    fn default() -> Self {
        Self {
            entry_alert: true,
            exit_alert: true,
            idle_duration_secs: None,
            speed_alert_mps: None,
        }
    }
}

impl ZoneRules {
    pub fn validate(&self) -> Result<()> {
        if let Some(secs) = self.idle_duration_secs {
            if !(secs.is_finite() && secs >= 0.0) {
                return Err(anyhow!("zone idle_duration_secs must be finite and >= 0"));
            }
        }
        if let Some(mps) = self.speed_alert_mps {
            if !(mps.is_finite() && mps > 0.0) {
                return Err(anyhow!("zone speed_alert_mps must be finite and > 0"));
            }
        }
        Ok(())
    }
}

fn default_priority() -> u8 {
    DEFAULT_ZONE_PRIORITY
}

fn default_enabled() -> bool {
    true
}

/// Zone definition as supplied by the zone-management collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZoneSpec {
    pub name: String,
    pub camera_id: String,
    pub polygon: Vec<[f64; 2]>,
    #[serde(default)]
    pub zone_type: ZoneType,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub rules: ZoneRules,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ZoneSpec {
    pub fn new(name: &str, camera_id: &str, polygon: Vec<[f64; 2]>) -> Self {
        Self {
            name: name.to_string(),
            camera_id: camera_id.to_string(),
            polygon,
            zone_type: ZoneType::default(),
            priority: DEFAULT_ZONE_PRIORITY,
            rules: ZoneRules::default(),
            enabled: true,
        }
    }

    pub fn with_type(mut self, zone_type: ZoneType) -> Self {
        self.zone_type = zone_type;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_rules(mut self, rules: ZoneRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("zone name must not be empty"));
        }
        crate::validate_identifier("camera_id", &self.camera_id)?;
        if self.polygon.len() < MIN_POLYGON_POINTS {
            return Err(anyhow!(
                "zone '{}' polygon needs at least {} points, got {}",
                self.name,
                MIN_POLYGON_POINTS,
                self.polygon.len()
            ));
        }
        if let Some(bad) = self
            .polygon
            .iter()
            .find(|p| !(p[0].is_finite() && p[1].is_finite()))
        {
            return Err(anyhow!(
                "zone '{}' has a non-finite vertex ({}, {})",
                self.name,
                bad[0],
                bad[1]
            ));
        }
        if !(1..=10).contains(&self.priority) {
            return Err(anyhow!(
                "zone '{}' priority must be within 1..=10, got {}",
                self.name,
                self.priority
            ));
        }
        self.rules.validate()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Zone {
    pub zone_id: u32,
    pub name: String,
    pub camera_id: String,
    pub polygon: Vec<[f64; 2]>,
    pub zone_type: ZoneType,
    pub priority: u8,
    pub rules: ZoneRules,
    pub enabled: bool,
}

impl Zone {
    pub fn from_spec(zone_id: u32, spec: ZoneSpec) -> Result<Self> {
        spec.validate()?;
        Ok(Self {
            zone_id,
            name: spec.name,
            camera_id: spec.camera_id,
            polygon: spec.polygon,
            zone_type: spec.zone_type,
            priority: spec.priority,
            rules: spec.rules,
            enabled: spec.enabled,
        })
    }

    /// Even-odd ray casting. Points exactly on an edge may fall either way.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let pts = &self.polygon;
        let mut inside = false;
        let mut j = pts.len() - 1;
        for i in 0..pts.len() {
            let (xi, yi) = (pts[i][0], pts[i][1]);
            let (xj, yj) = (pts[j][0], pts[j][1]);
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

// -------------------- Zone Sets --------------------

/// Immutable snapshot of every zone, ordered for matching.
///
/// Order: highest priority first, then lowest zone id. The first enabled zone on the
/// camera that contains the point wins.
#[derive(Clone, Debug, Default)]
pub(crate) struct ZoneSet {
    zones: Vec<Arc<Zone>>,
}

impl ZoneSet {
    fn sort(&mut self) {
        self.zones.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.zone_id.cmp(&b.zone_id))
        });
    }

    pub(crate) fn with_zone(&self, zone: Zone) -> ZoneSet {
        let mut next = ZoneSet {
            zones: self
                .zones
                .iter()
                .filter(|z| z.zone_id != zone.zone_id)
                .cloned()
                .collect(),
        };
        next.zones.push(Arc::new(zone));
        next.sort();
        next
    }

    pub(crate) fn without_zone(&self, zone_id: u32) -> ZoneSet {
        ZoneSet {
            zones: self
                .zones
                .iter()
                .filter(|z| z.zone_id != zone_id)
                .cloned()
                .collect(),
        }
    }

    pub(crate) fn get(&self, zone_id: u32) -> Option<&Arc<Zone>> {
        self.zones.iter().find(|z| z.zone_id == zone_id)
    }

    pub(crate) fn containing(&self, camera_id: &str, x: f64, y: f64) -> Option<&Arc<Zone>> {
        self.zones
            .iter()
            .filter(|z| z.enabled && z.camera_id == camera_id)
            .find(|z| z.contains(x, y))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<Zone>> + '_ {
        self.zones.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(name: &str, lo: f64, hi: f64) -> ZoneSpec {
        ZoneSpec::new(name, "cam1", vec![[lo, lo], [hi, lo], [hi, hi], [lo, hi]])
    }

    #[test]
    fn ray_casting_handles_concave_polygons() {
        // L-shape: the notch at (7, 7) is outside.
        let spec = ZoneSpec::new(
            "ell",
            "cam1",
            vec![[0.0, 0.0], [10.0, 0.0], [10.0, 5.0], [5.0, 5.0], [5.0, 10.0], [0.0, 10.0]],
        );
        let zone = Zone::from_spec(1, spec).unwrap();
        assert!(zone.contains(2.0, 2.0));
        assert!(zone.contains(8.0, 2.0));
        assert!(zone.contains(2.0, 8.0));
        assert!(!zone.contains(7.0, 7.0));
        assert!(!zone.contains(-1.0, 5.0));
    }

    #[test]
    fn malformed_specs_are_rejected() {
        let two_points = ZoneSpec::new("line", "cam1", vec![[0.0, 0.0], [1.0, 1.0]]);
        assert!(Zone::from_spec(1, two_points).is_err());

        let nan = ZoneSpec::new("nan", "cam1", vec![[0.0, 0.0], [f64::NAN, 1.0], [1.0, 0.0]]);
        assert!(Zone::from_spec(1, nan).is_err());

        assert!(Zone::from_spec(1, square("loud", 0.0, 1.0).with_priority(11)).is_err());
        assert!(Zone::from_spec(1, square("quiet", 0.0, 1.0).with_priority(0)).is_err());
        assert!(Zone::from_spec(1, ZoneSpec::new("cam", "bad cam", square("x", 0.0, 1.0).polygon)).is_err());

        let rules = ZoneRules {
            speed_alert_mps: Some(-1.0),
            ..ZoneRules::default()
        };
        assert!(Zone::from_spec(1, square("neg", 0.0, 1.0).with_rules(rules)).is_err());
    }

    #[test]
    fn overlap_resolves_by_priority_then_id() {
        let outer = Zone::from_spec(1, square("outer", 0.0, 10.0)).unwrap();
        let inner = Zone::from_spec(2, square("inner", 2.0, 4.0).with_priority(9)).unwrap();
        let twin = Zone::from_spec(3, square("twin", 2.0, 4.0).with_priority(9)).unwrap();

        let set = ZoneSet::default().with_zone(twin).with_zone(outer).with_zone(inner);
        assert_eq!(set.containing("cam1", 3.0, 3.0).unwrap().zone_id, 2);
        assert_eq!(set.containing("cam1", 8.0, 8.0).unwrap().zone_id, 1);
        assert!(set.containing("cam2", 3.0, 3.0).is_none());

        let set = set.without_zone(2);
        assert_eq!(set.containing("cam1", 3.0, 3.0).unwrap().zone_id, 3);
    }

    #[test]
    fn spec_deserializes_with_defaults() {
        let spec: ZoneSpec = serde_json::from_str(
            r#"{"name":"dock","camera_id":"cam1","polygon":[[0,0],[1,0],[1,1]],"zone_type":"hazard"}"#,
        )
        .unwrap();
        assert_eq!(spec.zone_type, ZoneType::Hazard);
        assert_eq!(spec.priority, DEFAULT_ZONE_PRIORITY);
        assert!(spec.enabled);
        assert!(spec.rules.entry_alert);
    }
}
