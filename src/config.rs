use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;

use crate::detect::RuleConfig;
use crate::distribute::DistributorConfig;
use crate::storage::DEFAULT_RETENTION_EVENTS;
use crate::sync::SyncConfig;
use crate::tracking::TrackerConfig;
use crate::zone::ZoneSpec;

#[derive(Debug, Deserialize, Default)]
struct FusionConfigFile {
    sync: Option<SyncConfigFile>,
    tracking: Option<TrackingConfigFile>,
    rules: Option<RulesConfigFile>,
    distributor: Option<DistributorConfigFile>,
    storage: Option<StorageConfigFile>,
    zones: Option<Vec<ZoneSpec>>,
}

#[derive(Debug, Deserialize, Default)]
struct SyncConfigFile {
    tolerance_ms: Option<u64>,
    max_buffer: Option<usize>,
    primary_source_id: Option<String>,
    secondary_source_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackingConfigFile {
    idle_threshold_m: Option<f64>,
    idle_duration_secs: Option<f64>,
    max_history: Option<usize>,
    smoothing_window: Option<usize>,
    track_timeout_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct RulesConfigFile {
    distance_alert_m: Option<f64>,
    speed_alert_mps: Option<f64>,
    fall_body_angle_deg: Option<f64>,
    fall_depth_drop_m: Option<f64>,
    recent_events: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct DistributorConfigFile {
    queue_capacity: Option<usize>,
    subscriber_buffer: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    retention_events: Option<usize>,
}

/// Complete runtime configuration for a `FusionContext`.
#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub sync: SyncConfig,
    pub tracker: TrackerConfig,
    pub rules: RuleConfig,
    pub distributor: DistributorConfig,
    pub retention_events: usize,
    pub zones: Vec<ZoneSpec>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        let tracker = TrackerConfig::default();
        let rules = RuleConfig {
            idle_duration_secs: tracker.idle_duration_secs,
            ..RuleConfig::default()
        };
        Self {
            sync: SyncConfig::default(),
            tracker,
            rules,
            distributor: DistributorConfig::default(),
            retention_events: DEFAULT_RETENTION_EVENTS,
            zones: Vec::new(),
        }
    }
}

impl FusionConfig {
    /// File named by `FUSION_CONFIG` (if any), then defaults, then environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FUSION_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FusionConfigFile) -> Self {
        let defaults = Self::default();

        let sync_file = file.sync.unwrap_or_default();
        let sync = SyncConfig {
            tolerance_ms: sync_file.tolerance_ms.unwrap_or(defaults.sync.tolerance_ms),
            max_buffer: sync_file.max_buffer.unwrap_or(defaults.sync.max_buffer),
            primary_source_id: sync_file
                .primary_source_id
                .unwrap_or(defaults.sync.primary_source_id),
            secondary_source_id: sync_file
                .secondary_source_id
                .unwrap_or(defaults.sync.secondary_source_id),
        };

        let tracking = file.tracking.unwrap_or_default();
        let tracker = TrackerConfig {
            idle_threshold_m: tracking
                .idle_threshold_m
                .unwrap_or(defaults.tracker.idle_threshold_m),
            idle_duration_secs: tracking
                .idle_duration_secs
                .unwrap_or(defaults.tracker.idle_duration_secs),
            max_history: tracking.max_history.unwrap_or(defaults.tracker.max_history),
            smoothing_window: tracking
                .smoothing_window
                .unwrap_or(defaults.tracker.smoothing_window),
            track_timeout_secs: tracking
                .track_timeout_secs
                .unwrap_or(defaults.tracker.track_timeout_secs),
        };

        let rules_file = file.rules.unwrap_or_default();
        let rules = RuleConfig {
            idle_duration_secs: tracker.idle_duration_secs,
            distance_alert_m: rules_file
                .distance_alert_m
                .unwrap_or(defaults.rules.distance_alert_m),
            speed_alert_mps: rules_file
                .speed_alert_mps
                .unwrap_or(defaults.rules.speed_alert_mps),
            fall_body_angle_deg: rules_file
                .fall_body_angle_deg
                .unwrap_or(defaults.rules.fall_body_angle_deg),
            fall_depth_drop_m: rules_file
                .fall_depth_drop_m
                .unwrap_or(defaults.rules.fall_depth_drop_m),
            recent_events: rules_file
                .recent_events
                .unwrap_or(defaults.rules.recent_events),
        };

        let dist = file.distributor.unwrap_or_default();
        let distributor = DistributorConfig {
            queue_capacity: dist
                .queue_capacity
                .unwrap_or(defaults.distributor.queue_capacity),
            subscriber_buffer: dist
                .subscriber_buffer
                .unwrap_or(defaults.distributor.subscriber_buffer),
        };

        Self {
            sync,
            tracker,
            rules,
            distributor,
            retention_events: file
                .storage
                .and_then(|storage| storage.retention_events)
                .unwrap_or(defaults.retention_events),
            zones: file.zones.unwrap_or_default(),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(ms) = env_number::<u64>("FRAME_SYNC_TOLERANCE_MS")? {
            self.sync.tolerance_ms = ms;
        }
        if let Some(m) = env_number::<f64>("IDLE_THRESHOLD_M")? {
            self.tracker.idle_threshold_m = m;
        }
        if let Some(secs) = env_number::<f64>("IDLE_DURATION_SEC")? {
            self.tracker.idle_duration_secs = secs;
            self.rules.idle_duration_secs = secs;
        }
        if let Some(m) = env_number::<f64>("DISTANCE_ALERT_THRESHOLD_M")? {
            self.rules.distance_alert_m = m;
        }
        if let Some(mps) = env_number::<f64>("SPEED_ALERT_THRESHOLD_MS")? {
            self.rules.speed_alert_mps = mps;
        }
        if let Some(capacity) = env_number::<usize>("FUSION_EVENT_QUEUE_CAPACITY")? {
            self.distributor.queue_capacity = capacity;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.sync.validate()?;
        self.tracker.validate()?;
        self.rules.validate()?;
        self.distributor.validate()?;
        if self.retention_events == 0 {
            return Err(anyhow!("storage retention_events must be greater than zero"));
        }
        for zone in &self.zones {
            zone.validate()
                .map_err(|e| anyhow!("invalid zone '{}' in config: {}", zone.name, e))?;
        }
        Ok(())
    }
}

/// Parse an optional numeric environment variable. Blank counts as unset.
fn env_number<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a number, got '{}'", key, raw)),
        _ => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<FusionConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
