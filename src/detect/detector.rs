use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::context::Observation;
use crate::detect::handlers::{run_handlers, EventHandler, HandlerRegistry};
use crate::detect::rules::{self, FallSignals, RuleConfig, ZONE_EVENT_CONFIDENCE};
use crate::tracking::MovementMetrics;
use crate::zone::{Zone, ZoneSet, ZoneSpec};
use crate::{Event, EventType};

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DetectorStats {
    pub zones: usize,
    pub enabled_zones: usize,
    pub objects_in_zones: usize,
    pub events_registered: u64,
    pub handler_failures: u64,
    pub handlers: usize,
}

struct DetectorState {
    /// Objects currently inside a zone. Absence means no zone.
    object_zones: HashMap<String, u32>,
    recent: VecDeque<Event>,
    events_registered: u64,
    handler_failures: u64,
}

/// Per-object zone state machine plus threshold rules.
///
/// Zone definitions are copy-on-write: writers build a new `ZoneSet` and swap the
/// `Arc`, readers clone the `Arc` and evaluate without holding the lock.
pub struct EventDetector {
    rules: RuleConfig,
    zones: RwLock<Arc<ZoneSet>>,
    next_zone_id: AtomicU32,
    state: Mutex<DetectorState>,
    handlers: RwLock<HandlerRegistry>,
}

impl EventDetector {
    pub fn new(rules: RuleConfig) -> Result<Self> {
        rules.validate()?;
        log::info!(
            "event detector ready: idle={}s distance={}m speed={}m/s",
            rules.idle_duration_secs,
            rules.distance_alert_m,
            rules.speed_alert_mps
        );
        let capacity = rules.recent_events;
        Ok(Self {
            rules,
            zones: RwLock::new(Arc::new(ZoneSet::default())),
            next_zone_id: AtomicU32::new(1),
            state: Mutex::new(DetectorState {
                object_zones: HashMap::new(),
                recent: VecDeque::with_capacity(capacity),
                events_registered: 0,
                handler_failures: 0,
            }),
            handlers: RwLock::new(HandlerRegistry::default()),
        })
    }

    pub fn rules(&self) -> &RuleConfig {
        &self.rules
    }

    fn lock_state(&self) -> MutexGuard<'_, DetectorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self) -> Arc<ZoneSet> {
        match self.zones.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Apply `edit` to the current zone set and publish the result.
    fn swap_zones<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&ZoneSet) -> Result<ZoneSet>,
    {
        let mut guard = self.zones.write().map_err(|_| anyhow!("zone lock poisoned"))?;
        let next = edit(&guard)?;
        *guard = Arc::new(next);
        Ok(())
    }

    // -------------------- Zone Management --------------------

    pub fn add_zone(&self, spec: ZoneSpec) -> Result<u32> {
        spec.validate()?;
        let zone_id = self.next_zone_id.fetch_add(1, Ordering::SeqCst);
        let zone = Zone::from_spec(zone_id, spec)?;
        log::info!(
            "zone added: {} '{}' on {} ({} points, {})",
            zone_id,
            zone.name,
            zone.camera_id,
            zone.polygon.len(),
            zone.zone_type
        );
        self.swap_zones(|set| Ok(set.with_zone(zone)))?;
        Ok(zone_id)
    }

    /// Replace a zone's polygon, rules and metadata in one step.
    pub fn update_zone(&self, zone_id: u32, spec: ZoneSpec) -> Result<()> {
        let zone = Zone::from_spec(zone_id, spec)?;
        self.swap_zones(|set| {
            if set.get(zone_id).is_none() {
                return Err(anyhow!("unknown zone {}", zone_id));
            }
            Ok(set.with_zone(zone))
        })?;
        log::info!("zone updated: {}", zone_id);
        Ok(())
    }

    pub fn set_zone_enabled(&self, zone_id: u32, enabled: bool) -> Result<()> {
        self.swap_zones(|set| {
            let current = set
                .get(zone_id)
                .ok_or_else(|| anyhow!("unknown zone {}", zone_id))?;
            let mut zone = Zone::clone(current);
            zone.enabled = enabled;
            Ok(set.with_zone(zone))
        })?;
        log::info!("zone {} {}", zone_id, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn remove_zone(&self, zone_id: u32) -> Result<bool> {
        let mut removed = false;
        self.swap_zones(|set| {
            removed = set.get(zone_id).is_some();
            Ok(set.without_zone(zone_id))
        })?;
        if removed {
            log::info!("zone removed: {}", zone_id);
        }
        Ok(removed)
    }

    /// Enabled zones, optionally restricted to one camera, in matching order.
    pub fn list_zones(&self, camera_id: Option<&str>) -> Vec<Zone> {
        self.snapshot()
            .iter()
            .filter(|z| z.enabled)
            .filter(|z| camera_id.map_or(true, |cam| z.camera_id == cam))
            .map(|z| Zone::clone(z))
            .collect()
    }

    /// Any zone by id, disabled ones included.
    pub fn zone(&self, zone_id: u32) -> Option<Zone> {
        self.snapshot().get(zone_id).map(|z| Zone::clone(z))
    }

    // -------------------- Zone State Machine --------------------

    /// Run the zone state machine for one update.
    ///
    /// The object's new zone is stored even when the resulting event is suppressed by
    /// the zone's rules. A move from one zone straight into another yields only the entry.
    pub fn detect_zone_transition(
        &self,
        obs: &Observation,
        step_distance: Option<f64>,
    ) -> Option<Event> {
        let zones = self.snapshot();
        let [px, py] = obs.plane_point();
        let current = zones.containing(&obs.camera_id, px, py);
        let current_id = current.map(|z| z.zone_id);

        let previous_id = {
            let mut state = self.lock_state();
            let previous = state.object_zones.get(&obs.object_id).copied();
            if previous == current_id {
                return None;
            }
            match current_id {
                Some(id) => state.object_zones.insert(obs.object_id.clone(), id),
                None => state.object_zones.remove(&obs.object_id),
            };
            previous
        };

        let mut event = match (current, previous_id) {
            (Some(zone), _) => {
                log::info!("zone entry: {} -> {}", obs.object_id, zone.name);
                if !zone.rules.entry_alert {
                    return None;
                }
                zone_event(obs, EventType::ZoneEntry, zone.zone_id, Some(&**zone))
            }
            (None, Some(prev)) => {
                let zone = zones.get(prev);
                log::info!(
                    "zone exit: {} <- {}",
                    obs.object_id,
                    zone.map_or("<removed>", |z| z.name.as_str())
                );
                if zone.map_or(false, |z| !z.rules.exit_alert) {
                    return None;
                }
                zone_event(obs, EventType::ZoneExit, prev, zone.map(|z| &**z))
            }
            (None, None) => return None,
        };
        event.movement_distance = step_distance;
        Some(event)
    }

    /// Zone the object currently occupies, if any.
    pub fn current_zone(&self, object_id: &str) -> Option<u32> {
        self.lock_state().object_zones.get(object_id).copied()
    }

    /// Drop zone state for an object whose track was evicted.
    pub fn forget_object(&self, object_id: &str) -> bool {
        self.lock_state().object_zones.remove(object_id).is_some()
    }

    // -------------------- Rule Evaluation --------------------

    /// Zone state machine plus every threshold rule for one tracker update.
    ///
    /// Every emitted event is registered before it is returned.
    pub fn check_events(
        &self,
        obs: &Observation,
        metrics: &MovementMetrics,
        step_distance: Option<f64>,
    ) -> Vec<Event> {
        let mut events = Vec::new();
        if let Some(event) = self.detect_zone_transition(obs, step_distance) {
            events.push(event);
        }

        let zone = self
            .current_zone(&obs.object_id)
            .and_then(|id| self.snapshot().get(id).cloned());
        let idle_threshold = zone
            .as_ref()
            .and_then(|z| z.rules.idle_duration_secs)
            .unwrap_or(self.rules.idle_duration_secs);
        let speed_threshold = zone
            .as_ref()
            .and_then(|z| z.rules.speed_alert_mps)
            .unwrap_or(self.rules.speed_alert_mps);

        if let Some(event) = rules::idle(obs, metrics, idle_threshold) {
            events.push(event);
        }
        if let Some(distance) = step_distance {
            if let Some(event) = rules::distance_change(obs, distance, self.rules.distance_alert_m) {
                events.push(event);
            }
        }
        if let Some(event) = rules::speed_alert(
            obs,
            metrics.current_speed,
            metrics.direction_vector,
            speed_threshold,
        ) {
            events.push(event);
        }

        for event in &events {
            self.register_event(event.clone());
        }
        events
    }

    pub fn detect_fall(&self, obs: &Observation, signals: &FallSignals) -> Option<Event> {
        rules::fall(obs, signals, &self.rules)
    }

    // -------------------- Event Registration --------------------

    /// Record an event in the recent ring and run its handlers.
    pub fn register_event(&self, event: Event) {
        let handlers = match self.handlers.read() {
            Ok(guard) => guard.for_type(event.event_type),
            Err(poisoned) => poisoned.into_inner().for_type(event.event_type),
        };
        {
            let mut state = self.lock_state();
            if state.recent.len() >= self.rules.recent_events {
                state.recent.pop_front();
            }
            state.recent.push_back(event.clone());
            state.events_registered += 1;
        }

        let failures = run_handlers(&handlers, &event);
        if failures > 0 {
            self.lock_state().handler_failures += failures;
        }
    }

    pub fn add_event_handler<F>(&self, event_type: EventType, handler: F) -> Result<()>
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        let handler: Arc<EventHandler> = Arc::new(handler);
        self.handlers
            .write()
            .map_err(|_| anyhow!("handler lock poisoned"))?
            .register(event_type, handler);
        log::info!("event handler added for {}", event_type);
        Ok(())
    }

    /// Most recent events, oldest first. `limit` keeps only the newest `limit`.
    pub fn recent_events(&self, limit: Option<usize>) -> Vec<Event> {
        let state = self.lock_state();
        let skip = limit.map_or(0, |n| state.recent.len().saturating_sub(n));
        state.recent.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> DetectorStats {
        let zones = self.snapshot();
        let handlers = match self.handlers.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        };
        let state = self.lock_state();
        DetectorStats {
            zones: zones.iter().count(),
            enabled_zones: zones.iter().filter(|z| z.enabled).count(),
            objects_in_zones: state.object_zones.len(),
            events_registered: state.events_registered,
            handler_failures: state.handler_failures,
            handlers,
        }
    }
}

fn zone_event(obs: &Observation, event_type: EventType, zone_id: u32, zone: Option<&Zone>) -> Event {
    let event = Event::new(&obs.camera_id, event_type, ZONE_EVENT_CONFIDENCE, obs.timestamp)
        .with_object(&obs.object_id, &obs.object_type)
        .with_position(obs.position)
        .with_zone(zone_id, zone.map(|z| z.name.as_str()));
    match zone {
        Some(z) => event
            .with_metadata("zone_type", z.zone_type.as_str())
            .with_metadata("zone_priority", z.priority),
        None => event.with_metadata("zone_removed", true),
    }
}
