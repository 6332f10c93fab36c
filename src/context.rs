//! `FusionContext`: one explicitly constructed owner for every subsystem.
//!
//! Build it once at startup from a `FusionConfig` and pass `&FusionContext` (or an
//! `Arc`) to whatever needs it. Data moves between subsystems by value only.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::config::FusionConfig;
use crate::detect::{DetectorStats, EventDetector, FallSignals};
use crate::distribute::{DispatchHandle, DistributorStats, EventDistributor};
use crate::storage::{EventStore, InMemoryEventStore};
use crate::sync::{FrameSynchronizer, SyncStats};
use crate::tracking::{MovementTracker, TrackerStats};
use crate::{Event, EventType, Timestamp};

/// One detection from the external detection collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub object_id: String,
    pub object_type: String,
    pub camera_id: String,
    /// Meters, camera-relative.
    pub position: [f64; 3],
    pub timestamp: Timestamp,
    pub confidence: f64,
    /// Point on the camera's zone plane when it differs from the ground projection.
    pub image_point: Option<[f64; 2]>,
}

impl Observation {
    pub fn new(
        object_id: &str,
        object_type: &str,
        camera_id: &str,
        position: [f64; 3],
        timestamp: Timestamp,
    ) -> Self {
        Self {
            object_id: object_id.to_string(),
            object_type: object_type.to_string(),
            camera_id: camera_id.to_string(),
            position,
            timestamp,
            confidence: 1.0,
            image_point: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_image_point(mut self, point: [f64; 2]) -> Self {
        self.image_point = Some(point);
        self
    }

    /// 2D point tested against zone polygons: the image point if given, else (x, y).
    pub fn plane_point(&self) -> [f64; 2] {
        self.image_point
            .unwrap_or([self.position[0], self.position[1]])
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FusionStats {
    pub sync: SyncStats,
    pub tracker: TrackerStats,
    pub detector: DetectorStats,
    pub distributor: DistributorStats,
    pub stored_events: usize,
}

pub struct FusionContext {
    cfg: FusionConfig,
    synchronizer: FrameSynchronizer,
    tracker: MovementTracker,
    detector: EventDetector,
    distributor: Arc<EventDistributor>,
    store: Mutex<Box<dyn EventStore + Send>>,
    dispatcher: Mutex<Option<DispatchHandle>>,
}

impl FusionContext {
    pub fn new(cfg: FusionConfig) -> Result<Self> {
        let store = InMemoryEventStore::new(cfg.retention_events)?;
        Self::with_store(cfg, Box::new(store))
    }

    pub fn with_store(cfg: FusionConfig, store: Box<dyn EventStore + Send>) -> Result<Self> {
        cfg.validate()?;
        let synchronizer = FrameSynchronizer::new(cfg.sync.clone())?;
        let tracker = MovementTracker::new(cfg.tracker.clone())?;
        let detector = EventDetector::new(cfg.rules.clone())?;
        for spec in &cfg.zones {
            detector.add_zone(spec.clone())?;
        }
        let distributor = Arc::new(EventDistributor::new(cfg.distributor.clone())?);
        log::info!("fusion context ready ({} zones)", cfg.zones.len());
        Ok(Self {
            cfg,
            synchronizer,
            tracker,
            detector,
            distributor,
            store: Mutex::new(store),
            dispatcher: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &FusionConfig {
        &self.cfg
    }

    pub fn synchronizer(&self) -> &FrameSynchronizer {
        &self.synchronizer
    }

    pub fn tracker(&self) -> &MovementTracker {
        &self.tracker
    }

    pub fn detector(&self) -> &EventDetector {
        &self.detector
    }

    pub fn distributor(&self) -> &Arc<EventDistributor> {
        &self.distributor
    }

    fn lock_store(&self) -> Result<MutexGuard<'_, Box<dyn EventStore + Send>>> {
        self.store.lock().map_err(|_| anyhow!("event store lock poisoned"))
    }

    // -------------------- Dispatcher Lifecycle --------------------

    pub fn start_dispatcher(&self) -> Result<()> {
        let mut slot = self
            .dispatcher
            .lock()
            .map_err(|_| anyhow!("dispatcher lock poisoned"))?;
        if slot.is_some() {
            return Err(anyhow!("event dispatcher already started"));
        }
        *slot = Some(self.distributor.start()?);
        Ok(())
    }

    /// Stop the dispatch thread after its in-flight broadcast. No-op when not running.
    pub fn stop_dispatcher(&self) -> Result<()> {
        let handle = self
            .dispatcher
            .lock()
            .map_err(|_| anyhow!("dispatcher lock poisoned"))?
            .take();
        match handle {
            Some(handle) => handle.stop(),
            None => Ok(()),
        }
    }

    // -------------------- Pipeline --------------------

    /// Feed one detection through tracker, detector, store and distributor.
    /// Returns the emitted events with their assigned ids.
    pub fn ingest(&self, obs: &Observation) -> Result<Vec<Event>> {
        crate::validate_identifier("camera_id", &obs.camera_id)?;
        if let Some([u, v]) = obs.image_point {
            if !(u.is_finite() && v.is_finite()) {
                return Err(anyhow!("image point must be finite, got ({}, {})", u, v));
            }
        }
        let update = self.tracker.observe(
            &obs.object_id,
            obs.position,
            obs.timestamp,
            &obs.object_type,
            obs.confidence,
        )?;
        self.tracker
            .annotate(&obs.object_id, "camera_id", obs.camera_id.as_str());

        let mut events = Vec::new();
        if update.is_new_track {
            let event = Event::new(&obs.camera_id, EventType::NewObject, obs.confidence, obs.timestamp)
                .with_object(&obs.object_id, &obs.object_type)
                .with_position(obs.position);
            self.detector.register_event(event.clone());
            events.push(event);
        }
        events.extend(
            self.detector
                .check_events(obs, &update.metrics, update.step_distance),
        );
        self.publish(events)
    }

    /// Run the fall heuristic for one object and publish the event if it fires.
    pub fn report_fall(&self, obs: &Observation, signals: &FallSignals) -> Result<Option<Event>> {
        crate::validate_identifier("camera_id", &obs.camera_id)?;
        crate::validate_identifier("object_id", &obs.object_id)?;
        let Some(event) = self.detector.detect_fall(obs, signals) else {
            return Ok(None);
        };
        self.detector.register_event(event.clone());
        Ok(self.publish(vec![event])?.pop())
    }

    fn publish(&self, events: Vec<Event>) -> Result<Vec<Event>> {
        if events.is_empty() {
            return Ok(events);
        }
        let mut store = self.lock_store()?;
        let mut published = Vec::with_capacity(events.len());
        for event in events {
            let event = match store.persist(&event) {
                Ok(event_id) => event.assigned(event_id),
                Err(e) => {
                    log::error!("failed to persist {} event: {:#}", event.event_type, e);
                    event
                }
            };
            self.distributor.enqueue(event.clone());
            published.push(event);
        }
        Ok(published)
    }

    /// Persisted events, newest last.
    pub fn stored_events(&self, limit: usize, event_type: Option<EventType>) -> Result<Vec<Event>> {
        self.lock_store()?.read_recent(limit, event_type)
    }

    pub fn sweep_stale_tracks(&self) -> usize {
        self.sweep_stale_tracks_at(Timestamp::now())
    }

    /// Evict tracks past the configured timeout and forget their zone state.
    pub fn sweep_stale_tracks_at(&self, now: Timestamp) -> usize {
        let evicted = self
            .tracker
            .evict_stale_at(now, self.cfg.tracker.track_timeout_secs);
        for object_id in &evicted {
            self.detector.forget_object(object_id);
        }
        evicted.len()
    }

    pub fn stats(&self) -> FusionStats {
        let stored_events = match self.store.lock() {
            Ok(store) => store.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        };
        FusionStats {
            sync: self.synchronizer.stats(),
            tracker: self.tracker.stats(),
            detector: self.detector.stats(),
            distributor: self.distributor.stats(),
            stored_events,
        }
    }
}

impl Drop for FusionContext {
    fn drop(&mut self) {
        if let Err(e) = self.stop_dispatcher() {
            log::warn!("dispatcher shutdown failed: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribute::EventFilter;
    use crate::zone::ZoneSpec;

    fn context() -> FusionContext {
        let mut cfg = FusionConfig::default();
        cfg.zones.push(ZoneSpec::new(
            "dock",
            "cam1",
            vec![[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]],
        ));
        FusionContext::new(cfg).unwrap()
    }

    fn obs(x: f64, secs: i64) -> Observation {
        Observation::new("p1", "person", "cam1", [x, 5.0, 0.0], Timestamp::from_millis(secs * 1000))
    }

    #[test]
    fn first_sighting_emits_new_object_with_assigned_id() {
        let ctx = context();
        let events = ctx.ingest(&obs(-5.0, 0)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::NewObject);
        assert_eq!(events[0].event_id, Some(1));
        assert_eq!(ctx.stats().stored_events, 1);
        let track = ctx.tracker().track("p1").unwrap();
        assert_eq!(track.metadata.get("camera_id"), Some(&serde_json::json!("cam1")));
    }

    #[test]
    fn ingest_feeds_subscribers_through_the_queue() {
        let ctx = context();
        let sub = ctx.distributor().subscribe(EventFilter::only([EventType::ZoneEntry]));
        ctx.ingest(&obs(-1.0, 0)).unwrap();
        ctx.ingest(&obs(5.0, 1)).unwrap();
        assert!(ctx.distributor().dispatch_pending() >= 2);

        let delivered: Vec<Event> = sub
            .drain()
            .iter()
            .map(|m| serde_json::from_str(m).unwrap())
            .collect();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].zone_name.as_deref(), Some("dock"));
        assert!(delivered[0].event_id.is_some());
    }

    #[test]
    fn rejected_observation_changes_nothing() {
        let ctx = context();
        let bad = Observation::new("p1", "person", "cam 1", [0.0, 0.0, 0.0], Timestamp::from_millis(0));
        assert!(ctx.ingest(&bad).is_err());
        let nan = obs(f64::NAN, 0);
        assert!(ctx.ingest(&nan).is_err());
        assert!(ctx.tracker().track("p1").is_none());
        assert_eq!(ctx.stats().stored_events, 0);
    }

    #[test]
    fn fall_report_is_published() {
        let ctx = context();
        let signals = FallSignals {
            body_angle_deg: Some(15.0),
            depth_drop_m: Some(0.6),
        };
        let event = ctx.report_fall(&obs(2.0, 0), &signals).unwrap().unwrap();
        assert_eq!(event.confidence, 0.85);
        assert_eq!(ctx.stored_events(10, Some(EventType::Fall)).unwrap().len(), 1);
        assert!(ctx.report_fall(&obs(2.0, 1), &FallSignals::default()).unwrap().is_none());
    }

    #[test]
    fn sweep_forgets_zone_state_of_evicted_tracks() {
        let ctx = context();
        ctx.ingest(&obs(5.0, 0)).unwrap();
        assert!(ctx.detector().current_zone("p1").is_some());
        assert_eq!(ctx.sweep_stale_tracks_at(Timestamp::from_millis(120_000)), 1);
        assert!(ctx.detector().current_zone("p1").is_none());
        assert!(ctx.tracker().track("p1").is_none());
    }

    #[test]
    fn dispatcher_cannot_start_twice() {
        let ctx = context();
        ctx.start_dispatcher().unwrap();
        assert!(ctx.start_dispatcher().is_err());
        ctx.stop_dispatcher().unwrap();
        ctx.stop_dispatcher().unwrap();
    }
}
