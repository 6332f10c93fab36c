use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use event_fusion::config::FusionConfig;
use event_fusion::{
    Event, EventFilter, EventType, FusionContext, Observation, SyncQuality, Timestamp, ZoneSpec,
};

fn context_with_zone_a() -> FusionContext {
    let mut cfg = FusionConfig::default();
    cfg.zones.push(ZoneSpec::new(
        "zoneA",
        "cam1",
        vec![[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]],
    ));
    FusionContext::new(cfg).expect("context")
}

fn p1_at(xyz: [f64; 3], secs: i64) -> Observation {
    Observation::new("p1", "person", "cam1", xyz, Timestamp::from_millis(1_000_000 + secs * 1000))
}

fn zone_events(events: &[Event]) -> Vec<&Event> {
    events
        .iter()
        .filter(|e| matches!(e.event_type, EventType::ZoneEntry | EventType::ZoneExit))
        .collect()
}

#[test]
fn object_crossing_zone_yields_entry_then_exit_with_step_distances() {
    let ctx = context_with_zone_a();

    let mut emitted = Vec::new();
    emitted.extend(ctx.ingest(&p1_at([-1.0, 5.0, 0.0], 0)).unwrap());
    emitted.extend(ctx.ingest(&p1_at([5.0, 5.0, 0.0], 1)).unwrap());
    emitted.extend(ctx.ingest(&p1_at([15.0, 5.0, 0.0], 2)).unwrap());

    let zone = zone_events(&emitted);
    assert_eq!(zone.len(), 2);

    assert_eq!(zone[0].event_type, EventType::ZoneEntry);
    assert_eq!(zone[0].object_id.as_deref(), Some("p1"));
    assert_eq!(zone[0].zone_name.as_deref(), Some("zoneA"));
    assert!((zone[0].movement_distance.unwrap() - 6.0).abs() < 1e-9);

    assert_eq!(zone[1].event_type, EventType::ZoneExit);
    assert_eq!(zone[1].zone_name.as_deref(), Some("zoneA"));
    assert!((zone[1].movement_distance.unwrap() - 10.0).abs() < 1e-9);

    assert!(zone[0].event_id.unwrap() < zone[1].event_id.unwrap());
}

#[test]
fn staying_inside_a_zone_emits_no_further_zone_events() {
    let ctx = context_with_zone_a();
    let mut emitted = Vec::new();
    for (i, x) in [-1.0, 2.0, 3.0, 4.0, 5.0].iter().enumerate() {
        emitted.extend(ctx.ingest(&p1_at([*x, 5.0, 0.0], i as i64)).unwrap());
    }
    let zone = zone_events(&emitted);
    assert_eq!(zone.len(), 1);
    assert_eq!(zone[0].event_type, EventType::ZoneEntry);
}

#[test]
fn stationary_object_goes_idle_and_resets_when_moving() {
    let ctx = context_with_zone_a();
    let mut idle_events = 0;
    for secs in 0..=12 {
        let events = ctx.ingest(&p1_at([20.0, 20.0, 0.0], secs)).unwrap();
        idle_events += events.iter().filter(|e| e.event_type == EventType::Idle).count();
    }
    // Idle from t=10 through t=12, one event per qualifying update.
    assert_eq!(idle_events, 3);

    let events = ctx.ingest(&p1_at([22.0, 20.0, 0.0], 13)).unwrap();
    assert!(events.iter().all(|e| e.event_type != EventType::Idle));
    let metrics = ctx.tracker().metrics("p1").unwrap();
    assert!(metrics.is_moving);
    assert_eq!(metrics.idle_duration_secs, 0.0);
}

#[test]
fn handlers_and_subscribers_both_see_pipeline_events() {
    let ctx = context_with_zone_a();
    let entries = Arc::new(AtomicUsize::new(0));
    let counter = entries.clone();
    ctx.detector()
        .add_event_handler(EventType::ZoneEntry, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    let exits = ctx
        .distributor()
        .subscribe(EventFilter::parse("zone_exit").unwrap());

    ctx.ingest(&p1_at([-1.0, 5.0, 0.0], 0)).unwrap();
    ctx.ingest(&p1_at([5.0, 5.0, 0.0], 1)).unwrap();
    ctx.ingest(&p1_at([15.0, 5.0, 0.0], 2)).unwrap();
    ctx.distributor().dispatch_pending();

    assert_eq!(entries.load(Ordering::SeqCst), 1);
    let delivered: Vec<Event> = exits
        .drain()
        .iter()
        .map(|m| serde_json::from_str(m).unwrap())
        .collect();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].event_type, EventType::ZoneExit);

    let stored = ctx.stored_events(100, None).unwrap();
    assert_eq!(stored.len(), ctx.detector().recent_events(None).len());
}

#[test]
fn synchronizer_pairs_frames_within_tolerance() {
    let ctx = context_with_zone_a();
    let sync = ctx.synchronizer();
    let t0 = Timestamp::from_millis(50_000);

    sync.add_primary(b"rgb0".to_vec(), t0);
    sync.add_secondary(b"depth0".to_vec(), Some(vec![1, 2, 3]), t0.add_millis(20));
    let pair = sync.try_get_pair().expect("pair within tolerance");
    assert_eq!(pair.time_diff_ms, 20.0);
    assert_eq!(pair.quality, SyncQuality::Excellent);
    assert_eq!(pair.auxiliary.as_deref(), Some(&[1u8, 2, 3][..]));

    sync.add_primary(b"rgb1".to_vec(), t0.add_millis(1_000));
    sync.add_secondary(b"depth1".to_vec(), None, t0.add_millis(1_500));
    assert!(sync.try_get_pair().is_none());
    let stats = sync.stats();
    assert_eq!(stats.synchronized_pairs, 1);
    assert_eq!(stats.dropped_primary, 1);
    assert_eq!(sync.buffer_status().secondary_len, 1);
}
