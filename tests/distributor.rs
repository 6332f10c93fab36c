use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use event_fusion::{
    DistributorConfig, Event, EventDistributor, EventFilter, EventType, Timestamp,
};

fn event(event_type: EventType, ms: i64) -> Event {
    Event::new("cam1", event_type, 0.9, Timestamp::from_millis(ms))
}

fn wait_until<F: Fn() -> bool>(deadline: Duration, check: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}

#[test]
fn enqueueing_past_capacity_drops_exactly_the_overflow() {
    let distributor = EventDistributor::new(DistributorConfig::default()).unwrap();
    let mut accepted = 0;
    for i in 0..1001 {
        if distributor.enqueue(event(EventType::Idle, i)) {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1000);
    let stats = distributor.stats();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.enqueued, 1000);
}

#[test]
fn filtered_subscriber_receives_only_its_types_under_concurrency() {
    let distributor = Arc::new(
        EventDistributor::new(DistributorConfig {
            queue_capacity: 1000,
            subscriber_buffer: 1000,
        })
        .unwrap(),
    );
    let falls = distributor.subscribe(EventFilter::parse("fall").unwrap());
    let everything = distributor.subscribe(EventFilter::all());
    let handle = distributor.start().unwrap();

    let producers: Vec<_> = [EventType::ZoneEntry, EventType::SpeedAlert, EventType::Fall]
        .into_iter()
        .map(|event_type| {
            let distributor = distributor.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    assert!(distributor.enqueue(event(event_type, i)));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || everything.pending() == 150));
    handle.stop().unwrap();

    let received: Vec<Event> = falls
        .drain()
        .iter()
        .map(|m| serde_json::from_str(m).unwrap())
        .collect();
    assert_eq!(received.len(), 50);
    assert!(received.iter().all(|e| e.event_type == EventType::Fall));
}

#[test]
fn events_are_broadcast_in_enqueue_order() {
    let distributor = Arc::new(EventDistributor::new(DistributorConfig::default()).unwrap());
    let sub = distributor.subscribe(EventFilter::all());
    for ms in 0..20 {
        distributor.enqueue(event(EventType::DistanceChange, ms));
    }
    let handle = distributor.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || sub.pending() == 20));
    handle.stop().unwrap();

    let stamps: Vec<i64> = sub
        .drain()
        .iter()
        .map(|m| serde_json::from_str::<Event>(m).unwrap().timestamp.as_millis())
        .collect();
    assert_eq!(stamps, (0..20).collect::<Vec<_>>());
}

#[test]
fn stopped_dispatcher_leaves_queue_intact() {
    let distributor = Arc::new(EventDistributor::new(DistributorConfig::default()).unwrap());
    let handle = distributor.start().unwrap();
    assert!(handle.is_running());
    handle.stop().unwrap();

    let sub = distributor.subscribe(EventFilter::all());
    distributor.enqueue(event(EventType::Fall, 1));
    distributor.enqueue(event(EventType::Fall, 2));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(sub.pending(), 0);

    assert_eq!(distributor.dispatch_pending(), 2);
    assert_eq!(sub.pending(), 2);
}

#[test]
fn ping_is_answered_regardless_of_filter() {
    let distributor = EventDistributor::new(DistributorConfig::default()).unwrap();
    let sub = distributor.subscribe(EventFilter::parse("fall").unwrap());
    let pong: serde_json::Value =
        serde_json::from_str(&sub.handle_client_text("ping").unwrap()).unwrap();
    assert_eq!(pong["type"], "pong");
    assert!(pong["timestamp"].is_i64());
}
