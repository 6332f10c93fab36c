use anyhow::{anyhow, Result};
use std::collections::VecDeque;

use crate::{Event, EventType};

pub const DEFAULT_RETENTION_EVENTS: usize = 10_000;

/// Persistence collaborator for emitted events.
///
/// The store owns event ids: `persist` assigns the next id and returns it. Ids are
/// never reused, even after retention drops old events.
pub trait EventStore {
    fn persist(&mut self, ev: &Event) -> Result<u64>;

    /// Newest events last. `event_type` narrows to one type.
    fn read_recent(&mut self, limit: usize, event_type: Option<EventType>) -> Result<Vec<Event>>;

    fn get(&mut self, event_id: u64) -> Result<Option<Event>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded in-memory store. The oldest events are discarded past `retention`.
pub struct InMemoryEventStore {
    events: VecDeque<Event>,
    retention: usize,
    next_id: u64,
}

impl InMemoryEventStore {
    pub fn new(retention: usize) -> Result<Self> {
        if retention == 0 {
            return Err(anyhow!("event retention must be greater than zero"));
        }
        Ok(Self {
            events: VecDeque::new(),
            retention,
            next_id: 1,
        })
    }
}

impl EventStore for InMemoryEventStore {
    fn persist(&mut self, ev: &Event) -> Result<u64> {
        if ev.event_id.is_some() {
            return Err(anyhow!("event already persisted as {:?}", ev.event_id));
        }
        let event_id = self.next_id;
        self.next_id += 1;
        if self.events.len() >= self.retention {
            self.events.pop_front();
        }
        self.events.push_back(ev.clone().assigned(event_id));
        Ok(event_id)
    }

    fn read_recent(&mut self, limit: usize, event_type: Option<EventType>) -> Result<Vec<Event>> {
        let mut out: Vec<Event> = self
            .events
            .iter()
            .rev()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .take(limit)
            .cloned()
            .collect();
        out.reverse();
        Ok(out)
    }

    fn get(&mut self, event_id: u64) -> Result<Option<Event>> {
        // Ids are assigned in insertion order, so the deque is sorted by id.
        let found = self
            .events
            .binary_search_by_key(&Some(event_id), |e| e.event_id)
            .ok()
            .and_then(|idx| self.events.get(idx).cloned());
        Ok(found)
    }

    fn len(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Timestamp;

    fn ev(event_type: EventType, ms: i64) -> Event {
        Event::new("cam1", event_type, 0.9, Timestamp::from_millis(ms))
    }

    #[test]
    fn ids_are_sequential_and_survive_retention() {
        let mut store = InMemoryEventStore::new(2).unwrap();
        assert_eq!(store.persist(&ev(EventType::Idle, 1)).unwrap(), 1);
        assert_eq!(store.persist(&ev(EventType::Fall, 2)).unwrap(), 2);
        assert_eq!(store.persist(&ev(EventType::Idle, 3)).unwrap(), 3);
        assert_eq!(store.len(), 2);
        assert!(store.get(1).unwrap().is_none());
        assert_eq!(store.get(3).unwrap().unwrap().timestamp, Timestamp::from_millis(3));
    }

    #[test]
    fn read_recent_filters_by_type() {
        let mut store = InMemoryEventStore::new(10).unwrap();
        for (i, ty) in [EventType::Idle, EventType::Fall, EventType::Idle, EventType::Idle]
            .into_iter()
            .enumerate()
        {
            store.persist(&ev(ty, i as i64)).unwrap();
        }
        let idle = store.read_recent(2, Some(EventType::Idle)).unwrap();
        assert_eq!(idle.len(), 2);
        assert_eq!(idle[0].event_id, Some(3));
        assert_eq!(idle[1].event_id, Some(4));
        assert_eq!(store.read_recent(10, None).unwrap().len(), 4);
    }

    #[test]
    fn rejects_already_assigned_events() {
        let mut store = InMemoryEventStore::new(10).unwrap();
        assert!(store.persist(&ev(EventType::Idle, 1).assigned(9)).is_err());
        assert!(store.is_empty());
        assert!(InMemoryEventStore::new(0).is_err());
    }
}
