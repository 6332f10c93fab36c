use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::{EventType, Timestamp};

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Set of event types a subscriber wants. Empty means every type.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventFilter(BTreeSet<EventType>);

impl EventFilter {
    pub fn all() -> Self {
        Self(BTreeSet::new())
    }

    pub fn only<I: IntoIterator<Item = EventType>>(types: I) -> Self {
        Self(types.into_iter().collect())
    }

    /// Parse the comma-separated wire form, e.g. `"fall,zone_entry"`.
    /// Blank input means every type.
    pub fn parse(raw: &str) -> Result<Self> {
        let types = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse::<EventType>)
            .collect::<Result<BTreeSet<_>>>()?;
        Ok(Self(types))
    }

    pub fn matches(&self, event_type: EventType) -> bool {
        self.0.is_empty() || self.0.contains(&event_type)
    }

    pub fn is_all(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("ALL");
        }
        let names: Vec<&str> = self.0.iter().map(|t| t.as_str()).collect();
        f.write_str(&names.join(","))
    }
}

// -------------------- Inbox --------------------

struct InboxState {
    messages: VecDeque<String>,
    closed: bool,
    evicted: u64,
}

/// Bounded per-subscriber outgoing buffer shared by the distributor and one
/// `Subscription`.
pub(crate) struct Inbox {
    state: Mutex<InboxState>,
    ready: Condvar,
    capacity: usize,
}

impl Inbox {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(InboxState {
                messages: VecDeque::with_capacity(capacity),
                closed: false,
                evicted: 0,
            }),
            ready: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InboxState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a message. Returns whether an older message was evicted to make room.
    /// Fails once the subscriber side has closed.
    pub(crate) fn push(&self, message: String) -> Result<bool> {
        let mut state = self.lock();
        if state.closed {
            return Err(anyhow!("subscriber channel closed"));
        }
        let evicted = if state.messages.len() >= self.capacity {
            state.messages.pop_front();
            state.evicted += 1;
            true
        } else {
            false
        };
        state.messages.push_back(message);
        drop(state);
        self.ready.notify_one();
        Ok(evicted)
    }

    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

// -------------------- Subscription --------------------

/// Receiving end of one subscriber. Dropping it disconnects the subscriber; the
/// distributor removes it on the next broadcast.
pub struct Subscription {
    id: SubscriptionId,
    filter: EventFilter,
    inbox: Arc<Inbox>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, filter: EventFilter, inbox: Arc<Inbox>) -> Self {
        Self { id, filter, inbox }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    pub fn try_recv(&self) -> Option<String> {
        self.inbox.lock().messages.pop_front()
    }

    /// Wait up to `timeout` for the next message. `None` on timeout or once closed and empty.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<String> {
        let guard = self.inbox.lock();
        let (mut state, _) = self
            .inbox
            .ready
            .wait_timeout_while(guard, timeout, |s| s.messages.is_empty() && !s.closed)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.messages.pop_front()
    }

    pub fn drain(&self) -> Vec<String> {
        self.inbox.lock().messages.drain(..).collect()
    }

    pub fn pending(&self) -> usize {
        self.inbox.lock().messages.len()
    }

    /// Messages discarded because this subscriber fell behind.
    pub fn evicted(&self) -> u64 {
        self.inbox.lock().evicted
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }

    pub fn close(&self) {
        self.inbox.close();
    }

    /// Answer client-originated control text. Keep-alive is independent of the filter.
    pub fn handle_client_text(&self, text: &str) -> Option<String> {
        if text.trim() != "ping" {
            return None;
        }
        let pong = serde_json::json!({
            "type": "pong",
            "timestamp": Timestamp::now().as_millis(),
        });
        Some(pong.to_string())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inbox.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_parses_wire_form() {
        let filter = EventFilter::parse("fall, zone_entry").unwrap();
        assert!(filter.matches(EventType::Fall));
        assert!(filter.matches(EventType::ZoneEntry));
        assert!(!filter.matches(EventType::SpeedAlert));
        assert_eq!(filter.to_string(), "zone_entry,fall");

        assert!(EventFilter::parse("").unwrap().is_all());
        assert!(EventFilter::parse(" , ").unwrap().matches(EventType::Idle));
        assert!(EventFilter::parse("fall,warp").is_err());
    }

    #[test]
    fn inbox_evicts_oldest_when_full() {
        let inbox = Arc::new(Inbox::new(2));
        let sub = Subscription::new(SubscriptionId(1), EventFilter::all(), inbox.clone());
        assert!(!inbox.push("a".into()).unwrap());
        assert!(!inbox.push("b".into()).unwrap());
        assert!(inbox.push("c".into()).unwrap());
        assert_eq!(sub.evicted(), 1);
        assert_eq!(sub.drain(), vec!["b".to_string(), "c".to_string()]);
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn dropped_subscription_closes_inbox() {
        let inbox = Arc::new(Inbox::new(4));
        let sub = Subscription::new(SubscriptionId(7), EventFilter::all(), inbox.clone());
        assert_eq!(sub.id().to_string(), "sub-7");
        drop(sub);
        assert!(inbox.is_closed());
        assert!(inbox.push("late".into()).is_err());
    }

    #[test]
    fn ping_gets_pong() {
        let sub = Subscription::new(
            SubscriptionId(1),
            EventFilter::only([EventType::Fall]),
            Arc::new(Inbox::new(1)),
        );
        let reply: serde_json::Value =
            serde_json::from_str(&sub.handle_client_text("ping").unwrap()).unwrap();
        assert_eq!(reply["type"], "pong");
        assert!(reply["timestamp"].as_i64().unwrap() > 0);
        assert!(sub.handle_client_text("hello").is_none());
        assert_eq!(sub.recv_timeout(Duration::from_millis(5)), None);
    }
}
