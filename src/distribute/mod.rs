//! Event distribution.
//!
//! A bounded queue decouples event producers from one background dispatch thread. The
//! dispatcher pops events in FIFO order and broadcasts each to every subscriber whose
//! filter admits it. Subscribers own small bounded inboxes, so a slow subscriber loses
//! its own oldest messages and never stalls the dispatcher or other subscribers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::Event;

mod subscriber;

pub use subscriber::{EventFilter, Subscription, SubscriptionId, DEFAULT_SUBSCRIBER_BUFFER};
use subscriber::Inbox;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
/// How long the dispatcher waits for an event before rechecking shutdown.
const DISPATCH_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistributorConfig {
    pub queue_capacity: usize,
    pub subscriber_buffer: usize,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

impl DistributorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(anyhow!("event queue capacity must be greater than zero"));
        }
        if self.subscriber_buffer == 0 {
            return Err(anyhow!("subscriber buffer must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DistributorStats {
    pub total_subscribers: u64,
    pub current_subscribers: usize,
    pub total_sent: u64,
    pub total_failed: u64,
    pub avg_messages_per_subscriber: f64,
    pub enqueued: u64,
    pub dropped: u64,
    pub dispatched: u64,
    pub evicted: u64,
}

struct Subscriber {
    filter: EventFilter,
    inbox: Arc<Inbox>,
}

#[derive(Default)]
struct Counters {
    total_subscribers: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    dispatched: AtomicU64,
    evicted: AtomicU64,
}

pub struct EventDistributor {
    cfg: DistributorConfig,
    sender: SyncSender<Event>,
    /// `None` while the dispatch thread owns the receiver.
    receiver: Mutex<Option<Receiver<Event>>>,
    subscribers: Mutex<BTreeMap<SubscriptionId, Subscriber>>,
    next_id: AtomicU64,
    counters: Counters,
}

/// Running dispatch thread. `stop` finishes the in-flight broadcast, then joins.
pub struct DispatchHandle {
    distributor: Arc<EventDistributor>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<Receiver<Event>>>,
}

impl DispatchHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown_and_join()
    }

    /// Signal shutdown, join the thread and hand the queue receiver back to the distributor.
    fn shutdown_and_join(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        let Some(join) = self.join.take() else {
            return Ok(());
        };
        let receiver = join
            .join()
            .map_err(|_| anyhow!("event dispatch thread panicked"))?;
        *self.distributor.lock_receiver() = Some(receiver);
        log::info!("event dispatcher stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().map_or(false, |j| !j.is_finished())
    }
}

impl Drop for DispatchHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown_and_join() {
            log::error!("event dispatcher shutdown failed: {:#}", e);
        }
    }
}

impl EventDistributor {
    pub fn new(cfg: DistributorConfig) -> Result<Self> {
        cfg.validate()?;
        let (sender, receiver) = mpsc::sync_channel(cfg.queue_capacity);
        log::info!(
            "event distributor ready: queue={} subscriber_buffer={}",
            cfg.queue_capacity,
            cfg.subscriber_buffer
        );
        Ok(Self {
            cfg,
            sender,
            receiver: Mutex::new(Some(receiver)),
            subscribers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &DistributorConfig {
        &self.cfg
    }

    fn lock_receiver(&self) -> MutexGuard<'_, Option<Receiver<Event>>> {
        self.receiver.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, BTreeMap<SubscriptionId, Subscriber>> {
        self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue an event without blocking. A full queue drops the event and returns `false`.
    pub fn enqueue(&self, event: Event) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(event)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("event queue full, dropping {} event", event.event_type);
                false
            }
            Err(TrySendError::Disconnected(event)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::error!("event queue closed, dropping {} event", event.event_type);
                false
            }
        }
    }

    /// Spawn the dispatch thread. Fails if one is already running.
    pub fn start(self: &Arc<Self>) -> Result<DispatchHandle> {
        let receiver = self
            .lock_receiver()
            .take()
            .ok_or_else(|| anyhow!("event dispatcher already running"))?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();
        let distributor = Arc::clone(self);
        let join = std::thread::Builder::new()
            .name("event-dispatch".into())
            .spawn(move || distributor.dispatch_loop(receiver, &stop))
            .map_err(|e| anyhow!("failed to spawn event dispatcher: {}", e))?;
        log::info!("event dispatcher started");
        Ok(DispatchHandle {
            distributor: Arc::clone(self),
            shutdown,
            join: Some(join),
        })
    }

    fn dispatch_loop(&self, receiver: Receiver<Event>, shutdown: &AtomicBool) -> Receiver<Event> {
        while !shutdown.load(Ordering::SeqCst) {
            match receiver.recv_timeout(DISPATCH_POLL) {
                Ok(event) => {
                    self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                    self.broadcast(&event);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        receiver
    }

    /// Broadcast everything queued so far on the calling thread.
    /// Returns 0 without touching the queue while the dispatch thread is running.
    pub fn dispatch_pending(&self) -> usize {
        let guard = self.lock_receiver();
        let Some(receiver) = guard.as_ref() else {
            return 0;
        };
        let mut count = 0;
        while let Ok(event) = receiver.try_recv() {
            self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
            self.broadcast(&event);
            count += 1;
        }
        count
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let inbox = Arc::new(Inbox::new(self.cfg.subscriber_buffer));
        log::info!("subscriber {} connected (filter: {})", id, filter);
        self.lock_subscribers().insert(
            id,
            Subscriber {
                filter: filter.clone(),
                inbox: inbox.clone(),
            },
        );
        self.counters.total_subscribers.fetch_add(1, Ordering::Relaxed);
        Subscription::new(id, filter, inbox)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.lock_subscribers().remove(&id) {
            Some(subscriber) => {
                subscriber.inbox.close();
                log::info!("subscriber {} disconnected", id);
                true
            }
            None => false,
        }
    }

    /// Deliver `event` to every matching subscriber and return how many received it.
    /// Closed subscribers are removed and counted as failures, whatever their filter.
    pub fn broadcast(&self, event: &Event) -> usize {
        let message = match serde_json::to_string(event) {
            Ok(message) => message,
            Err(e) => {
                log::error!("failed to serialize {} event: {}", event.event_type, e);
                return 0;
            }
        };

        let mut subscribers = self.lock_subscribers();
        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, subscriber) in subscribers.iter() {
            if subscriber.inbox.is_closed() {
                log::warn!("removing subscriber {}: subscription closed", id);
                closed.push(*id);
                continue;
            }
            if !subscriber.filter.matches(event.event_type) {
                continue;
            }
            match subscriber.inbox.push(message.clone()) {
                Ok(evicted) => {
                    delivered += 1;
                    if evicted {
                        self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    log::warn!("removing subscriber {}: {}", id, e);
                    closed.push(*id);
                }
            }
        }
        for id in &closed {
            subscribers.remove(id);
        }
        drop(subscribers);

        self.counters.sent.fetch_add(delivered as u64, Ordering::Relaxed);
        self.counters.failed.fetch_add(closed.len() as u64, Ordering::Relaxed);
        log::debug!("{} event delivered to {} subscribers", event.event_type, delivered);
        delivered
    }

    /// Push a raw message to one subscriber, ignoring its filter.
    pub fn send_to(&self, id: SubscriptionId, message: String) -> bool {
        let mut subscribers = self.lock_subscribers();
        let Some(subscriber) = subscribers.get(&id) else {
            return false;
        };
        match subscriber.inbox.push(message) {
            Ok(_) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                log::warn!("removing subscriber {}: {}", id, e);
                subscribers.remove(&id);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    pub fn stats(&self) -> DistributorStats {
        let total_subscribers = self.counters.total_subscribers.load(Ordering::Relaxed);
        let total_sent = self.counters.sent.load(Ordering::Relaxed);
        DistributorStats {
            total_subscribers,
            current_subscribers: self.subscriber_count(),
            total_sent,
            total_failed: self.counters.failed.load(Ordering::Relaxed),
            avg_messages_per_subscriber: if total_subscribers > 0 {
                total_sent as f64 / total_subscribers as f64
            } else {
                0.0
            },
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
        }
    }
}
