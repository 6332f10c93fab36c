use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::Result;

use crate::{Event, EventType};

/// Callback run synchronously for every registered event of one type.
pub type EventHandler = dyn Fn(&Event) -> Result<()> + Send + Sync;

/// Per-event-type handler lists.
///
/// Handlers are stored as `Arc` so the detector can copy a list out and run it
/// without holding any lock.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: HashMap<EventType, Vec<Arc<EventHandler>>>,
}

impl HandlerRegistry {
    pub(crate) fn register(&mut self, event_type: EventType, handler: Arc<EventHandler>) {
        self.handlers.entry(event_type).or_default().push(handler);
    }

    pub(crate) fn for_type(&self, event_type: EventType) -> Vec<Arc<EventHandler>> {
        self.handlers.get(&event_type).cloned().unwrap_or_default()
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }
}

/// Run every handler. Errors and panics are logged and counted, never propagated.
pub(crate) fn run_handlers(handlers: &[Arc<EventHandler>], event: &Event) -> u64 {
    let mut failures = 0;
    for handler in handlers {
        match catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failures += 1;
                log::error!("event handler error ({}): {:#}", event.event_type, e);
            }
            Err(_) => {
                failures += 1;
                log::error!("event handler panicked ({})", event.event_type);
            }
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Timestamp;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn failing_handlers_do_not_stop_the_rest() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::default();
        registry.register(
            EventType::Fall,
            Arc::new(|_: &Event| -> Result<()> { Err(anyhow!("boom")) }),
        );
        registry.register(
            EventType::Fall,
            Arc::new(|_: &Event| -> Result<()> { panic!("handler bug") }),
        );
        let counter = calls.clone();
        registry.register(
            EventType::Fall,
            Arc::new(move |_: &Event| -> Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        assert_eq!(registry.len(), 3);

        let event = Event::new("cam1", EventType::Fall, 0.85, Timestamp::from_millis(1));
        let failures = run_handlers(&registry.for_type(EventType::Fall), &event);
        assert_eq!(failures, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.for_type(EventType::Idle).is_empty());
    }
}
