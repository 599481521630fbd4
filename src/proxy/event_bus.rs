//! Interception event bus
//!
//! External components register listeners for an [`InterceptEvent`]. When a
//! buffered JSON transform fires, every listener receives the decoded payload
//! by mutable reference, in registration order, along with a [`Continuation`]
//! that completes the intercepted response.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Events raised by the interception layer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InterceptEvent {
    /// Decoded battle-init payload from the game server
    BattleInitData,
}

impl InterceptEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BattleInitData => "battleInitData",
        }
    }
}

impl fmt::Display for InterceptEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback invoked for every emitted payload of the event it is registered for
///
/// Implementations may mutate `payload` in place and should call
/// [`Continuation::resume`] exactly once, either directly or later from a
/// clone of the handle.
pub trait InterceptionListener: Send + Sync {
    fn on_event(&self, payload: &mut Value, continuation: &Continuation);
}

impl<F> InterceptionListener for F
where
    F: Fn(&mut Value, &Continuation) + Send + Sync,
{
    fn on_event(&self, payload: &mut Value, continuation: &Continuation) {
        self(payload, continuation)
    }
}

/// Handle returned by [`InterceptionBus::on`], used to unregister
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Single-use completion handle for one emitted payload
///
/// Clones share the same slot: the first `resume` delivers the payload and
/// every later call is ignored.
#[derive(Clone)]
pub struct Continuation {
    event: InterceptEvent,
    sender: Arc<Mutex<Option<oneshot::Sender<Value>>>>,
}

impl Continuation {
    /// Create a handle and the receiver the pipeline waits on
    pub fn channel(event: InterceptEvent) -> (Self, oneshot::Receiver<Value>) {
        let (sender, receiver) = oneshot::channel();
        let continuation = Self {
            event,
            sender: Arc::new(Mutex::new(Some(sender))),
        };
        (continuation, receiver)
    }

    /// Complete the exchange with `payload`; returns false if it was already completed
    pub fn resume(&self, payload: Value) -> bool {
        let Some(sender) = self.sender.lock().take() else {
            warn!(event = %self.event, "Continuation resumed more than once; ignoring");
            return false;
        };

        if sender.send(payload).is_err() {
            warn!(event = %self.event, "Continuation resumed after the exchange gave up waiting");
            return false;
        }
        true
    }

    pub fn is_resumed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("event", &self.event)
            .field("resumed", &self.is_resumed())
            .finish()
    }
}

type Registration = (ListenerId, Arc<dyn InterceptionListener>);

/// Registry of listeners keyed by event
#[derive(Default)]
pub struct InterceptionBus {
    listeners: RwLock<HashMap<InterceptEvent, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl InterceptionBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `event`; listeners run in registration order
    pub fn on<L>(&self, event: InterceptEvent, listener: L) -> ListenerId
    where
        L: InterceptionListener + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(event)
            .or_default()
            .push((id, Arc::new(listener)));
        debug!(%event, ?id, "Listener registered");
        id
    }

    /// Remove one listener; returns false if it was not registered for `event`
    pub fn off(&self, event: InterceptEvent, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(registered) = listeners.get_mut(&event) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|(existing, _)| *existing != id);
        let removed = registered.len() != before;
        if registered.is_empty() {
            listeners.remove(&event);
        }
        removed
    }

    pub fn listener_count(&self, event: InterceptEvent) -> usize {
        self.listeners.read().get(&event).map_or(0, Vec::len)
    }

    /// Invoke every listener for `event` with the same payload and continuation
    ///
    /// The registry is snapshotted first, so registrations made by a listener
    /// take effect from the next emit. Returns how many listeners ran.
    pub fn emit(&self, event: InterceptEvent, payload: &mut Value, continuation: &Continuation) -> usize {
        let snapshot: Vec<Arc<dyn InterceptionListener>> = self
            .listeners
            .read()
            .get(&event)
            .map(|registered| registered.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        for listener in &snapshot {
            listener.on_event(payload, continuation);
        }
        snapshot.len()
    }
}

impl fmt::Debug for InterceptionBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<InterceptEvent, usize> = self
            .listeners
            .read()
            .iter()
            .map(|(event, registered)| (*event, registered.len()))
            .collect();
        f.debug_struct("InterceptionBus")
            .field("listeners", &counts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const EVENT: InterceptEvent = InterceptEvent::BattleInitData;

    #[test]
    fn test_event_name() {
        assert_eq!(EVENT.to_string(), "battleInitData");
    }

    #[test]
    fn test_on_off_and_count() {
        let bus = InterceptionBus::new();
        assert_eq!(bus.listener_count(EVENT), 0);

        let first = bus.on(EVENT, |_: &mut Value, _: &Continuation| {});
        let second = bus.on(EVENT, |_: &mut Value, _: &Continuation| {});
        assert_ne!(first, second);
        assert_eq!(bus.listener_count(EVENT), 2);

        assert!(bus.off(EVENT, first));
        assert!(!bus.off(EVENT, first));
        assert_eq!(bus.listener_count(EVENT), 1);

        assert!(bus.off(EVENT, second));
        assert_eq!(bus.listener_count(EVENT), 0);
    }

    #[test]
    fn test_emit_runs_listeners_in_registration_order_on_shared_payload() {
        let bus = InterceptionBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for step in 0..3 {
            let order = order.clone();
            bus.on(EVENT, move |payload: &mut Value, _: &Continuation| {
                order.lock().push(step);
                // Each listener sees the mutations of the ones before it
                let seen = payload["steps"].as_array().map_or(0, Vec::len);
                assert_eq!(seen, step);
                payload["steps"]
                    .as_array_mut()
                    .expect("steps array")
                    .push(json!(step));
            });
        }

        let (continuation, _rx) = Continuation::channel(EVENT);
        let mut payload = json!({ "steps": [] });
        let invoked = bus.emit(EVENT, &mut payload, &continuation);

        assert_eq!(invoked, 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(payload["steps"], json!([0, 1, 2]));
    }

    #[test]
    fn test_registration_during_emit_applies_to_next_emit() {
        let bus = Arc::new(InterceptionBus::new());
        let registrar = Arc::downgrade(&bus);
        bus.on(EVENT, move |_: &mut Value, _: &Continuation| {
            if let Some(bus) = registrar.upgrade() {
                bus.on(EVENT, |_: &mut Value, _: &Continuation| {});
            }
        });

        let (continuation, _rx) = Continuation::channel(EVENT);
        let invoked = bus.emit(EVENT, &mut json!({}), &continuation);

        assert_eq!(invoked, 1);
        assert_eq!(bus.listener_count(EVENT), 2);
    }

    #[tokio::test]
    async fn test_first_resume_wins() {
        let (continuation, rx) = Continuation::channel(EVENT);
        let clone = continuation.clone();

        assert!(continuation.resume(json!({ "first": true })));
        assert!(!clone.resume(json!({ "second": true })));
        assert!(clone.is_resumed());

        assert_eq!(rx.await.unwrap(), json!({ "first": true }));
    }

    #[tokio::test]
    async fn test_dropped_continuation_closes_channel() {
        let (continuation, rx) = Continuation::channel(EVENT);
        drop(continuation);
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_resume_after_receiver_gone_reports_failure() {
        let (continuation, rx) = Continuation::channel(EVENT);
        drop(rx);
        assert!(!continuation.resume(json!(null)));
    }
}
