//! Listener contract and the asynchronous event bus.
//!
//! `trigger` never blocks the dispatcher: every `(event kind, listener)`
//! subscription owns an unbounded channel drained by its own forwarder
//! task. That serializes deliveries per subscription in trigger order while
//! leaving cross-listener ordering unspecified. A panicking listener loses
//! that one notification and nothing else.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::domain::events::{Event, EventKind};
use crate::domain::ids::ListenerId;
use crate::domain::metadata::{wall_value, Metadata};
use crate::ports::Clock;

/// Event consumer, implementable by embedders.
#[async_trait]
pub trait Listener: Send + Sync {
    fn id(&self) -> &ListenerId;

    async fn notify(&self, event: Event);
}

struct Subscription {
    listener_id: ListenerId,
    tx: mpsc::UnboundedSender<Event>,
}

struct ListenerEntry {
    listener: Arc<dyn Listener>,
    attached_at: Instant,
}

struct BusState {
    subscriptions: HashMap<EventKind, Vec<Subscription>>,
    listeners: HashMap<ListenerId, ListenerEntry>,
}

impl BusState {
    fn kinds_of(&self, id: &ListenerId) -> Vec<EventKind> {
        EventKind::ALL
            .into_iter()
            .filter(|kind| {
                self.subscriptions
                    .get(kind)
                    .is_some_and(|subs| subs.iter().any(|sub| sub.listener_id == *id))
            })
            .collect()
    }
}

pub struct ListenerBus {
    state: Mutex<BusState>,
}

impl ListenerBus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState {
                subscriptions: HashMap::new(),
                listeners: HashMap::new(),
            }),
        }
    }

    /// Subscribe a listener to one event kind and spawn its forwarder.
    /// Returns false when this `(kind, listener)` pair is already attached.
    pub fn attach(&self, kind: EventKind, listener: Arc<dyn Listener>, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap();
        let subs = state.subscriptions.entry(kind).or_default();
        if subs.iter().any(|sub| sub.listener_id == *listener.id()) {
            return false;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        subs.push(Subscription {
            listener_id: listener.id().clone(),
            tx,
        });
        state
            .listeners
            .entry(listener.id().clone())
            .or_insert_with(|| ListenerEntry {
                listener: Arc::clone(&listener),
                attached_at: now,
            });
        drop(state);

        let id = listener.id().clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let kind = event.kind();
                let call = AssertUnwindSafe(listener.notify(event)).catch_unwind();
                if call.await.is_err() {
                    tracing::warn!(listener = %id, event = ?kind, "listener panicked, notification dropped");
                }
            }
        });
        true
    }

    /// Drop one `(kind, listener)` subscription; its forwarder winds down
    /// after draining what was already queued.
    pub fn detach(&self, kind: EventKind, id: &ListenerId) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(subs) = state.subscriptions.get_mut(&kind) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|sub| sub.listener_id != *id);
        let removed = subs.len() != before;

        if removed && state.kinds_of(id).is_empty() {
            state.listeners.remove(id);
        }
        removed
    }

    /// Fan an event out to every subscriber of its kind. Non-blocking.
    pub fn trigger(&self, event: Event) {
        let targets: Vec<mpsc::UnboundedSender<Event>> = {
            let state = self.state.lock().unwrap();
            match state.subscriptions.get(&event.kind()) {
                Some(subs) => subs.iter().map(|sub| sub.tx.clone()).collect(),
                None => return,
            }
        };
        for tx in targets {
            let _ = tx.send(event.clone());
        }
    }

    pub fn get_by_id(&self, id: &ListenerId) -> Option<Arc<dyn Listener>> {
        self.state
            .lock()
            .unwrap()
            .listeners
            .get(id)
            .map(|entry| Arc::clone(&entry.listener))
    }

    pub fn listeners(&self) -> Vec<Arc<dyn Listener>> {
        let state = self.state.lock().unwrap();
        let mut entries: Vec<_> = state.listeners.iter().collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        entries
            .into_iter()
            .map(|(_, entry)| Arc::clone(&entry.listener))
            .collect()
    }

    /// Kinds a listener is currently attached to.
    pub fn kinds_of(&self, id: &ListenerId) -> Vec<EventKind> {
        self.state.lock().unwrap().kinds_of(id)
    }

    pub fn metadata(&self, id: &ListenerId, clock: &dyn Clock) -> Option<Metadata> {
        let state = self.state.lock().unwrap();
        let entry = state.listeners.get(id)?;

        let mut meta = Metadata::new();
        meta.insert("id".into(), Value::String(id.to_string()));
        meta.insert(
            "created_at".into(),
            wall_value(clock, Some(entry.attached_at)),
        );
        meta.insert(
            "events".into(),
            Value::Array(
                state
                    .kinds_of(id)
                    .into_iter()
                    .map(|kind| Value::String(format!("{kind:?}")))
                    .collect(),
            ),
        );
        Some(meta)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ListenerBus {
    fn default() -> Self {
        Self::new()
    }
}
