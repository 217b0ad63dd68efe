//! Event Bus (C2, spec §4.2).
//!
//! Typed pub/sub over [`tokio::sync::broadcast`], generalized from the
//! teacher's `factory/ws.rs` WebSocket fan-out (`broadcast::Sender<String>`
//! plus per-connection `RecvError::Lagged` handling) into a bus that fans
//! out structured [`orc_common::Event`] values to both a global channel and
//! per-task channels, and durably persists every event to the [`Store`]
//! before publishing.
//!
//! Wiring invariant (spec §4.2): constructing a `Phase Runner` without a
//! bus reference, or never attaching a WebSocket adapter to
//! [`EventBus::subscribe_global`], silently loses realtime updates even
//! though persistence still works — the type system can't prevent this, so
//! callers MUST attach adapters at startup, not lazily.

use std::sync::Arc;

use dashmap::DashMap;
use orc_common::{Event, EventType};
use orc_store::Store;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 1024;

/// Shared, cloneable handle to the bus. Cheap to clone (an `Arc` plus a
/// sender handle) so every component that needs to publish holds its own
/// copy, same as the teacher passes `ws_tx: broadcast::Sender<String>`
/// around by clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<Store>,
    global: broadcast::Sender<Event>,
    per_task: DashMap<Uuid, broadcast::Sender<Event>>,
}

impl EventBus {
    pub fn new(store: Arc<Store>) -> Self {
        let (global, _) = broadcast::channel(CHANNEL_CAPACITY);
        EventBus {
            inner: Arc::new(Inner {
                store,
                global,
                per_task: DashMap::new(),
            }),
        }
    }

    /// Publish an event: durably append to the Store first, then fan out.
    /// This ordering is the ordering guarantee in spec §5: "the write is
    /// durable first, then the event is emitted".
    pub fn publish(&self, event: Event) {
        if let Err(e) = self.inner.store.append_event(&event) {
            warn!(error = %e, event_id = %event.id, "failed to persist event before publish");
        }

        if event.event_type.is_global() {
            let _ = self.inner.global.send(event.clone());
        }

        if let Some(task_id) = event.task_id {
            let sender = self
                .inner
                .per_task
                .entry(task_id)
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .clone();
            let _ = sender.send(event);
        }
    }

    /// Subscribe to every global event (`"*"` per spec §4.2).
    pub fn subscribe_global(&self) -> broadcast::Receiver<Event> {
        self.inner.global.subscribe()
    }

    /// Subscribe to a single task's events.
    pub fn subscribe_task(&self, task_id: Uuid) -> broadcast::Receiver<Event> {
        self.inner
            .per_task
            .entry(task_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Emit the aggregate `session_update` event: on subscribe, and
    /// whenever counters change materially (spec §4.2). Callers recompute
    /// the payload; the bus only knows how to publish it.
    pub fn emit_session_update(&self, task_id: Uuid, payload: serde_json::Value) {
        self.publish(Event::new(Some(task_id), EventType::SessionUpdate, payload, "event_bus"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_persists_then_fans_out_to_global_subscribers() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::new(store.clone());
        let mut rx = bus.subscribe_global();

        let event = Event::new(None, EventType::TaskCreated, serde_json::json!({}), "api");
        let event_id = event.id;
        bus.publish(event);

        let received = rx.try_recv().unwrap();
        assert_eq!(received.id, event_id);

        let page = store
            .list_events(&orc_store::EventFilter {
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.events.len(), 1);
    }

    #[test]
    fn per_task_events_are_not_seen_by_global_subscribers() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::new(store);
        let mut global_rx = bus.subscribe_global();
        let task_id = Uuid::new_v4();
        let mut task_rx = bus.subscribe_task(task_id);

        bus.publish(Event::new(
            Some(task_id),
            EventType::Phase,
            serde_json::json!({}),
            "phase_runner",
        ));

        assert!(task_rx.try_recv().is_ok());
        assert!(global_rx.try_recv().is_err());
    }
}
