use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::Value as JsonValue;
use tokio::sync::broadcast;

// Append-only, bounded, per-session log of outbound stream events. Producers
// are serialized by the owning session; replayers only read. Event ids are
// strictly increasing and never reused, so a reconnecting client presenting
// `Last-Event-Id: L` receives exactly L+1, L+2, … (modulo eviction).

#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub event_id: u64,
    pub payload: JsonValue,
}

pub struct EventStore {
    session_id: String,
    capacity: usize,
    inner: Mutex<Inner>,
    live: broadcast::Sender<StoredEvent>,
}

struct Inner {
    next_id: u64,
    events: VecDeque<StoredEvent>,
}

impl EventStore {
    pub fn new(session_id: impl Into<String>, capacity: usize) -> Self {
        let (live, _) = broadcast::channel(256);
        Self {
            session_id: session_id.into(),
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                next_id: 0,
                events: VecDeque::new(),
            }),
            live,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Assign the next event id, append, and publish to live subscribers.
    /// Oldest events are evicted FIFO once the bound is reached.
    pub fn append(&self, payload: JsonValue) -> u64 {
        let event = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_id += 1;
            let event = StoredEvent {
                event_id: inner.next_id,
                payload,
            };
            inner.events.push_back(event.clone());
            while inner.events.len() > self.capacity {
                inner.events.pop_front();
            }
            event
        };
        let id = event.event_id;
        let _ = self.live.send(event);
        id
    }

    /// Events with id strictly greater than `last_event_id`, in order.
    pub fn replay_after(&self, last_event_id: u64) -> Vec<StoredEvent> {
        let inner = self.inner.lock().unwrap();
        inner
            .events
            .iter()
            .filter(|e| e.event_id > last_event_id)
            .cloned()
            .collect()
    }

    pub fn last_event_id(&self) -> u64 {
        self.inner.lock().unwrap().next_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoredEvent> {
        self.live.subscribe()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_are_gap_free_and_replay_is_exclusive() {
        let store = EventStore::new("s", 64);
        for i in 1..=8u64 {
            assert_eq!(store.append(json!({ "n": i })), i);
        }
        let replayed = store.replay_after(5);
        let ids: Vec<u64> = replayed.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![6, 7, 8]);
        assert_eq!(store.last_event_id(), 8);
    }

    #[test]
    fn live_events_continue_after_replay_point() {
        let store = EventStore::new("s", 64);
        for i in 1..=8u64 {
            store.append(json!({ "n": i }));
        }
        let mut rx = store.subscribe();
        assert_eq!(store.append(json!({ "n": 9 })), 9);
        let live = rx.try_recv().unwrap();
        assert_eq!(live.event_id, 9);
    }

    #[test]
    fn eviction_is_fifo_and_never_reorders() {
        let store = EventStore::new("s", 3);
        for i in 1..=5u64 {
            store.append(json!(i));
        }
        let all = store.replay_after(0);
        let ids: Vec<u64> = all.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![3, 4, 5], "oldest evicted, order kept");
        // ids keep climbing after eviction
        assert_eq!(store.append(json!(6)), 6);
    }
}
