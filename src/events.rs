//! Attribute events driven by the polling engine.
//!
//! Subscriptions are tracked per (device, attribute, kind). Events are
//! published on a `tokio::sync::broadcast` channel that the HTTP layer turns
//! into a server-sent event stream.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::data::{now_ms, AttributeValue};
use crate::error::DevError;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Change,
    Periodic,
    Archive,
    Alarm,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub device: String,
    pub attribute: String,
    pub kind: EventKind,
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<AttributeValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DevError>,
}

#[derive(Debug, Default)]
struct AttrEvents {
    subscribers: HashMap<EventKind, usize>,
    pushed_by_code: HashSet<EventKind>,
}

/// RAII guard that decrements the stream count on drop.
pub struct StreamGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct EventChannel {
    tx: broadcast::Sender<DeviceEvent>,
    attrs: Mutex<HashMap<(String, String), AttrEvents>>,
    streams: Arc<AtomicUsize>,
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

fn key(device: &str, attribute: &str) -> (String, String) {
    (device.to_lowercase(), attribute.to_lowercase())
}

impl EventChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            tx,
            attrs: Mutex::new(HashMap::new()),
            streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn subscribe(&self, device: &str, attribute: &str, kind: EventKind) {
        *self
            .attrs
            .lock()
            .entry(key(device, attribute))
            .or_default()
            .subscribers
            .entry(kind)
            .or_insert(0) += 1;
    }

    /// Drop one subscription. Returns false if there was none.
    pub fn unsubscribe(&self, device: &str, attribute: &str, kind: EventKind) -> bool {
        let mut attrs = self.attrs.lock();
        let Some(events) = attrs.get_mut(&key(device, attribute)) else {
            return false;
        };
        match events.subscribers.get_mut(&kind) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                events.subscribers.remove(&kind);
                true
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self, device: &str, attribute: &str, kind: EventKind) -> bool {
        self.attrs
            .lock()
            .get(&key(device, attribute))
            .map(|e| e.subscribers.contains_key(&kind))
            .unwrap_or(false)
    }

    /// Mark an event kind as pushed by device code rather than by polling.
    pub fn set_pushed_by_code(&self, device: &str, attribute: &str, kind: EventKind, pushed: bool) {
        let mut attrs = self.attrs.lock();
        let events = attrs.entry(key(device, attribute)).or_default();
        if pushed {
            events.pushed_by_code.insert(kind);
        } else {
            events.pushed_by_code.remove(&kind);
        }
    }

    pub fn is_pushed_by_code(&self, device: &str, attribute: &str, kind: EventKind) -> bool {
        self.attrs
            .lock()
            .get(&key(device, attribute))
            .map(|e| e.pushed_by_code.contains(&kind))
            .unwrap_or(false)
    }

    /// Create a receiver for every event published from now on.
    pub fn receiver(&self) -> broadcast::Receiver<DeviceEvent> {
        self.tx.subscribe()
    }

    /// Register an event stream consumer.
    pub fn add_stream(&self) -> StreamGuard {
        self.streams.fetch_add(1, Ordering::Relaxed);
        StreamGuard {
            count: self.streams.clone(),
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.load(Ordering::Relaxed)
    }

    fn publish(
        &self,
        device: &str,
        attribute: &str,
        kind: EventKind,
        value: &Result<AttributeValue, DevError>,
    ) {
        let (value, error) = match value {
            Ok(v) => (Some(v.clone()), None),
            Err(e) => (None, Some(e.clone())),
        };
        // Sending only fails when nobody listens.
        let _ = self.tx.send(DeviceEvent {
            device: device.to_string(),
            attribute: attribute.to_string(),
            kind,
            timestamp_ms: now_ms(),
            value,
            error,
        });
    }

    /// Fire the events due after one poll of an attribute.
    pub fn fire_polled(
        &self,
        device: &str,
        attribute: &str,
        new: &Result<AttributeValue, DevError>,
        previous: Option<&Result<AttributeValue, DevError>>,
    ) {
        if self.is_subscribed(device, attribute, EventKind::Periodic) {
            self.publish(device, attribute, EventKind::Periodic, new);
        }
        if self.is_subscribed(device, attribute, EventKind::Change)
            && !self.is_pushed_by_code(device, attribute, EventKind::Change)
            && value_changed(previous, new)
        {
            self.publish(device, attribute, EventKind::Change, new);
        }
    }

    /// Tell subscribers that polling of an attribute has been stopped.
    pub fn fire_polling_stopped(&self, device: &str, attribute: &str) {
        let err = Err(DevError::new(
            "API_PollObjNotFound",
            format!("No event possible on attribute {attribute}. Polling has just being stopped!"),
            "DServer::rem_obj_polling",
        ));
        if self.is_subscribed(device, attribute, EventKind::Periodic) {
            self.publish(device, attribute, EventKind::Periodic, &err);
        }
        for kind in [EventKind::Archive, EventKind::Change, EventKind::Alarm] {
            if self.is_subscribed(device, attribute, kind)
                && !self.is_pushed_by_code(device, attribute, kind)
            {
                self.publish(device, attribute, kind, &err);
            }
        }
    }
}

fn value_changed(
    previous: Option<&Result<AttributeValue, DevError>>,
    new: &Result<AttributeValue, DevError>,
) -> bool {
    match (previous, new) {
        (None, _) => true,
        (Some(Ok(old)), Ok(new)) => old.data != new.data || old.quality != new.quality,
        (Some(Err(old)), Err(new)) => old.reason != new.reason,
        _ => true,
    }
}
