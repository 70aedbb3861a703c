//! Fan-out of typed events to subscribers (the push side of the client
//! surface described in §6 of the spec).
//!
//! Producers are never back-pressured. High-volume events (`telemetry`,
//! `log`) ride a bounded broadcast channel where a lagging subscriber
//! silently drops its oldest entries. `device_update` must never be
//! dropped outright, so it's coalesced instead: only the latest snapshot
//! per device id is kept between drains.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use tokio::sync::{broadcast, Notify};

use crate::state::DeviceSnapshot;

/// High-volume / occasional events that tolerate drop-oldest semantics.
#[derive(Debug, Clone)]
pub enum GeneralEvent {
    Devices(Vec<DeviceSnapshot>),
    Telemetry {
        device: String,
        data: HashMap<String, String>,
    },
    StatusMessage {
        device: Option<String>,
        message: String,
    },
    Recovery {
        device: Option<String>,
        message: String,
    },
    NvmDump {
        device: String,
        data: String,
    },
    Log {
        timestamp_secs: f64,
        level: LogLevel,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    System,
    Error,
    Warning,
}

/// A single event as observed by a subscriber.
#[derive(Debug, Clone)]
pub enum Event {
    DeviceUpdate(DeviceSnapshot),
    General(GeneralEvent),
}

const GENERAL_CHANNEL_CAPACITY: usize = 256;

/// One subscriber's coalescing state for `device_update`. Kept
/// per-subscriber (not shared) so that draining a pending update on one
/// subscription can never suppress it for another -- each subscriber
/// must see every device's latest state, just not every intermediate one.
struct SubscriberSlot {
    pending: Mutex<HashMap<String, DeviceSnapshot>>,
    notify: Notify,
}

struct Inner {
    general_tx: broadcast::Sender<GeneralEvent>,
    subscribers: Mutex<Vec<Weak<SubscriberSlot>>>,
}

/// Central fan-out point. Cheaply cloneable; every clone shares the same
/// underlying channels.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        let (general_tx, _) = broadcast::channel(GENERAL_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                general_tx,
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Publishes a device snapshot to every live subscriber. If a
    /// subscriber hasn't yet drained the last update for this device id,
    /// it's replaced rather than queued behind it -- coalescing, not
    /// dropping.
    pub fn emit_device_update(&self, snapshot: DeviceSnapshot) {
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        subscribers.retain(|weak| {
            let Some(slot) = weak.upgrade() else {
                return false;
            };
            slot.pending.lock().unwrap().insert(snapshot.id.clone(), snapshot.clone());
            slot.notify.notify_waiters();
            true
        });
    }

    pub fn emit(&self, event: GeneralEvent) {
        // A send error just means there are no subscribers; that's fine,
        // nothing is listening to drop.
        let _ = self.inner.general_tx.send(event);
    }

    pub fn subscribe(&self) -> Subscription {
        let slot = Arc::new(SubscriberSlot {
            pending: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        });
        self.inner.subscribers.lock().unwrap().push(Arc::downgrade(&slot));
        Subscription {
            slot,
            general_rx: self.inner.general_tx.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A per-subscriber view over the bus. Call [`Subscription::recv`] in a
/// loop to drive the subscriber's worker task. Dropping the subscription
/// removes its slot from the bus on the next emit.
pub struct Subscription {
    slot: Arc<SubscriberSlot>,
    general_rx: broadcast::Receiver<GeneralEvent>,
}

impl Subscription {
    /// Waits for the next event. Device updates are drained first (and
    /// take priority) since they're the invariant the spec says must
    /// never be dropped; general events follow, tolerating `Lagged` by
    /// skipping forward rather than terminating the subscription.
    pub async fn recv(&mut self) -> Event {
        loop {
            if let Some(snapshot) = self.take_one_pending_update() {
                return Event::DeviceUpdate(snapshot);
            }

            tokio::select! {
                _ = self.slot.notify.notified() => {
                    if let Some(snapshot) = self.take_one_pending_update() {
                        return Event::DeviceUpdate(snapshot);
                    }
                }
                event = self.general_rx.recv() => {
                    match event {
                        Ok(event) => return Event::General(event),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => {
                            // The bus outlives every subscriber; this only
                            // happens if the EventBus itself was dropped.
                            std::future::pending::<()>().await;
                        }
                    }
                }
            }
        }
    }

    fn take_one_pending_update(&self) -> Option<DeviceSnapshot> {
        let mut pending = self.slot.pending.lock().unwrap();
        let key = pending.keys().next().cloned()?;
        pending.remove(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn device_updates_coalesce_to_latest() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        let mut a = crate::state::DeviceState::new("pressboi");
        a.connected = true;
        bus.emit_device_update(DeviceSnapshot::from(&a));

        a.firmware_version = Some("1.0".into());
        bus.emit_device_update(DeviceSnapshot::from(&a));

        a.firmware_version = Some("2.0".into());
        bus.emit_device_update(DeviceSnapshot::from(&a));

        let event = sub.recv().await;
        match event {
            Event::DeviceUpdate(snap) => {
                assert_eq!(snap.firmware_version.as_deref(), Some("2.0"));
            }
            _ => panic!("expected a device update"),
        }
    }

    #[tokio::test]
    async fn device_updates_fan_out_to_every_subscriber_independently() {
        let bus = EventBus::new();
        let mut sub_a = bus.subscribe();
        let mut sub_b = bus.subscribe();

        let mut device = crate::state::DeviceState::new("pressboi");
        device.connected = true;
        bus.emit_device_update(DeviceSnapshot::from(&device));

        // sub_a draining its copy must not remove sub_b's copy of the
        // same update -- each subscriber has independent coalescing state.
        match sub_a.recv().await {
            Event::DeviceUpdate(snap) => assert_eq!(snap.id, "pressboi"),
            _ => panic!("expected a device update"),
        }
        match sub_b.recv().await {
            Event::DeviceUpdate(snap) => assert_eq!(snap.id, "pressboi"),
            _ => panic!("expected a device update"),
        }
    }

    #[tokio::test]
    async fn general_events_are_delivered_in_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        bus.emit(GeneralEvent::StatusMessage {
            device: Some("pressboi".into()),
            message: "INFO:boot".into(),
        });

        match sub.recv().await {
            Event::General(GeneralEvent::StatusMessage { message, .. }) => {
                assert_eq!(message, "INFO:boot");
            }
            _ => panic!("expected a status message"),
        }
    }
}
