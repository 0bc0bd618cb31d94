use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::warn;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// One change on a unit, as delivered to in-process subscribers
/// (notification and chat consumers). `payload` is the event as JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitNotification {
    pub unit_id: Ulid,
    pub payload: Arc<str>,
}

/// Per-unit broadcast feed of committed changes.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<UnitNotification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to changes on a unit. Creates the channel if needed.
    pub fn subscribe(&self, unit_id: Ulid) -> broadcast::Receiver<UnitNotification> {
        let sender = self
            .channels
            .entry(unit_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish a committed event. No-op if nobody is listening.
    pub fn send(&self, unit_id: Ulid, event: &Event) {
        let Some(sender) = self.channels.get(&unit_id) else { return };
        if sender.receiver_count() == 0 {
            return;
        }
        match serde_json::to_string(event) {
            Ok(json) => {
                let _ = sender.send(UnitNotification {
                    unit_id,
                    payload: json.into(),
                });
            }
            Err(e) => warn!("notify: cannot encode event for unit {unit_id}: {e}"),
        }
    }

    /// Drop a unit's channel; existing receivers see it close.
    pub fn remove(&self, unit_id: &Ulid) {
        self.channels.remove(unit_id);
    }
}
