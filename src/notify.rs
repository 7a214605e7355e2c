use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast of committed events per business. This is where a
/// notification-delivery service attaches; the engine never waits on it.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a business's events. Creates the channel if needed.
    pub fn subscribe(&self, business_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(business_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a committed event. No-op for events without a business or
    /// when nobody is listening.
    pub fn send(&self, event: &Event) {
        let Some(business_id) = event.business_id() else {
            return;
        };
        if let Some(sender) = self.channels.get(&business_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a business's channel; current receivers see the stream close.
    pub fn remove(&self, business_id: &Ulid) {
        self.channels.remove(business_id);
    }
}
