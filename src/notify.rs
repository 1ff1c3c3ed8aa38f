use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::BookingEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for booking events: one feed for everything plus
/// lazily created per-booking channels.
pub struct NotifyHub {
    all: broadcast::Sender<BookingEvent>,
    channels: DashMap<Ulid, broadcast::Sender<BookingEvent>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            channels: DashMap::new(),
        }
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<BookingEvent> {
        self.all.subscribe()
    }

    /// Subscribe to one booking. Creates the channel if needed.
    pub fn subscribe(&self, booking_id: Ulid) -> broadcast::Receiver<BookingEvent> {
        let sender = self
            .channels
            .entry(booking_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish an event. No-op for channels nobody listens on.
    pub fn send(&self, event: &BookingEvent) {
        let _ = self.all.send(event.clone());
        if let Some(sender) = self.channels.get(&event.booking_id()) {
            let _ = sender.send(event.clone());
        }
    }

    pub fn remove(&self, booking_id: &Ulid) {
        self.channels.remove(booking_id);
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}
