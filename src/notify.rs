use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Fire-and-forget dispatch hub for lifecycle notifications, one broadcast
/// channel per participant (tutor or student). The delivery layer (email,
/// push, whatever) subscribes; the engine never waits on it, and a lagging
/// or absent subscriber never affects a booking.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
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

    /// Subscribe to events concerning a participant. Creates the channel
    /// if needed.
    pub fn subscribe(&self, participant_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(participant_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, participant_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&participant_id) {
            let _ = sender.send(event.clone());
        }
    }

    pub fn remove(&self, participant_id: &Ulid) {
        self.channels.remove(participant_id);
    }
}
