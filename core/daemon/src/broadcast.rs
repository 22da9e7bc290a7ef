//! Fan-out of broadcast frames to subscribed displays.
//!
//! The registry lives inside the daemon's state lock, so frames are stamped and
//! queued in mutation order. Each subscriber drains its own channel on its
//! connection thread; a dropped receiver unregisters on the next publish.

use std::sync::mpsc::{self, Receiver, Sender};

use baylock_protocol::{Broadcast, BroadcastFrame};
use tracing::{debug, warn};

struct Subscriber {
    display_id: u32,
    tx: Sender<String>,
}

#[derive(Default)]
pub struct Broadcaster {
    subscribers: Vec<Subscriber>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, display_id: u32) -> Receiver<String> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(Subscriber { display_id, tx });
        debug!(display_id, subscribers = self.subscribers.len(), "Display subscribed");
        rx
    }

    /// Queues `frame` for every live subscriber. Returns how many received it.
    pub fn publish(&mut self, frame: &BroadcastFrame) -> usize {
        let line = match serde_json::to_string(frame) {
            Ok(line) => line,
            Err(err) => {
                warn!(seq = frame.seq, error = %err, "Failed to serialize broadcast");
                return 0;
            }
        };

        self.subscribers.retain(|subscriber| {
            let delivered = subscriber.tx.send(line.clone()).is_ok();
            if !delivered {
                debug!(display_id = subscriber.display_id, "Display unsubscribed");
            }
            delivered
        });
        debug!(
            seq = frame.seq,
            kind = kind(&frame.message),
            subscribers = self.subscribers.len(),
            "Broadcast published"
        );
        self.subscribers.len()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn display_ids(&self) -> Vec<u32> {
        self.subscribers.iter().map(|s| s.display_id).collect()
    }
}

fn kind(message: &Broadcast) -> &'static str {
    match message {
        Broadcast::BookingsSnapshot { .. } => "bookings_snapshot",
        Broadcast::BookingDelta { .. } => "booking_delta",
        Broadcast::OverrideChanged { .. } => "override_changed",
        Broadcast::ExtensionStateChanged { .. } => "extension_state_changed",
        Broadcast::BringToFront => "bring_to_front",
    }
}
