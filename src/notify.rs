use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Ms, Party};

const CHANNEL_CAPACITY: usize = 256;
const FIREHOSE_CAPACITY: usize = 4096;

/// Outbound domain events for payment/notification consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    HoldPlaced {
        hold_id: Ulid,
        tutor_id: Ulid,
        consumer_id: Ulid,
        at: Ms,
    },
    HoldReleased {
        hold_id: Ulid,
        tutor_id: Ulid,
        consumer_id: Ulid,
        at: Ms,
    },
    HoldExpired {
        hold_id: Ulid,
        tutor_id: Ulid,
        consumer_id: Ulid,
        at: Ms,
    },
    BookingCreated {
        booking_id: Ulid,
        tutor_id: Ulid,
        consumer_id: Ulid,
        at: Ms,
    },
    BookingAcknowledged {
        booking_id: Ulid,
        tutor_id: Ulid,
        consumer_id: Ulid,
        at: Ms,
    },
    BookingCanceled {
        booking_id: Ulid,
        tutor_id: Ulid,
        consumer_id: Ulid,
        by: Party,
        at: Ms,
    },
    BookingCompleted {
        booking_id: Ulid,
        tutor_id: Ulid,
        consumer_id: Ulid,
        at: Ms,
    },
    NoShowReported {
        booking_id: Ulid,
        tutor_id: Ulid,
        consumer_id: Ulid,
        absent: Party,
        at: Ms,
    },
}

impl DomainEvent {
    pub fn tutor_id(&self) -> Ulid {
        match self {
            DomainEvent::HoldPlaced { tutor_id, .. }
            | DomainEvent::HoldReleased { tutor_id, .. }
            | DomainEvent::HoldExpired { tutor_id, .. }
            | DomainEvent::BookingCreated { tutor_id, .. }
            | DomainEvent::BookingAcknowledged { tutor_id, .. }
            | DomainEvent::BookingCanceled { tutor_id, .. }
            | DomainEvent::BookingCompleted { tutor_id, .. }
            | DomainEvent::NoShowReported { tutor_id, .. } => *tutor_id,
        }
    }

    pub fn to_json(&self) -> String {
        // Plain data with string/number fields only; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Broadcast hub: one channel per tutor plus a firehose for bus consumers.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<DomainEvent>>,
    firehose: broadcast::Sender<DomainEvent>,
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
            firehose: broadcast::channel(FIREHOSE_CAPACITY).0,
        }
    }

    /// Subscribe to events for one tutor. Creates the channel if needed.
    pub fn subscribe(&self, tutor_id: Ulid) -> broadcast::Receiver<DomainEvent> {
        let sender = self
            .channels
            .entry(tutor_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Subscribe to every event from every tutor.
    pub fn subscribe_all(&self) -> broadcast::Receiver<DomainEvent> {
        self.firehose.subscribe()
    }

    /// Publish an event. No-op if nobody is listening.
    pub fn send(&self, event: DomainEvent) {
        tracing::debug!(payload = %event.to_json(), "domain event");
        if let Some(sender) = self.channels.get(&event.tutor_id()) {
            let _ = sender.send(event.clone());
        }
        let _ = self.firehose.send(event);
    }
}
