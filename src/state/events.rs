/// Catalog change notifications
///
/// The backend fans out one `ChangeEvent` per mutation to every subscriber.
/// Delivery is at-least-once and only best-effort ordered, so consumers
/// must treat an event as "something changed, reload" and nothing more.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Where a notification came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOrigin {
    /// Synthesized in-process after a successful local mutation
    Local,
    /// Delivered by the backend's change feed
    Backend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub product_id: Option<i64>,
    pub origin: ChangeOrigin,
}

impl ChangeEvent {
    pub fn local(kind: ChangeKind, product_id: i64) -> Self {
        Self {
            kind,
            product_id: Some(product_id),
            origin: ChangeOrigin::Local,
        }
    }

    pub fn backend(kind: ChangeKind, product_id: Option<i64>) -> Self {
        Self {
            kind,
            product_id,
            origin: ChangeOrigin::Backend,
        }
    }
}

/// Change-event collaborator
pub trait ChangeFeed: Send + Sync {
    /// A fresh receiver; dropping it unsubscribes
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}

/// In-process fan-out of change events
#[derive(Debug, Clone)]
pub struct ChangeBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to current subscribers; returns how many received it
    pub fn publish(&self, event: ChangeEvent) -> usize {
        // No subscribers is not an error
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl ChangeFeed for ChangeBus {
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}
