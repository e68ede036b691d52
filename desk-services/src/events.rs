//! Typed event bus for stream notifications
//!
//! Decouples the session manager's fan-out from the socket transport: any
//! interested party subscribes here, regardless of where the events came
//! from.

use desk_core::{StreamEvent, StreamNotification};
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Broadcast bus for user-tagged stream events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StreamNotification>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to every notification on the bus
    pub fn subscribe(&self) -> broadcast::Receiver<StreamNotification> {
        self.tx.subscribe()
    }

    /// Publish an event tagged with its owning user
    pub fn publish(&self, user_id: &str, event: StreamEvent) {
        let notification = StreamNotification {
            user_id: user_id.to_string(),
            event,
        };
        // A send error only means nobody is listening right now.
        if self.tx.send(notification).is_err() {
            debug!("[Events] Dropped notification (no subscribers)");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use desk_core::ConnectionState;

    #[tokio::test]
    async fn delivers_tagged_events_to_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(
            "user-1",
            StreamEvent::ConnectionStatus {
                state: ConnectionState::Connected,
                detail: None,
            },
        );

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.user_id, "user-1");
        assert!(matches!(
            notification.event,
            StreamEvent::ConnectionStatus {
                state: ConnectionState::Connected,
                ..
            }
        ));
    }
}
