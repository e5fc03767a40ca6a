//! Event bus for session notifications
//!
//! The engine publishes membership, quality and moderation events here; the
//! surrounding application subscribes to display or log them.

pub mod types;

pub use types::SessionEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcast bus for session events
///
/// # Example
///
/// ```no_run
/// use classroom_rtc::events::{EventBus, SessionEvent};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(SessionEvent::ModerationWarning {
///     message: "Please unmute to answer".to_string(),
/// });
/// ```
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// With no active subscribers the event is dropped.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events
    ///
    /// A subscriber that falls more than the channel capacity behind gets a
    /// `Lagged` error and misses the overwritten events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(SessionEvent::ModerationAlert {
            message: "Language".to_string(),
        });

        assert!(matches!(rx1.recv().await.unwrap(), SessionEvent::ModerationAlert { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), SessionEvent::ModerationAlert { .. }));
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        bus.publish(SessionEvent::SessionEnded);
    }
}
