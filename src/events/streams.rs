use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Generic event stream for reactive event handling
///
/// Every subscriber sees events in publish order, starting with the first
/// event published after it subscribed.
pub struct EventStream<T: Clone + Send + 'static> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> EventStream<T> {
    /// Create a new event stream with specified capacity
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "Creating new event stream");
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> Subscriber<T> {
        trace!("New subscriber registered to event stream");
        Subscriber {
            receiver: self.sender.subscribe(),
        }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of subscribers that received it. Having no
    /// subscribers is not an error.
    pub fn publish(&self, event: T) -> usize {
        let delivered = self.sender.send(event).unwrap_or(0);
        trace!(receivers = delivered, "Event published");
        delivered
    }
}

/// Subscriber for receiving events from a stream
pub struct Subscriber<T: Clone + Send + 'static> {
    receiver: broadcast::Receiver<T>,
}

impl<T: Clone + Send + 'static> Subscriber<T> {
    /// Receive the next event
    pub async fn recv(&mut self) -> Result<T, broadcast::error::RecvError> {
        self.receiver.recv().await
    }
}

impl<T: Clone + Send + 'static> Clone for EventStream<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_publish_order() {
        let stream = EventStream::new(16);
        let mut first = stream.subscribe();
        let mut second = stream.subscribe();

        for i in 0..3u32 {
            assert_eq!(stream.publish(i), 2);
        }

        for expected in 0..3u32 {
            assert_eq!(first.recv().await.unwrap(), expected);
            assert_eq!(second.recv().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_starts_at_next_event() {
        let stream = EventStream::new(16);
        assert_eq!(stream.publish(1u32), 0);

        let mut late = stream.subscribe();
        stream.publish(2);
        assert_eq!(late.recv().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_told_it_lagged() {
        let stream = EventStream::new(2);
        let mut slow = stream.subscribe();
        for i in 0..5u32 {
            stream.publish(i);
        }

        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(slow.recv().await.unwrap(), 3);
    }
}
