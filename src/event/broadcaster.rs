use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

pub type SubscriberId = u64;

struct Subscriber<T> {
    id: SubscriberId,
    sender: Sender<T>,
}

/// Broadcast channel with a bounded queue per subscriber.
///
/// A subscriber that cannot keep up is dropped instead of blocking the
/// publisher: `broadcast` returns the ids of the subscribers removed because
/// their queue was full, so the caller can signal the lag explicitly.
/// Disconnected subscribers are removed silently.
pub struct BoundedBroadcast<T> {
    subscribers: Arc<Mutex<Vec<Subscriber<T>>>>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl<T> Clone for BoundedBroadcast<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: self.subscribers.clone(),
            next_id: self.next_id.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> Default for BoundedBroadcast<T> {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl<T> BoundedBroadcast<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            capacity,
        }
    }

    /// Registers a new subscriber and returns its id together with the
    /// receiving end of its queue.
    pub fn subscribe(&self) -> (SubscriberId, Receiver<T>) {
        let (tx, rx) = bounded(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.subscribers
            .lock()
            .expect("failed to acquire the lock")
            .push(Subscriber { id, sender: tx });

        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers
            .lock()
            .expect("failed to acquire the lock")
            .retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("failed to acquire the lock")
            .len()
    }
}

impl<T> BoundedBroadcast<T>
where
    T: Clone,
{
    /// Sends `message` to every registered subscriber without blocking.
    /// Returns the ids of subscribers dropped because their queue was full.
    pub fn broadcast(&self, message: T) -> Vec<SubscriberId> {
        let mut lagged = Vec::new();
        self.subscribers
            .lock()
            .expect("failed to acquire the lock")
            .retain(|s| match s.sender.try_send(message.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    lagged.push(s.id);
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
        lagged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_sub() {
        let broadcaster = BoundedBroadcast::new(4);

        let (_, subs1) = broadcaster.subscribe();
        let (_, subs2) = broadcaster.subscribe();

        let message = "message";
        assert!(broadcaster.broadcast(message).is_empty());

        assert!(subs1.recv().unwrap().eq(message));
        assert!(subs2.recv().unwrap().eq(message));
    }

    #[test]
    fn test_subscriber_drops() {
        let broadcaster = BoundedBroadcast::new(4);

        let (_, subs1) = broadcaster.subscribe();
        let (_, subs2) = broadcaster.subscribe();

        drop(subs2);

        let message = "message";
        assert!(broadcaster.broadcast(message).is_empty());
        assert_eq!(broadcaster.subscriber_count(), 1);

        assert!(subs1.recv().unwrap().eq(message));
    }

    #[test]
    fn test_slow_subscriber_is_dropped_with_signal() {
        let broadcaster = BoundedBroadcast::new(1);

        let (slow_id, _slow) = broadcaster.subscribe();
        let (_, fast) = broadcaster.subscribe();

        assert!(broadcaster.broadcast("first").is_empty());
        // the slow subscriber never drains its queue of capacity 1
        assert_eq!(broadcaster.broadcast("second"), vec![slow_id]);
        assert_eq!(broadcaster.subscriber_count(), 1);

        assert_eq!(fast.recv().unwrap(), "first");
        assert_eq!(fast.recv().unwrap(), "second");
    }

    #[test]
    fn test_unsubscribe() {
        let broadcaster = BoundedBroadcast::<&str>::new(4);

        let (id, _rx) = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);

        broadcaster.unsubscribe(id);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}
