use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};

use super::message::Message;

struct QueuedMessage {
    message: Message,
    seq: u64,
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.message.priority == other.message.priority && self.seq == other.seq
    }
}

impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: higher priority first, then earlier enqueue sequence
        (self.message.priority, Reverse(self.seq))
            .cmp(&(other.message.priority, Reverse(other.seq)))
    }
}

struct QueueState {
    heap: BinaryHeap<QueuedMessage>,
    next_seq: u64,
    closed: bool,
}

/// Priority queue keyed by `(priority, enqueue sequence)`: higher priority
/// first, FIFO within a priority. Capacity is enforced by the broker across
/// all of its queues.
pub struct DeliveryQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// False when the queue is already closed.
    pub fn push(&self, message: Message) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(QueuedMessage { message, seq });
        self.cond.notify_one();
        true
    }

    /// Blocks until a message is available. Returns `None` once the queue is
    /// closed and drained.
    pub fn pop(&self) -> Option<Message> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(queued) = state.heap.pop() {
                return Some(queued.message);
            }
            if state.closed {
                return None;
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting messages and wakes blocked consumers; already queued
    /// messages are still drained.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.cond.notify_all();
    }
}
