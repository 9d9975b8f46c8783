//! Keyed work queue.
//!
//! Keys are policy names. Distinct keys run in parallel on different
//! workers; identical keys serialize: a key enqueued while it is being
//! worked is remembered and handed out again once the in-flight pass
//! finishes, so the next pass always sees the newest revision.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<String>,
    queued: HashSet<String>,
    running: HashSet<String>,
    rerun: HashSet<String>,
}

/// A work queue that serializes per key.
#[derive(Default)]
pub struct KeyedQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl KeyedQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key. Duplicates of a waiting key collapse; a key currently
    /// running is re-queued when its pass completes.
    pub fn enqueue(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.running.contains(&key) {
            state.rerun.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.ready.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Wait for the next key and mark it running.
    pub async fn next(&self) -> String {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("queue lock poisoned");
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.running.insert(key.clone());
                    let more = !state.ready.is_empty();
                    drop(state);
                    if more {
                        // Wake a sibling worker for the remaining keys.
                        self.notify.notify_one();
                    }
                    return key;
                }
            }
            notified.await;
        }
    }

    /// Mark a key's pass complete, re-queueing it if it was enqueued
    /// while running.
    pub fn done(&self, key: &str) {
        let rerun = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            state.running.remove(key);
            state.rerun.remove(key)
        };
        if rerun {
            self.enqueue(key.to_string());
        }
    }

    /// Number of keys waiting (not counting running ones).
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_waiting_keys_collapse() {
        let queue = KeyedQueue::new();
        queue.enqueue("a");
        queue.enqueue("a");
        queue.enqueue("b");
        assert_eq!(queue.waiting(), 2);
    }

    #[tokio::test]
    async fn test_running_key_is_requeued_on_done() {
        let queue = KeyedQueue::new();
        queue.enqueue("a");
        let key = queue.next().await;
        assert_eq!(key, "a");

        // Enqueued while running: not handed out again yet.
        queue.enqueue("a");
        assert_eq!(queue.waiting(), 0);

        queue.done("a");
        assert_eq!(queue.waiting(), 1);
        assert_eq!(queue.next().await, "a");
    }

    #[tokio::test]
    async fn test_distinct_keys_hand_out_in_order() {
        let queue = KeyedQueue::new();
        queue.enqueue("a");
        queue.enqueue("b");
        assert_eq!(queue.next().await, "a");
        assert_eq!(queue.next().await, "b");
    }

    #[tokio::test]
    async fn test_next_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(KeyedQueue::new());
        let waiter = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue.enqueue("late");
        assert_eq!(waiter.await.unwrap(), "late");
    }
}
