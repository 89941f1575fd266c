//! A coalescing work queue.
//!
//! At most one pending entry exists per key. A key added again while it is
//! being processed is queued once more when the worker calls
//! [`WorkQueue::done`], so the same key is never handed out twice at the same
//! time and every burst of additions ends in a pass over the latest state.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

/// Multi-producer work queue that deduplicates pending keys.
pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash,
{
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `item` as needing processing. Never blocks.
    ///
    /// Does nothing if `item` is already pending or the queue is shut down.
    pub fn add(&self, item: T) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if state.shutting_down || !state.dirty.insert(item.clone()) {
            return;
        }

        if state.processing.contains(&item) {
            return;
        }

        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// Waits for the next item.
    ///
    /// Returns `None` once the queue has been shut down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }

                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Marks `item` as processed, requeueing it if it was added meanwhile.
    pub fn done(&self, item: &T) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        state.processing.remove(item);

        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stops accepting items and wakes every waiting consumer.
    pub fn shut_down(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Returns `true` once [`WorkQueue::shut_down`] has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutting_down
    }

    /// Number of items waiting to be handed out.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queue
            .len()
    }

    /// Returns `true` if no item is waiting to be handed out.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
