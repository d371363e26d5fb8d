//! Bounded multi-producer/multi-consumer hand-off between stages.
//!
//! ## Wakeups
//!
//! Every waiter registers interest on a [`Notify`] *before* inspecting the
//! queue state, and every mutation happens under the same lock the waiter
//! inspects. A notification sent between the inspection and the await is
//! therefore never lost:
//!
//! ```text
//! waiter:   enable(notified) -> lock -> empty? -> unlock -> await notified
//! producer:                     lock -> push   -> unlock -> notify_one
//! ```
//!
//! `complete_adding` wakes every registered waiter so consumers observe the
//! terminal "no more items" state and producers observe the closed queue.

use std::collections::VecDeque;

use parking_lot::Mutex;
use stagepipe_shared::errors::{PipelineError, PipelineResult};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Capacity-limited queue connecting two stages.
///
/// Async waits never hold an OS thread; `try_take` serves synchronous
/// consumers that only want what is already there.
pub struct BoundedQueue<T> {
    capacity: Option<usize>,
    state: Mutex<QueueState<T>>,
    not_empty: Notify,
    not_full: Notify,
}

struct QueueState<T> {
    items: VecDeque<T>,
    adding_completed: bool,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity: Some(capacity),
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                adding_completed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Create a queue without a capacity limit. `add` never suspends.
    pub fn unbounded() -> Self {
        Self {
            capacity: None,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                adding_completed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the producer side has called [`complete_adding`](Self::complete_adding).
    pub fn is_adding_completed(&self) -> bool {
        self.state.lock().adding_completed
    }

    /// True once adding is complete **and** every item has been taken.
    pub fn is_completed(&self) -> bool {
        let state = self.state.lock();
        state.adding_completed && state.items.is_empty()
    }

    /// Add an item, suspending while the queue is at capacity.
    ///
    /// # Errors
    ///
    /// - `Cancelled` if `cancel` fires while waiting for room
    /// - `InvalidState` if adding has already been completed
    pub async fn add(&self, item: T, cancel: &CancellationToken) -> PipelineResult<()> {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                // Checked under the lock so a consumer draining after
                // cancellation cannot miss an item pushed concurrently.
                if cancel.is_cancelled() {
                    return Err(PipelineError::Cancelled);
                }
                if state.adding_completed {
                    return Err(PipelineError::InvalidState(
                        "cannot add to a queue after complete_adding".into(),
                    ));
                }
                if self.has_room(&state) {
                    state.items.push_back(item);
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// Take an item if one is immediately available.
    pub fn try_take(&self) -> Option<T> {
        let item = self.state.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Take the next item, suspending while the queue is empty.
    ///
    /// Returns `Ok(None)` once the queue is completed and drained; every later
    /// call returns `Ok(None)` immediately.
    pub async fn take(&self, cancel: &CancellationToken) -> PipelineResult<Option<T>> {
        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.not_full.notify_one();
                    return Ok(Some(item));
                }
                if state.adding_completed {
                    return Ok(None);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// Signal that no more items will be added.
    ///
    /// Returns `false` if adding was already complete.
    pub fn complete_adding(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.adding_completed {
                return false;
            }
            state.adding_completed = true;
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
        true
    }

    fn has_room(&self, state: &QueueState<T>) -> bool {
        match self.capacity {
            Some(capacity) => state.items.len() < capacity,
            None => true,
        }
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity)
            .field("len", &state.items.len())
            .field("adding_completed", &state.adding_completed)
            .finish()
    }
}
