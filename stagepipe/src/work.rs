//! Work items and completion correlation.
//!
//! A [`CompletionHandle`] follows one submitted input through the pipeline.
//! For 1:1 stages the handle is passed along unchanged. When a stage emits
//! zero or several outputs, each child gets a fresh handle owned by a
//! [`FanIn`] barrier, and the barrier settles the parent's handle once every
//! child has settled:
//!
//! ```text
//!             ┌─ child h1 ─┐
//! parent h ───┼─ child h2 ─┼──→ FanIn(pending = 0) ──→ settle(h)
//!             └─ child h3 ─┘
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use stagepipe_shared::errors::{PipelineError, PipelineResult};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Type-erased value travelling between stages.
pub type AnyValue = Box<dyn Any + Send>;

/// How one item's journey ended.
pub type Outcome = PipelineResult<()>;

/// Erase a typed value. An `AnyValue` is passed through without re-boxing.
pub(crate) fn erase<T: Send + 'static>(value: T) -> AnyValue {
    let boxed: AnyValue = Box::new(value);
    match boxed.downcast::<AnyValue>() {
        Ok(inner) => *inner,
        Err(boxed) => boxed,
    }
}

/// Recover a typed value. Asking for `AnyValue` hands back the erased value.
pub(crate) fn downcast_value<T: 'static>(value: AnyValue) -> Result<T, AnyValue> {
    if std::any::TypeId::of::<T>() == std::any::TypeId::of::<AnyValue>() {
        let wrapped: AnyValue = Box::new(value);
        return wrapped.downcast::<T>().map(|v| *v);
    }
    value.downcast::<T>().map(|v| *v)
}

/// Unit flowing through the queues.
pub(crate) struct WorkItem {
    /// `None` marks a dead branch: the item failed upstream and only its
    /// settled handle travels on so later stages still see the traffic.
    pub value: Option<AnyValue>,
    pub index: u64,
    pub completion: CompletionHandle,
}

impl WorkItem {
    pub fn new(value: AnyValue, index: u64, completion: CompletionHandle) -> Self {
        Self {
            value: Some(value),
            index,
            completion,
        }
    }

    pub fn dead(index: u64, completion: CompletionHandle) -> Self {
        Self {
            value: None,
            index,
            completion,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.value.is_none() || self.completion.is_settled()
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("index", &self.index)
            .field("dead", &self.value.is_none())
            .field("settled", &self.completion.is_settled())
            .finish()
    }
}

/// Single-assignment completion shared by everything correlated with one input.
#[derive(Clone)]
pub struct CompletionHandle {
    inner: Arc<CompletionInner>,
}

struct CompletionInner {
    outcome: Mutex<Option<Outcome>>,
    settled: Notify,
    parent: Option<Arc<FanIn>>,
}

impl CompletionHandle {
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<Arc<FanIn>>) -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                outcome: Mutex::new(None),
                settled: Notify::new(),
                parent,
            }),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.inner.outcome.lock().is_some()
    }

    /// The outcome, if already settled.
    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.outcome.lock().clone()
    }

    /// Whether two handles refer to the same completion.
    pub fn same_as(&self, other: &CompletionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Settle a handle the caller owns exclusively. Returns `false` (and
    /// leaves the first outcome in place) if it was already settled, which is
    /// a bug in the caller.
    pub fn settle(&self, outcome: Outcome) -> bool {
        if !self.store(outcome) {
            tracing::error!("completion handle settled twice");
            debug_assert!(false, "completion handle settled twice");
            return false;
        }
        true
    }

    /// Settle unless something else already did. Every engine path uses
    /// this, since a cancelled caller may settle its root at any time.
    pub(crate) fn settle_if_pending(&self, outcome: Outcome) -> bool {
        self.store(outcome)
    }

    fn store(&self, outcome: Outcome) -> bool {
        {
            let mut slot = self.inner.outcome.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome.clone());
        }
        self.inner.settled.notify_waiters();
        if let Some(parent) = &self.inner.parent {
            parent.child_settled(&outcome);
        }
        true
    }

    /// Wait for the handle to settle.
    pub async fn wait(&self, cancel: &CancellationToken) -> PipelineResult<Outcome> {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.outcome() {
                return Ok(outcome);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }
}

impl Default for CompletionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("outcome", &self.outcome())
            .finish()
    }
}

/// Reference-counted barrier settling a parent handle once all children settle.
///
/// The barrier starts with one reference held by the producing stage while it
/// is still emitting children; [`FanIn::seal`] drops it. A failure recorded
/// before the count reaches zero becomes the parent's outcome; the first one
/// wins and later ones are only logged.
pub(crate) struct FanIn {
    parent: CompletionHandle,
    pending: AtomicUsize,
    first_failure: Mutex<Option<PipelineError>>,
}

impl FanIn {
    pub fn new(parent: CompletionHandle) -> Arc<Self> {
        Arc::new(Self {
            parent,
            pending: AtomicUsize::new(1),
            first_failure: Mutex::new(None),
        })
    }

    /// Register a new child and return its handle.
    pub fn child(self: &Arc<Self>) -> CompletionHandle {
        self.pending.fetch_add(1, Ordering::AcqRel);
        CompletionHandle::with_parent(Some(Arc::clone(self)))
    }

    /// Release the producer's reference.
    pub fn seal(&self) {
        self.release();
    }

    fn child_settled(&self, outcome: &Outcome) {
        if let Err(e) = outcome {
            self.note_failure(e);
        }
        self.release();
    }

    fn note_failure(&self, error: &PipelineError) {
        let mut first = self.first_failure.lock();
        if first.is_none() {
            *first = Some(error.clone());
        } else {
            tracing::debug!(error = %error, "additional fan-out failure ignored, first failure wins");
        }
    }

    fn release(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let outcome = match self.first_failure.lock().take() {
                Some(error) => Err(error),
                None => Ok(()),
            };
            self.parent.settle_if_pending(outcome);
        }
    }
}
