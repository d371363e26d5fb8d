//! Error taxonomy for pipeline construction and execution.
//!
//! `PipelineError` is `Clone`: a single step failure is recorded on a
//! completion handle and may be observed by a fan-in barrier, the terminal
//! consumer and the caller at the same time.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Result alias used across the engine.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors produced while building or running a pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    /// Adjacent stages (or a terminal) disagree on the type flowing between them.
    #[error("type mismatch: {expected} cannot be assigned from {found}")]
    TypeMismatch { expected: String, found: String },

    /// A step failed for one item. Displays the step's own message unchanged.
    #[error(transparent)]
    Step(#[from] StepFailure),

    /// Cancellation was observed at a suspension point.
    #[error("pipeline cancelled")]
    Cancelled,

    /// Single-value mode expected exactly one terminal result.
    #[error("expected exactly one result, pipeline produced {count}")]
    Arity { count: usize },

    /// The pipeline was disposed before it was invoked.
    #[error("pipeline has been disposed")]
    Disposed,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Storage(e.to_string())
    }
}

impl PipelineError {
    /// The step failure behind this error, if any.
    pub fn as_step_failure(&self) -> Option<&StepFailure> {
        match self {
            PipelineError::Step(failure) => Some(failure),
            _ => None,
        }
    }
}

/// A step's own error, shared so it can be reported to several observers.
///
/// `Display` is the message of the original error, so a step that fails with
/// `"foo"` surfaces as `"foo"` to the caller.
#[derive(Clone)]
pub struct StepFailure {
    inner: Arc<anyhow::Error>,
}

impl StepFailure {
    pub fn new(error: anyhow::Error) -> Self {
        Self {
            inner: Arc::new(error),
        }
    }

    /// Build a failure from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string payload>".to_string()
        };
        Self::new(anyhow::anyhow!("step panicked: {}", message))
    }

    /// The original error returned by the step.
    pub fn error(&self) -> &anyhow::Error {
        &self.inner
    }

    /// Downcast to the concrete error type the step returned.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.inner.downcast_ref::<E>()
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.inner, f)
    }
}

impl fmt::Debug for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

impl std::error::Error for StepFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}
