//! Type-erased stage definition.
//!
//! Every step shape is normalized to the same function:
//!
//! ```text
//! AnyValue ──→ StageFn ──→ stream of PipelineResult<AnyValue>   (0..n items)
//! ```
//!
//! A stage also records the [`TypeTag`]s of its input and output so the
//! dynamic builder can validate a chain without knowing the concrete types.

use std::any::{TypeId, type_name};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use stagepipe_shared::errors::{PipelineError, PipelineResult, StepFailure};

use super::step::{AsyncStep, Dispose, Step, StepError, StepResult, StreamStep};
use crate::options::StepOptions;
use crate::work::{AnyValue, downcast_value, erase};

/// Normalized output of one stage invocation.
pub(crate) type StageOutput = BoxStream<'static, PipelineResult<AnyValue>>;

/// Normalized stage function.
pub(crate) type StageFn = Arc<dyn Fn(AnyValue) -> StageOutput + Send + Sync>;

/// Deferred teardown action.
pub(crate) type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, StepResult<()>> + Send>;

/// Runtime identity of a type flowing between stages.
#[derive(Clone, Copy)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether this tag is the catch-all [`AnyValue`].
    pub fn is_any(&self) -> bool {
        self.id == TypeId::of::<AnyValue>()
    }

    /// Whether a stage taking `self` can consume values of type `produced`.
    ///
    /// Exact type equality, except that `AnyValue` accepts every type.
    pub fn accepts(&self, produced: &TypeTag) -> bool {
        self.id == produced.id || self.is_any()
    }

    pub(crate) fn check_accepts(&self, produced: &TypeTag) -> PipelineResult<()> {
        if self.accepts(produced) {
            Ok(())
        } else {
            Err(PipelineError::TypeMismatch {
                expected: self.name.to_string(),
                found: produced.name.to_string(),
            })
        }
    }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeTag {}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// One stage of a pipeline: a normalized step plus its options.
///
/// # Example
///
/// ```ignore
/// let stage = Stage::value(|s: String| Ok(s.len()))
///     .named("length")
///     .with_options(StepOptions::new(4, 32));
/// ```
pub struct Stage {
    pub(crate) name: Option<String>,
    pub(crate) input: TypeTag,
    pub(crate) output: TypeTag,
    pub(crate) options: StepOptions,
    pub(crate) func: StageFn,
    pub(crate) cleanup: Option<CleanupFn>,
}

impl Stage {
    /// Stage from a synchronous step.
    pub fn value<S, In, Out>(step: S) -> Self
    where
        S: Step<In, Out>,
        In: Send + 'static,
        Out: Send + 'static,
    {
        let step = Arc::new(step);
        let cleanup = cleanup_for(Arc::clone(&step), <S as Step<In, Out>>::as_dispose);
        let func: StageFn = Arc::new(move |value: AnyValue| -> StageOutput {
            let result = take_input::<In>(value)
                .and_then(|input| step.execute(input).map(erase).map_err(step_failure));
            stream::once(async move { result }).boxed()
        });
        Self::assemble::<In, Out>(func, cleanup)
    }

    /// Stage from an asynchronous single-output step.
    pub fn from_async<S, In, Out>(step: S) -> Self
    where
        S: AsyncStep<In, Out>,
        In: Send + 'static,
        Out: Send + 'static,
    {
        let step = Arc::new(step);
        let cleanup = cleanup_for(Arc::clone(&step), <S as AsyncStep<In, Out>>::as_dispose);
        let func: StageFn = Arc::new(move |value: AnyValue| -> StageOutput {
            let step = Arc::clone(&step);
            stream::once(async move {
                let input = take_input::<In>(value)?;
                step.execute(input).await.map(erase).map_err(step_failure)
            })
            .boxed()
        });
        Self::assemble::<In, Out>(func, cleanup)
    }

    /// Stage from an asynchronous multi-output step.
    pub fn stream<S, In, Out>(step: S) -> Self
    where
        S: StreamStep<In, Out>,
        In: Send + 'static,
        Out: Send + 'static,
    {
        let step = Arc::new(step);
        let cleanup = cleanup_for(Arc::clone(&step), <S as StreamStep<In, Out>>::as_dispose);
        let func: StageFn = Arc::new(move |value: AnyValue| -> StageOutput {
            let step = Arc::clone(&step);
            match take_input::<In>(value) {
                Ok(input) => async_stream::stream! {
                    let mut outputs = step.execute(input);
                    while let Some(output) = outputs.next().await {
                        yield output.map(erase).map_err(step_failure);
                    }
                }
                .boxed(),
                Err(e) => stream::once(async move { Err(e) }).boxed(),
            }
        });
        Self::assemble::<In, Out>(func, cleanup)
    }

    /// Entry adapter turning one `Vec<T>` into one output per element.
    pub fn collection<T: Send + 'static>() -> Self {
        Self::stream::<_, Vec<T>, T>(|items: Vec<T>| {
            stream::iter(items.into_iter().map(Ok::<T, StepError>))
        })
        .named("accept_collection")
    }

    /// Set a name used in logs, metrics and configuration lookups.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_options(mut self, options: StepOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn options(&self) -> StepOptions {
        self.options
    }

    pub fn input_type(&self) -> TypeTag {
        self.input
    }

    pub fn output_type(&self) -> TypeTag {
        self.output
    }

    /// Whether the step registered a teardown action.
    pub fn has_cleanup(&self) -> bool {
        self.cleanup.is_some()
    }

    fn assemble<In: 'static, Out: 'static>(func: StageFn, cleanup: Option<CleanupFn>) -> Self {
        Self {
            name: None,
            input: TypeTag::of::<In>(),
            output: TypeTag::of::<Out>(),
            options: StepOptions::default(),
            func,
            cleanup,
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("options", &self.options)
            .field("cleanup", &self.cleanup.is_some())
            .finish()
    }
}

/// Teardown action that runs at most once, whoever asks first.
pub(crate) struct Cleanup {
    name: String,
    action: Mutex<Option<CleanupFn>>,
}

impl Cleanup {
    pub fn new(name: impl Into<String>, action: CleanupFn) -> Self {
        Self {
            name: name.into(),
            action: Mutex::new(Some(action)),
        }
    }

    /// Run the action if nobody has yet. Failures and panics are logged, not
    /// propagated: teardown of one step must not block teardown of the rest.
    pub async fn run(&self) -> bool {
        let Some(action) = self.action.lock().take() else {
            return false;
        };

        tracing::debug!(stage = %self.name, "Disposing step");
        match AssertUnwindSafe(action()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(stage = %self.name, error = %e, "Step disposal failed"),
            Err(payload) => {
                let failure = StepFailure::from_panic(payload);
                tracing::warn!(stage = %self.name, error = %failure, "Step disposal panicked");
            }
        }
        true
    }
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cleanup")
            .field("name", &self.name)
            .field("pending", &self.action.lock().is_some())
            .finish()
    }
}

fn cleanup_for<S>(step: Arc<S>, probe: fn(&S) -> Option<&dyn Dispose>) -> Option<CleanupFn>
where
    S: Send + Sync + 'static,
{
    probe(&step)?;
    Some(Box::new(move || {
        async move {
            if let Some(disposable) = probe(&step) {
                disposable.dispose_async().await?;
                disposable.dispose();
            }
            Ok(())
        }
        .boxed()
    }))
}

fn take_input<In: 'static>(value: AnyValue) -> PipelineResult<In> {
    downcast_value::<In>(value).map_err(|_| PipelineError::TypeMismatch {
        expected: type_name::<In>().to_string(),
        found: "a value of another type".to_string(),
    })
}

fn step_failure(error: StepError) -> PipelineError {
    PipelineError::Step(StepFailure::new(error))
}
