//! Step capability traits.
//!
//! A step is the user code behind a stage. Three shapes are supported:
//!
//! - [`Step`]: synchronous `In -> Out`
//! - [`AsyncStep`]: `In -> eventually Out`
//! - [`StreamStep`]: `In -> zero or more Out`, produced asynchronously
//!
//! Closures of the matching shape implement the traits directly. One step
//! instance is shared by every worker of its stage, so implementations must
//! tolerate concurrent calls when parallelism is above one.

use async_trait::async_trait;
use futures::StreamExt;
use futures::future::Future;
use futures::stream::{BoxStream, Stream};

/// Error type returned by steps. Reported to the caller unchanged.
pub type StepError = anyhow::Error;

pub type StepResult<T> = Result<T, StepError>;

/// Synchronous step. Runs on a dedicated worker thread, so blocking is allowed.
pub trait Step<In, Out>: Send + Sync + 'static {
    fn execute(&self, input: In) -> StepResult<Out>;

    /// Teardown capability, run once when the stage retires.
    fn as_dispose(&self) -> Option<&dyn Dispose> {
        None
    }
}

/// Asynchronous single-output step.
#[async_trait]
pub trait AsyncStep<In, Out>: Send + Sync + 'static
where
    In: Send + 'static,
{
    async fn execute(&self, input: In) -> StepResult<Out>;

    fn as_dispose(&self) -> Option<&dyn Dispose> {
        None
    }
}

/// Asynchronous multi-output step. The stream must be finite; it is consumed
/// to the end before the input counts as handled.
pub trait StreamStep<In, Out>: Send + Sync + 'static {
    fn execute(&self, input: In) -> BoxStream<'_, StepResult<Out>>;

    fn as_dispose(&self) -> Option<&dyn Dispose> {
        None
    }
}

/// Teardown for a step instance.
///
/// `dispose_async` runs first, then `dispose`. Both default to no-ops so an
/// implementation only provides the one it needs.
#[async_trait]
pub trait Dispose: Send + Sync {
    fn dispose(&self) {}

    async fn dispose_async(&self) -> StepResult<()> {
        Ok(())
    }
}

impl<F, In, Out> Step<In, Out> for F
where
    F: Fn(In) -> StepResult<Out> + Send + Sync + 'static,
{
    fn execute(&self, input: In) -> StepResult<Out> {
        self(input)
    }
}

#[async_trait]
impl<F, Fut, In, Out> AsyncStep<In, Out> for F
where
    F: Fn(In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepResult<Out>> + Send + 'static,
    In: Send + 'static,
{
    async fn execute(&self, input: In) -> StepResult<Out> {
        self(input).await
    }
}

impl<F, St, In, Out> StreamStep<In, Out> for F
where
    F: Fn(In) -> St + Send + Sync + 'static,
    St: Stream<Item = StepResult<Out>> + Send + 'static,
{
    fn execute(&self, input: In) -> BoxStream<'_, StepResult<Out>> {
        self(input).boxed()
    }
}
