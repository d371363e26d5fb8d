//! stagepipe: a typed, multi-stage pipeline engine.
//!
//! Stages are chained with a builder, each stage runs on its own dedicated
//! worker threads, and stages hand work to each other through bounded
//! queues. Every input carries a completion handle, so errors stay attached
//! to the item that caused them even when a stage fans one input out into
//! many outputs.

pub mod file_ref;
pub mod logging;
pub mod options;
pub mod pipeline;
pub mod queue;
pub mod work;

pub use file_ref::{FileReference, LocalFile};
pub use options::{PipelineConfig, StepOptions, TerminalOptions};
pub use pipeline::{
    AsyncStep, Dispose, DynamicBuilder, PipelineBuilder, PipelineMetrics, SinglePipeline, Stage,
    StageMetrics, Step, StepBuilder, StepError, StepResult, StreamPipeline, StreamStep, TypeTag,
};
pub use queue::BoundedQueue;
pub use stagepipe_shared::errors::{PipelineError, PipelineResult, StepFailure};
pub use tokio_util::sync::CancellationToken;
pub use work::{AnyValue, CompletionHandle};
