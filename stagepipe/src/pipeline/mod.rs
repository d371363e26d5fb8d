//! Typed multi-stage pipeline engine.
//!
//! ## Architecture
//!
//! ```text
//! Builder → Stages → Runners → Terminal
//!
//! - Builder: type-checked chain of stages (typed or dynamic)
//! - Stage: a step normalized to "one input, zero or more outputs"
//! - Runner: dedicated worker threads per stage, linked by bounded queues
//! - Terminal: single-value or streaming consumer of the final queue
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use stagepipe::pipeline::PipelineBuilder;
//! use stagepipe::options::{StepOptions, TerminalOptions};
//!
//! let pipeline = PipelineBuilder::new()
//!     .add_step(|s: String| Ok(s.to_uppercase()))
//!     .add_async_step(|s: String| async move { Ok(s.len()) })
//!     .with_options(StepOptions::with_parallelism(4))
//!     .returns_stream(TerminalOptions::default())?;
//!
//! let mut lengths = pipeline.invoke_all(words).await?;
//! while let Some(len) = lengths.next().await {
//!     println!("{}", len?);
//! }
//! ```

mod builder;
mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod runner;
mod stage;
mod step;

pub use builder::{DynamicBuilder, PipelineBuilder, StepBuilder};
pub use metrics::{PipelineMetrics, StageMetrics};
pub use pipeline::{SinglePipeline, StreamPipeline};
pub use stage::{Stage, TypeTag};
pub use step::{AsyncStep, Dispose, Step, StepError, StepResult, StreamStep};
