//! Types shared between the stagepipe engine and the steps plugged into it.

pub mod errors;

pub use errors::{PipelineError, PipelineResult, StepFailure};
