//! Stage and pipeline configuration.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use stagepipe_shared::errors::{PipelineError, PipelineResult};
use tokio_util::sync::CancellationToken;

fn default_parallelism() -> usize {
    1
}

fn default_buffer_capacity() -> usize {
    10
}

/// Per-stage tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOptions {
    /// Dedicated worker threads for the stage.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Capacity of the queue feeding the stage.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

impl StepOptions {
    pub fn new(parallelism: usize, buffer_capacity: usize) -> Self {
        Self {
            parallelism,
            buffer_capacity,
        }
    }

    pub fn with_parallelism(parallelism: usize) -> Self {
        Self {
            parallelism,
            ..Self::default()
        }
    }

    /// Reject values no worker pool can honour.
    pub fn sanitize(&self) -> PipelineResult<()> {
        if self.parallelism == 0 {
            return Err(PipelineError::Config(
                "parallelism must be at least 1".into(),
            ));
        }
        if self.buffer_capacity == 0 {
            return Err(PipelineError::Config(
                "buffer_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            buffer_capacity: default_buffer_capacity(),
        }
    }
}

/// Pipeline-wide configuration, usually loaded from JSON:
///
/// ```json
/// {
///   "defaults": { "parallelism": 2 },
///   "stages": { "parse": { "parallelism": 8, "buffer_capacity": 64 } }
/// }
/// ```
///
/// `defaults` replaces the options of stages that kept the built-in default;
/// an entry under `stages` replaces the options of the stage with that name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub defaults: Option<StepOptions>,

    #[serde(default)]
    pub stages: HashMap<String, StepOptions>,
}

impl PipelineConfig {
    pub fn from_json(text: &str) -> PipelineResult<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| PipelineError::Config(format!("invalid pipeline config: {e}")))?;
        config.sanitize()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    pub fn sanitize(&self) -> PipelineResult<()> {
        if let Some(defaults) = &self.defaults {
            defaults.sanitize()?;
        }
        for (name, options) in &self.stages {
            options.sanitize().map_err(|e| match e {
                PipelineError::Config(msg) => PipelineError::Config(format!("stage '{name}': {msg}")),
                other => other,
            })?;
        }
        Ok(())
    }

    /// Options for a stage given its name and current options.
    pub(crate) fn resolve(&self, name: Option<&str>, current: StepOptions) -> StepOptions {
        if let Some(options) = name.and_then(|n| self.stages.get(n)) {
            return *options;
        }
        match self.defaults {
            Some(defaults) if current == StepOptions::default() => defaults,
            _ => current,
        }
    }
}

/// How a built pipeline is driven by its terminal.
#[derive(Debug, Clone)]
pub struct TerminalOptions {
    /// Cancels queue waits, worker loops and the terminal reader.
    pub cancel: CancellationToken,

    /// Dispose each stage as soon as its input is drained. When `false` the
    /// caller owns teardown through `dispose()`.
    pub auto_dispose: bool,
}

impl TerminalOptions {
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }

    pub fn manual_dispose(mut self) -> Self {
        self.auto_dispose = false;
        self
    }
}

impl Default for TerminalOptions {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            auto_dispose: true,
        }
    }
}
