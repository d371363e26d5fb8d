//! Pipeline builders.
//!
//! [`PipelineBuilder`] is the statically typed surface: every `add_*` call
//! changes the builder's output type, so an incompatible chain does not
//! compile. [`DynamicBuilder`] takes type-erased [`Stage`]s and checks each
//! link with [`TypeTag`]s instead. Both compile into the same topology.

use std::marker::PhantomData;

use futures::FutureExt;
use futures::future::Future;
use stagepipe_shared::errors::{PipelineError, PipelineResult};

use super::pipeline::{SinglePipeline, StreamPipeline, Topology};
use super::stage::{CleanupFn, Stage, TypeTag};
use super::step::{AsyncStep, Step, StepResult, StreamStep};
use crate::options::{PipelineConfig, StepOptions, TerminalOptions};

/// Ordered stages plus pipeline-level settings, shared by both builders.
#[derive(Default)]
pub(crate) struct Chain {
    stages: Vec<Stage>,
    after_completion: Vec<CleanupFn>,
    config: Option<PipelineConfig>,
}

impl Chain {
    fn push(&mut self, stage: Stage) -> PipelineResult<()> {
        if let Some(last) = self.stages.last() {
            stage.input.check_accepts(&last.output)?;
        }
        tracing::trace!(
            input = %stage.input,
            output = %stage.output,
            position = self.stages.len(),
            "Stage added"
        );
        self.stages.push(stage);
        Ok(())
    }

    fn last_mut(&mut self) -> Option<&mut Stage> {
        self.stages.last_mut()
    }

    fn after_completion<F, Fut>(&mut self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = StepResult<()>> + Send + 'static,
    {
        self.after_completion
            .push(Box::new(move || action().boxed()));
    }

    fn input_type(&self) -> Option<TypeTag> {
        self.stages.first().map(|stage| stage.input)
    }

    fn output_type(&self) -> Option<TypeTag> {
        self.stages.last().map(|stage| stage.output)
    }

    fn compile<In: 'static, Out: 'static>(
        mut self,
        options: TerminalOptions,
    ) -> PipelineResult<Topology> {
        let (Some(first), Some(last)) = (self.stages.first(), self.stages.last()) else {
            return Err(PipelineError::InvalidState(
                "a pipeline needs at least one stage".into(),
            ));
        };
        first.input.check_accepts(&TypeTag::of::<In>())?;
        TypeTag::of::<Out>().check_accepts(&last.output)?;

        if let Some(config) = self.config.take() {
            for stage in &mut self.stages {
                stage.options = config.resolve(stage.name.as_deref(), stage.options);
            }
        }

        Topology::build(self.stages, self.after_completion, options)
    }
}

/// Entry point of the typed builder.
///
/// ```ignore
/// let pipeline = PipelineBuilder::new()
///     .add_step(|s: String| Ok(s.chars().rev().collect::<String>()))
///     .add_step(|s: String| Ok((s.len(), s)))
///     .returns_single(TerminalOptions::default())?;
///
/// assert_eq!(pipeline.invoke("abc".into()).await?, (3, "cba".to_string()));
/// ```
#[derive(Default)]
pub struct PipelineBuilder {
    chain: Chain,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_step<S, In, Out>(self, step: S) -> StepBuilder<In, Out>
    where
        S: Step<In, Out>,
        In: Send + 'static,
        Out: Send + 'static,
    {
        self.first(Stage::value(step))
    }

    pub fn add_async_step<S, In, Out>(self, step: S) -> StepBuilder<In, Out>
    where
        S: AsyncStep<In, Out>,
        In: Send + 'static,
        Out: Send + 'static,
    {
        self.first(Stage::from_async(step))
    }

    pub fn add_stream_step<S, In, Out>(self, step: S) -> StepBuilder<In, Out>
    where
        S: StreamStep<In, Out>,
        In: Send + 'static,
        Out: Send + 'static,
    {
        self.first(Stage::stream(step))
    }

    /// Accept a whole collection as one input and feed its elements on
    /// individually.
    pub fn accept_collection<T: Send + 'static>(self) -> StepBuilder<Vec<T>, T> {
        self.first(Stage::collection::<T>())
    }

    /// Switch to the type-erased builder.
    pub fn dynamic(self) -> DynamicBuilder {
        DynamicBuilder { chain: self.chain }
    }

    fn first<In, Out>(mut self, stage: Stage) -> StepBuilder<In, Out> {
        self.chain.stages.push(stage);
        StepBuilder {
            chain: self.chain,
            _types: PhantomData,
        }
    }
}

/// Typed builder for a chain taking `In` and currently producing `Out`.
pub struct StepBuilder<In, Out> {
    chain: Chain,
    _types: PhantomData<fn(In) -> Out>,
}

impl<In, Out> StepBuilder<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub fn add_step<S, Next>(self, step: S) -> StepBuilder<In, Next>
    where
        S: Step<Out, Next>,
        Next: Send + 'static,
    {
        self.then(Stage::value(step))
    }

    pub fn add_async_step<S, Next>(self, step: S) -> StepBuilder<In, Next>
    where
        S: AsyncStep<Out, Next>,
        Next: Send + 'static,
    {
        self.then(Stage::from_async(step))
    }

    pub fn add_stream_step<S, Next>(self, step: S) -> StepBuilder<In, Next>
    where
        S: StreamStep<Out, Next>,
        Next: Send + 'static,
    {
        self.then(Stage::stream(step))
    }

    /// Options for the most recently added stage.
    pub fn with_options(mut self, options: StepOptions) -> Self {
        if let Some(stage) = self.chain.last_mut() {
            stage.options = options;
        }
        self
    }

    /// Name the most recently added stage.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        if let Some(stage) = self.chain.last_mut() {
            stage.name = Some(name.into());
        }
        self
    }

    /// Run `action` once after the last stage has retired.
    pub fn after_completion<F, Fut>(mut self, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = StepResult<()>> + Send + 'static,
    {
        self.chain.after_completion(action);
        self
    }

    /// Apply named per-stage options when the pipeline is built.
    pub fn configure(mut self, config: &PipelineConfig) -> Self {
        self.chain.config = Some(config.clone());
        self
    }

    pub fn returns_single(self, options: TerminalOptions) -> PipelineResult<SinglePipeline<In, Out>> {
        self.chain
            .compile::<In, Out>(options)
            .map(SinglePipeline::new)
    }

    pub fn returns_stream(self, options: TerminalOptions) -> PipelineResult<StreamPipeline<In, Out>> {
        self.chain
            .compile::<In, Out>(options)
            .map(StreamPipeline::new)
    }

    /// Continue with the type-erased builder.
    pub fn into_dynamic(self) -> DynamicBuilder {
        DynamicBuilder { chain: self.chain }
    }

    fn then<Next>(mut self, stage: Stage) -> StepBuilder<In, Next> {
        self.chain.stages.push(stage);
        StepBuilder {
            chain: self.chain,
            _types: PhantomData,
        }
    }
}

/// Builder over type-erased stages, checked link by link at runtime.
///
/// ```ignore
/// let pipeline = DynamicBuilder::new()
///     .add_stage(Stage::value(|s: String| Ok(s.len())))?
///     .add_stage(Stage::value(|n: usize| Ok(n * 2)))?
///     .returns_single::<String, usize>(TerminalOptions::default())?;
/// ```
#[derive(Default)]
pub struct DynamicBuilder {
    chain: Chain,
}

impl DynamicBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    ///
    /// # Errors
    ///
    /// `TypeMismatch` if the stage cannot consume the previous stage's output.
    pub fn add_stage(mut self, stage: Stage) -> PipelineResult<Self> {
        self.chain.push(stage)?;
        Ok(self)
    }

    /// Insert the `Vec<T>` entry adapter. Only valid as the first stage.
    pub fn accept_collection<T: Send + 'static>(self) -> PipelineResult<Self> {
        if !self.chain.stages.is_empty() {
            return Err(PipelineError::InvalidState(
                "accept_collection must be the first stage".into(),
            ));
        }
        self.add_stage(Stage::collection::<T>())
    }

    pub fn after_completion<F, Fut>(mut self, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = StepResult<()>> + Send + 'static,
    {
        self.chain.after_completion(action);
        self
    }

    pub fn configure(mut self, config: &PipelineConfig) -> Self {
        self.chain.config = Some(config.clone());
        self
    }

    pub fn len(&self) -> usize {
        self.chain.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.stages.is_empty()
    }

    /// Input type of the first stage.
    pub fn input_type(&self) -> Option<TypeTag> {
        self.chain.input_type()
    }

    /// Output type of the last stage.
    pub fn output_type(&self) -> Option<TypeTag> {
        self.chain.output_type()
    }

    pub fn returns_single<In, Out>(
        self,
        options: TerminalOptions,
    ) -> PipelineResult<SinglePipeline<In, Out>>
    where
        In: Send + 'static,
        Out: Send + 'static,
    {
        self.chain
            .compile::<In, Out>(options)
            .map(SinglePipeline::new)
    }

    pub fn returns_stream<In, Out>(
        self,
        options: TerminalOptions,
    ) -> PipelineResult<StreamPipeline<In, Out>>
    where
        In: Send + 'static,
        Out: Send + 'static,
    {
        self.chain
            .compile::<In, Out>(options)
            .map(StreamPipeline::new)
    }
}
