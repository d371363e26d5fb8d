//! Built pipelines and their terminals.
//!
//! A [`Topology`] is the running form of a chain: N stages over N+1 queues.
//! Queue *i* feeds stage *i* with that stage's buffer capacity; the final
//! queue is unbounded so submission always completes before the terminal
//! starts reading.
//!
//! ```text
//! invoke ─→ [q0] ─→ stage 0 ─→ [q1] ─→ … ─→ stage n-1 ─→ [qn, unbounded] ─→ terminal
//! ```
//!
//! Topologies are one-shot: the first `invoke` owns them.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::StreamExt;
use futures::stream::BoxStream;
use stagepipe_shared::errors::{PipelineError, PipelineResult};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use super::metrics::PipelineMetrics;
use super::runner::{ItemQueue, RunnerConfig, StageRunner};
use super::stage::{Cleanup, CleanupFn, Stage};
use crate::options::TerminalOptions;
use crate::work::{CompletionHandle, WorkItem, downcast_value, erase};

pub(crate) struct Topology {
    id: Ulid,
    entry: Arc<ItemQueue>,
    exit: Arc<ItemQueue>,
    runners: Vec<Arc<StageRunner>>,
    after_completion: Vec<Arc<Cleanup>>,
    cancel: CancellationToken,
    sequence: Arc<AtomicU64>,
    invoked: AtomicBool,
    disposed: AtomicBool,
}

impl Topology {
    pub fn build(
        stages: Vec<Stage>,
        after_completion: Vec<CleanupFn>,
        options: TerminalOptions,
    ) -> PipelineResult<Self> {
        for stage in &stages {
            stage.options.sanitize()?;
        }

        let id = Ulid::new();
        let cancel = options.cancel.child_token();
        let sequence = Arc::new(AtomicU64::new(0));
        let after_completion: Vec<Arc<Cleanup>> = after_completion
            .into_iter()
            .enumerate()
            .map(|(n, action)| Arc::new(Cleanup::new(format!("after_completion-{n}"), action)))
            .collect();

        let mut queues: Vec<Arc<ItemQueue>> = stages
            .iter()
            .map(|stage| Arc::new(ItemQueue::new(stage.options.buffer_capacity)))
            .collect();
        queues.push(Arc::new(ItemQueue::unbounded()));

        let entry = Arc::clone(&queues[0]);
        let exit = Arc::clone(&queues[stages.len()]);
        let last = stages.len() - 1;

        let mut runners = Vec::with_capacity(stages.len());
        for (index, stage) in stages.into_iter().enumerate() {
            let name = stage
                .name
                .unwrap_or_else(|| format!("stage-{index}"));
            let cleanup = stage
                .cleanup
                .map(|action| Arc::new(Cleanup::new(name.clone(), action)));

            let started = StageRunner::start(RunnerConfig {
                pipeline_id: id,
                index,
                name,
                options: stage.options,
                func: stage.func,
                input: Arc::clone(&queues[index]),
                output: Arc::clone(&queues[index + 1]),
                cleanup,
                after_completion: if index == last {
                    after_completion.clone()
                } else {
                    Vec::new()
                },
                auto_dispose: options.auto_dispose,
                cancel: cancel.clone(),
                sequence: Arc::clone(&sequence),
            });

            match started {
                Ok(runner) => runners.push(runner),
                Err(e) => {
                    cancel.cancel();
                    entry.complete_adding();
                    return Err(e);
                }
            }
        }

        tracing::debug!(
            pipeline = %id,
            stages = runners.len(),
            auto_dispose = options.auto_dispose,
            "Pipeline built"
        );

        Ok(Self {
            id,
            entry,
            exit,
            runners,
            after_completion,
            cancel,
            sequence,
            invoked: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    fn begin_invoke(&self) -> PipelineResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(PipelineError::Disposed);
        }
        if self.invoked.swap(true, Ordering::AcqRel) {
            return Err(PipelineError::InvalidState(
                "pipeline has already been invoked".into(),
            ));
        }
        Ok(())
    }

    async fn submit<In: Send + 'static>(&self, input: In) -> PipelineResult<CompletionHandle> {
        let handle = CompletionHandle::new();
        let index = self.sequence.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(pipeline = %self.id, index, "Submitting input");
        self.entry
            .add(WorkItem::new(erase(input), index, handle.clone()), &self.cancel)
            .await?;
        Ok(handle)
    }

    /// Turn an item read from the final queue into the caller's value.
    fn deliver<Out: 'static>(&self, item: WorkItem) -> PipelineResult<Out> {
        let WorkItem {
            value, completion, ..
        } = item;
        match value {
            Some(value) if !completion.is_settled() => {
                completion.settle_if_pending(Ok(()));
                downcast_value::<Out>(value).map_err(|_| PipelineError::TypeMismatch {
                    expected: std::any::type_name::<Out>().to_string(),
                    found: "a value of another type".into(),
                })
            }
            _ => match completion.outcome() {
                Some(Err(e)) => Err(e),
                _ => Err(PipelineError::Internal(
                    "dead item reached the terminal without a failure".into(),
                )),
            },
        }
    }

    fn abandon_exit(&self) {
        while let Some(item) = self.exit.try_take() {
            item.completion
                .settle_if_pending(Err(PipelineError::Cancelled));
        }
    }

    async fn dispose(&self) -> PipelineResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!(pipeline = %self.id, "Disposing pipeline");

        self.entry.complete_adding();
        for runner in &self.runners {
            runner.wait_finished().await;
        }

        // Cleanups are run-once, so stages already retired in auto mode
        // are skipped here.
        for runner in &self.runners {
            if let Some(cleanup) = runner.cleanup() {
                cleanup.run().await;
            }
        }
        for action in &self.after_completion {
            action.run().await;
        }
        Ok(())
    }

    fn metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            stages: self.runners.iter().map(|runner| runner.metrics()).collect(),
        }
    }

    fn stage_names(&self) -> Vec<String> {
        self.runners
            .iter()
            .map(|runner| runner.name().to_string())
            .collect()
    }
}

impl Drop for Topology {
    fn drop(&mut self) {
        // Lets idle workers drain and exit.
        self.entry.complete_adding();
    }
}

/// Pipeline resolving one input to exactly one output.
pub struct SinglePipeline<In, Out> {
    topology: Arc<Topology>,
    _types: PhantomData<fn(In) -> Out>,
}

impl<In, Out> SinglePipeline<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub(crate) fn new(topology: Topology) -> Self {
        Self {
            topology: Arc::new(topology),
            _types: PhantomData,
        }
    }

    /// Run `input` through every stage and return the single result.
    ///
    /// # Errors
    ///
    /// - the first step failure correlated with `input`, verbatim
    /// - `Arity` if the pipeline produced zero or several outputs
    /// - `Cancelled`, `Disposed`, or `InvalidState` on a second call
    pub async fn invoke(&self, input: In) -> PipelineResult<Out> {
        let topology = &self.topology;
        topology.begin_invoke()?;

        let root = match topology.submit(input).await {
            Ok(root) => root,
            Err(e) => {
                topology.entry.complete_adding();
                return Err(e);
            }
        };
        topology.entry.complete_adding();

        let cancel = &topology.cancel;
        let mut first = None;
        let mut count = 0usize;
        loop {
            let item = match topology.exit.take(cancel).await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) => {
                    topology.abandon_exit();
                    root.settle_if_pending(Err(e.clone()));
                    return Err(e);
                }
            };
            if item.is_dead() {
                continue;
            }
            count += 1;
            let value = topology.deliver::<Out>(item);
            if first.is_none() {
                first = Some(value);
            }
        }

        root.wait(cancel).await??;
        match (first, count) {
            (Some(value), 1) => value,
            _ => Err(PipelineError::Arity { count }),
        }
    }

    /// Tear the pipeline down. Idempotent; required when built with
    /// `auto_dispose = false`.
    pub async fn dispose(&self) -> PipelineResult<()> {
        self.topology.dispose().await
    }

    pub fn id(&self) -> Ulid {
        self.topology.id
    }

    pub fn metrics(&self) -> PipelineMetrics {
        self.topology.metrics()
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.topology.stage_names()
    }
}

/// Pipeline yielding every output as it arrives.
pub struct StreamPipeline<In, Out> {
    topology: Arc<Topology>,
    _types: PhantomData<fn(In) -> Out>,
}

impl<In, Out> StreamPipeline<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub(crate) fn new(topology: Topology) -> Self {
        Self {
            topology: Arc::new(topology),
            _types: PhantomData,
        }
    }

    pub async fn invoke(&self, input: In) -> PipelineResult<BoxStream<'static, PipelineResult<Out>>> {
        self.invoke_all(std::iter::once(input)).await
    }

    /// Submit every input, close the entry and return the outputs in order
    /// of arrival. A failed item shows up as an `Err` element; the stream
    /// keeps going after it.
    pub async fn invoke_all<I>(&self, inputs: I) -> PipelineResult<BoxStream<'static, PipelineResult<Out>>>
    where
        I: IntoIterator<Item = In>,
    {
        let topology = Arc::clone(&self.topology);
        topology.begin_invoke()?;

        let mut submitted = 0usize;
        for input in inputs {
            if let Err(e) = topology.submit(input).await {
                topology.entry.complete_adding();
                return Err(e);
            }
            submitted += 1;
        }
        topology.entry.complete_adding();
        tracing::debug!(pipeline = %topology.id, submitted, "Inputs submitted");

        Ok(async_stream::stream! {
            loop {
                match topology.exit.take(&topology.cancel).await {
                    Ok(Some(item)) => yield topology.deliver::<Out>(item),
                    Ok(None) => break,
                    Err(e) => {
                        topology.abandon_exit();
                        yield Err(e);
                        break;
                    }
                }
            }
        }
        .boxed())
    }

    pub async fn dispose(&self) -> PipelineResult<()> {
        self.topology.dispose().await
    }

    pub fn id(&self) -> Ulid {
        self.topology.id
    }

    pub fn metrics(&self) -> PipelineMetrics {
        self.topology.metrics()
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.topology.stage_names()
    }
}
