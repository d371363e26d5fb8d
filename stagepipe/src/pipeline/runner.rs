//! Stage runner: the worker pool behind one stage.
//!
//! Each unit of parallelism is a dedicated OS thread driving its own
//! current-thread tokio runtime, so blocking steps never starve the caller's
//! executor and async steps still get timers and I/O.
//!
//! ## Worker loop
//!
//! ```text
//! take ─┬─ dead / settled ──────────────→ forward dead marker
//!       └─ live ─→ invoke ─┬─ 0 outputs ─→ settle Ok
//!                          ├─ 1 output  ─→ forward with same handle
//!                          ├─ n outputs ─→ FanIn, one child handle each
//!                          └─ failure   ─→ settle Err, forward dead marker
//! ```
//!
//! The last worker to see its input exhausted retires the stage: cleanup
//! (auto-dispose), after-completion actions (last stage only), then the
//! output queue is completed and the `finished` signal raised.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use futures::{FutureExt, StreamExt};
use stagepipe_shared::errors::{PipelineError, PipelineResult, StepFailure};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use ulid::Ulid;

use super::metrics::{StageMetrics, StageMetricsStorage};
use super::stage::{Cleanup, StageFn, StageOutput};
use crate::options::StepOptions;
use crate::queue::BoundedQueue;
use crate::work::{AnyValue, CompletionHandle, FanIn, WorkItem};

pub(crate) type ItemQueue = BoundedQueue<WorkItem>;

/// Everything a stage's workers need, shared between them.
pub(crate) struct RunnerConfig {
    pub pipeline_id: Ulid,
    pub index: usize,
    pub name: String,
    pub options: StepOptions,
    pub func: StageFn,
    pub input: Arc<ItemQueue>,
    pub output: Arc<ItemQueue>,
    pub cleanup: Option<Arc<Cleanup>>,
    pub after_completion: Vec<Arc<Cleanup>>,
    pub auto_dispose: bool,
    pub cancel: CancellationToken,
    pub sequence: Arc<AtomicU64>,
}

pub(crate) struct StageRunner {
    config: RunnerConfig,
    metrics: StageMetricsStorage,
    active: AtomicUsize,
    finished: AtomicBool,
    finished_notify: Notify,
}

impl StageRunner {
    /// Spawn the stage's workers.
    ///
    /// On a spawn failure the pipeline's token is cancelled so workers that
    /// did start wind down, and the error is returned.
    pub fn start(config: RunnerConfig) -> PipelineResult<Arc<Self>> {
        let parallelism = config.options.parallelism;
        let runner = Arc::new(Self {
            config,
            metrics: StageMetricsStorage::default(),
            active: AtomicUsize::new(parallelism),
            finished: AtomicBool::new(false),
            finished_notify: Notify::new(),
        });

        for worker in 0..parallelism {
            let this = Arc::clone(&runner);
            let spawned = std::thread::Builder::new()
                .name(format!("stage-{}-worker-{}", runner.config.index, worker))
                .spawn(move || this.worker_main(worker));

            if let Err(e) = spawned {
                runner.config.cancel.cancel();
                // Workers that never started still count towards retirement.
                for _ in worker..parallelism {
                    runner.retire_blocking();
                }
                return Err(PipelineError::Internal(format!(
                    "failed to spawn worker {worker} for stage '{}': {e}",
                    runner.config.name
                )));
            }
        }

        tracing::debug!(
            pipeline = %runner.config.pipeline_id,
            stage = %runner.config.name,
            parallelism,
            buffer_capacity = runner.config.options.buffer_capacity,
            "Stage started"
        );
        Ok(runner)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn cleanup(&self) -> Option<&Arc<Cleanup>> {
        self.config.cleanup.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Wait until every worker has exited and the output queue is complete.
    pub async fn wait_finished(&self) {
        loop {
            let notified = self.finished_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_finished() {
                return;
            }
            notified.await;
        }
    }

    pub fn metrics(&self) -> StageMetrics {
        self.metrics.snapshot(
            self.config.index,
            &self.config.name,
            self.config.options.parallelism,
        )
    }

    fn worker_main(self: Arc<Self>, worker: usize) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!(
                    stage = %self.config.name,
                    worker,
                    error = %e,
                    "Failed to build worker runtime, cancelling pipeline"
                );
                self.config.cancel.cancel();
                self.retire_blocking();
                return;
            }
        };

        let span = tracing::debug_span!(
            "stage_worker",
            pipeline = %self.config.pipeline_id,
            stage = %self.config.name,
            worker
        );
        runtime.block_on(self.run_worker().instrument(span));
    }

    async fn run_worker(&self) {
        let cancel = &self.config.cancel;
        loop {
            let item = match self.config.input.take(cancel).await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(_) => break,
            };
            if let Err(e) = self.process(item).await {
                tracing::debug!(error = %e, "Worker stopping");
                break;
            }
        }

        if cancel.is_cancelled() {
            self.abandon_input();
        }
        self.retire().await;
    }

    /// Handle one item. Only fails when the pipeline is being torn down.
    async fn process(&self, item: WorkItem) -> PipelineResult<()> {
        let WorkItem {
            value,
            index,
            completion,
        } = item;

        let value = match value {
            Some(value) if !completion.is_settled() => value,
            _ => {
                self.metrics.record_skipped();
                tracing::trace!(index, "Forwarding dead marker");
                return self.forward(WorkItem::dead(index, completion)).await;
            }
        };

        tracing::trace!(index, "Processing item");
        let started = Instant::now();
        let result = self.fan_out(value, index, &completion).await;
        self.metrics.record_processed(started.elapsed());
        result
    }

    async fn fan_out(
        &self,
        value: AnyValue,
        index: u64,
        completion: &CompletionHandle,
    ) -> PipelineResult<()> {
        let func = &self.config.func;
        let mut outputs = match std::panic::catch_unwind(AssertUnwindSafe(|| func(value))) {
            Ok(outputs) => outputs,
            Err(payload) => {
                let failure = PipelineError::Step(StepFailure::from_panic(payload));
                return self.fail(index, completion.clone(), failure).await;
            }
        };

        let first = match next_output(&mut outputs).await {
            None => {
                completion.settle_if_pending(Ok(()));
                return Ok(());
            }
            Some(Err(e)) => return self.fail(index, completion.clone(), e).await,
            Some(Ok(first)) => first,
        };

        let second = match next_output(&mut outputs).await {
            None => {
                self.metrics.record_emitted();
                return self
                    .forward(WorkItem::new(first, index, completion.clone()))
                    .await;
            }
            Some(second) => second,
        };

        let barrier = FanIn::new(completion.clone());
        let result = self
            .emit_children(&barrier, first, second, &mut outputs)
            .await;
        barrier.seal();
        result
    }

    async fn emit_children(
        &self,
        barrier: &Arc<FanIn>,
        first: AnyValue,
        second: PipelineResult<AnyValue>,
        outputs: &mut StageOutput,
    ) -> PipelineResult<()> {
        self.emit_child(barrier, Ok(first)).await?;
        let mut next = Some(second);
        while let Some(output) = next {
            let failed = output.is_err();
            self.emit_child(barrier, output).await?;
            if failed {
                break;
            }
            next = next_output(outputs).await;
        }
        Ok(())
    }

    async fn emit_child(
        &self,
        barrier: &Arc<FanIn>,
        output: PipelineResult<AnyValue>,
    ) -> PipelineResult<()> {
        let index = self.config.sequence.fetch_add(1, Ordering::Relaxed);
        let child = barrier.child();
        match output {
            Ok(value) => {
                self.metrics.record_emitted();
                self.forward(WorkItem::new(value, index, child)).await
            }
            Err(e) => self.fail(index, child, e).await,
        }
    }

    async fn fail(
        &self,
        index: u64,
        completion: CompletionHandle,
        error: PipelineError,
    ) -> PipelineResult<()> {
        self.metrics.record_failure();
        tracing::warn!(index, error = %error, "Step failed for item");
        completion.settle_if_pending(Err(error));
        self.forward(WorkItem::dead(index, completion)).await
    }

    async fn forward(&self, item: WorkItem) -> PipelineResult<()> {
        let completion = item.completion.clone();
        if let Err(e) = self.config.output.add(item, &self.config.cancel).await {
            completion.settle_if_pending(Err(e.clone()));
            return Err(e);
        }
        Ok(())
    }

    /// Settle whatever is still queued for this stage after cancellation.
    fn abandon_input(&self) {
        while let Some(item) = self.config.input.try_take() {
            item.completion
                .settle_if_pending(Err(PipelineError::Cancelled));
        }
    }

    async fn retire(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        if self.config.auto_dispose {
            if let Some(cleanup) = &self.config.cleanup {
                cleanup.run().await;
            }
            for action in &self.config.after_completion {
                action.run().await;
            }
        }
        self.finish();
    }

    /// Retirement for threads that have no runtime of their own.
    fn retire_blocking(&self) {
        futures::executor::block_on(self.retire());
    }

    fn finish(&self) {
        self.config.output.complete_adding();
        self.finished.store(true, Ordering::Release);
        self.finished_notify.notify_waiters();
        tracing::debug!(
            pipeline = %self.config.pipeline_id,
            stage = %self.config.name,
            "Stage finished"
        );
    }
}

/// Pull the next output, turning a panic inside the step into a failure.
async fn next_output(outputs: &mut StageOutput) -> Option<PipelineResult<AnyValue>> {
    match AssertUnwindSafe(outputs.next()).catch_unwind().await {
        Ok(next) => next,
        Err(payload) => Some(Err(PipelineError::Step(StepFailure::from_panic(payload)))),
    }
}
