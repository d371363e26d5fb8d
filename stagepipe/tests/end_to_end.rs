//! End-to-end behaviour of built pipelines.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use rand::Rng;
use stagepipe::{
    AnyValue, CancellationToken, Dispose, DynamicBuilder, PipelineBuilder, PipelineConfig,
    PipelineError, Stage, Step, StepError, StepOptions, StepResult, StreamStep, TerminalOptions,
};

fn reverse(s: String) -> StepResult<String> {
    Ok(s.chars().rev().collect())
}

fn annotate(s: String) -> StepResult<(usize, String)> {
    Ok((s.len(), s))
}

/// Reverses strings and remembers how much work it had seen when disposed.
#[derive(Default)]
struct Reverser {
    calls: AtomicUsize,
    disposals: AtomicUsize,
    calls_at_dispose: AtomicUsize,
}

/// Step handle sharing a [`Reverser`] with the test body.
struct ReverseStep(Arc<Reverser>);

impl Step<String, String> for ReverseStep {
    fn execute(&self, input: String) -> StepResult<String> {
        if self.0.disposals.load(Ordering::SeqCst) > 0 {
            anyhow::bail!("used after dispose");
        }
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        reverse(input)
    }

    fn as_dispose(&self) -> Option<&dyn Dispose> {
        Some(self.0.as_ref())
    }
}

#[async_trait]
impl Dispose for Reverser {
    async fn dispose_async(&self) -> StepResult<()> {
        self.calls_at_dispose
            .store(self.calls.load(Ordering::SeqCst), Ordering::SeqCst);
        self.disposals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Emits lower then upper case of each char, after a per-call delay.
struct CaseSplitter {
    delays: Mutex<Vec<u64>>,
    returned: Arc<AtomicUsize>,
}

impl StreamStep<char, char> for CaseSplitter {
    fn execute(&self, input: char) -> stream::BoxStream<'_, StepResult<char>> {
        let delay = self.delays.lock().pop().unwrap_or(0);
        let returned = Arc::clone(&self.returned);
        async_stream::stream! {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            returned.fetch_add(1, Ordering::SeqCst);
            yield Ok(input.to_ascii_lowercase());
            returned.fetch_add(1, Ordering::SeqCst);
            yield Ok(input.to_ascii_uppercase());
        }
        .boxed()
    }
}

#[tokio::test]
async fn test_reverse_then_annotate() {
    let typed = PipelineBuilder::new()
        .add_step(reverse)
        .add_step(annotate)
        .returns_single(TerminalOptions::default())
        .unwrap();
    assert_eq!(
        typed.invoke("abc".to_string()).await.unwrap(),
        (3, "cba".to_string())
    );

    let dynamic = DynamicBuilder::new()
        .add_stage(Stage::value(reverse))
        .unwrap()
        .add_stage(Stage::value(annotate))
        .unwrap()
        .returns_single::<String, (usize, String)>(TerminalOptions::default())
        .unwrap();
    assert_eq!(
        dynamic.invoke("abc".to_string()).await.unwrap(),
        (3, "cba".to_string())
    );
}

#[tokio::test]
async fn test_composition_matches_direct_calls() {
    let words = ["", "a", "pipeline", "stagepipe"];
    for word in words {
        let pipeline = PipelineBuilder::new()
            .add_step(reverse)
            .add_async_step(|s: String| async move { annotate(s) })
            .returns_single(TerminalOptions::default())
            .unwrap();
        let expected = annotate(reverse(word.to_string()).unwrap()).unwrap();
        assert_eq!(pipeline.invoke(word.to_string()).await.unwrap(), expected);
    }
}

#[tokio::test]
async fn test_type_mismatch_at_build_time() {
    let result = DynamicBuilder::new()
        .add_stage(Stage::value(|s: String| Ok(s.len())))
        .unwrap()
        .add_stage(Stage::value(|n: i32| Ok(n * n)));
    assert!(matches!(result, Err(PipelineError::TypeMismatch { .. })));

    // AnyValue input accepts any previous output.
    let pipeline = DynamicBuilder::new()
        .add_stage(Stage::value(|s: String| Ok(s.len())))
        .unwrap()
        .add_stage(Stage::value(|v: AnyValue| {
            Ok(v.downcast_ref::<usize>().copied().unwrap_or_default())
        }))
        .unwrap()
        .returns_single::<String, usize>(TerminalOptions::default())
        .unwrap();
    assert_eq!(pipeline.invoke("four".to_string()).await.unwrap(), 4);
}

#[tokio::test]
async fn test_fan_out_interleaves_in_order() {
    let mut rng = rand::rng();
    let delays: Vec<u64> = (0..5).map(|_| rng.random_range(20..80)).collect();
    let returned = Arc::new(AtomicUsize::new(0));
    let first_stage_calls = Arc::new(AtomicUsize::new(0));
    let last_stage_calls = Arc::new(AtomicUsize::new(0));

    let pipeline = {
        let first = Arc::clone(&first_stage_calls);
        let last = Arc::clone(&last_stage_calls);
        PipelineBuilder::new()
            .accept_collection::<char>()
            .add_step(move |c: char| {
                first.fetch_add(1, Ordering::SeqCst);
                Ok(c)
            })
            .add_stream_step(CaseSplitter {
                delays: Mutex::new(delays.clone()),
                returned: Arc::clone(&returned),
            })
            .add_step(move |c: char| {
                last.fetch_add(1, Ordering::SeqCst);
                Ok(c)
            })
            .returns_stream(TerminalOptions::default())
            .unwrap()
    };

    let started = Instant::now();
    let text: String = pipeline
        .invoke("hello".chars().collect())
        .await
        .unwrap()
        .map(|c| c.unwrap())
        .collect()
        .await;
    let elapsed = started.elapsed();

    assert_eq!(text, "hHeElLlLoO");
    assert_eq!(first_stage_calls.load(Ordering::SeqCst), 5);
    assert_eq!(last_stage_calls.load(Ordering::SeqCst), 10);
    assert_eq!(returned.load(Ordering::SeqCst), 10);
    // Single worker per stage: the delays add up.
    assert!(elapsed >= Duration::from_millis(delays.iter().sum()));
}

#[tokio::test]
async fn test_parallel_stage_bounds() {
    let delays = [200u64, 150, 100, 250, 120];
    let pipeline = PipelineBuilder::new()
        .add_async_step(|ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<u64, StepError>(ms)
        })
        .with_options(StepOptions::new(delays.len(), 10))
        .returns_stream(TerminalOptions::default())
        .unwrap();

    let started = Instant::now();
    let mut out: Vec<u64> = pipeline
        .invoke_all(delays)
        .await
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
        .await;
    let elapsed = started.elapsed();

    out.sort_unstable();
    let mut expected = delays.to_vec();
    expected.sort_unstable();
    assert_eq!(out, expected);

    let max = *delays.iter().max().unwrap();
    let sum: u64 = delays.iter().sum();
    assert!(elapsed >= Duration::from_millis(max));
    assert!(elapsed < Duration::from_millis(sum));
}

#[tokio::test]
async fn test_errors_are_isolated_and_verbatim() {
    let pipeline = PipelineBuilder::new()
        .add_step(|n: u32| {
            if n == 1 {
                Err(anyhow::anyhow!("foo"))
            } else {
                Ok(n * 10)
            }
        })
        .add_step(|n: u32| Ok(n + 1))
        .returns_stream(TerminalOptions::default())
        .unwrap();

    let results: Vec<_> = pipeline.invoke_all(0..5u32).await.unwrap().collect().await;
    assert_eq!(results.len(), 5);

    let failures: Vec<String> = results
        .iter()
        .filter_map(|r| r.as_ref().err().map(|e| e.to_string()))
        .collect();
    assert_eq!(failures, vec!["foo".to_string()]);

    let values: Vec<u32> = results.into_iter().filter_map(Result::ok).collect();
    assert_eq!(values, vec![1, 21, 31, 41]);

    let metrics = pipeline.metrics();
    assert_eq!(metrics.stages[0].failures, 1);
    assert_eq!(metrics.stages[1].skipped, 1);
}

#[tokio::test]
async fn test_single_value_reports_step_error() {
    #[derive(Debug, thiserror::Error)]
    #[error("foo")]
    struct Foo;

    let pipeline = PipelineBuilder::new()
        .add_async_step(|n: u32| async move {
            if n == 1 {
                Err(StepError::from(Foo))
            } else {
                Ok(n)
            }
        })
        .returns_single(TerminalOptions::default())
        .unwrap();

    let err = pipeline.invoke(1).await.unwrap_err();
    assert_eq!(err.to_string(), "foo");
    let failure = err.as_step_failure().unwrap();
    assert!(failure.downcast_ref::<Foo>().is_some());
}

#[tokio::test]
async fn test_fan_out_failure_reaches_single_caller() {
    let pipeline = PipelineBuilder::new()
        .add_stream_step(|n: u32| stream::iter(vec![Ok(n), Err(anyhow::anyhow!("bar"))]))
        .add_step(|n: u32| Ok(n))
        .returns_single(TerminalOptions::default())
        .unwrap();

    let err = pipeline.invoke(7).await.unwrap_err();
    assert_eq!(err.to_string(), "bar");
}

#[tokio::test]
async fn test_panic_becomes_step_failure() {
    let pipeline = PipelineBuilder::new()
        .add_step(|n: u32| -> StepResult<u32> {
            if n == 2 {
                panic!("worker exploded");
            }
            Ok(n)
        })
        .returns_stream(TerminalOptions::default())
        .unwrap();

    let results: Vec<_> = pipeline.invoke_all([1u32, 2, 3]).await.unwrap().collect().await;
    assert_eq!(results.len(), 3);
    let err = results
        .iter()
        .find_map(|r| r.as_ref().err())
        .unwrap();
    assert!(err.to_string().contains("worker exploded"));
}

#[tokio::test]
async fn test_dispose_once_after_drain() {
    let reverser = Arc::new(Reverser::default());
    let pipeline = PipelineBuilder::new()
        .add_step(ReverseStep(Arc::clone(&reverser)))
        .with_options(StepOptions::new(3, 2))
        .add_step(|s: String| Ok(s.len()))
        .returns_stream(TerminalOptions::default())
        .unwrap();

    let inputs: Vec<String> = (0..50).map(|n| format!("item-{n}")).collect();
    let results: Vec<_> = pipeline.invoke_all(inputs).await.unwrap().collect().await;

    assert_eq!(results.len(), 50);
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(reverser.disposals.load(Ordering::SeqCst), 1);
    assert_eq!(reverser.calls_at_dispose.load(Ordering::SeqCst), 50);

    // Explicit dispose after auto-dispose does not run it again.
    pipeline.dispose().await.unwrap();
    assert_eq!(reverser.disposals.load(Ordering::SeqCst), 1);
}

/// Like [`ReverseStep`], but rejects inputs starting with `bad` and panics on `boom`.
struct FlakyReverseStep(Arc<Reverser>);

impl Step<String, String> for FlakyReverseStep {
    fn execute(&self, input: String) -> StepResult<String> {
        if self.0.disposals.load(Ordering::SeqCst) > 0 {
            anyhow::bail!("used after dispose");
        }
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        if input == "boom" {
            panic!("flaky step exploded");
        }
        if input.starts_with("bad") {
            anyhow::bail!("rejected {input}");
        }
        reverse(input)
    }

    fn as_dispose(&self) -> Option<&dyn Dispose> {
        Some(self.0.as_ref())
    }
}

#[tokio::test]
async fn test_dispose_once_after_drain_with_failures() {
    let reverser = Arc::new(Reverser::default());
    let pipeline = PipelineBuilder::new()
        .add_step(FlakyReverseStep(Arc::clone(&reverser)))
        .with_options(StepOptions::new(3, 2))
        .add_step(|s: String| Ok(s.len()))
        .returns_stream(TerminalOptions::default())
        .unwrap();

    let mut inputs: Vec<String> = (0..30)
        .map(|n| {
            if n % 5 == 0 {
                format!("bad-{n}")
            } else {
                format!("item-{n}")
            }
        })
        .collect();
    inputs.push("boom".to_string());
    let results: Vec<_> = pipeline.invoke_all(inputs).await.unwrap().collect().await;

    assert_eq!(results.len(), 31);
    assert_eq!(results.iter().filter(|r| r.is_err()).count(), 7);
    assert_eq!(reverser.disposals.load(Ordering::SeqCst), 1);
    assert_eq!(reverser.calls_at_dispose.load(Ordering::SeqCst), 31);
}

#[tokio::test]
async fn test_manual_dispose() {
    let reverser = Arc::new(Reverser::default());
    let after = Arc::new(AtomicUsize::new(0));
    let pipeline = {
        let after = Arc::clone(&after);
        PipelineBuilder::new()
            .add_step(ReverseStep(Arc::clone(&reverser)))
            .after_completion(move || async move {
                after.fetch_add(1, Ordering::SeqCst);
                Ok::<(), StepError>(())
            })
            .returns_stream(TerminalOptions::default().manual_dispose())
            .unwrap()
    };

    let out: Vec<String> = pipeline
        .invoke("abc".to_string())
        .await
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
        .await;
    assert_eq!(out, vec!["cba".to_string()]);
    assert_eq!(reverser.disposals.load(Ordering::SeqCst), 0);
    assert_eq!(after.load(Ordering::SeqCst), 0);

    pipeline.dispose().await.unwrap();
    pipeline.dispose().await.unwrap();
    assert_eq!(reverser.disposals.load(Ordering::SeqCst), 1);
    assert_eq!(after.load(Ordering::SeqCst), 1);

    assert!(matches!(
        pipeline.invoke("abc".to_string()).await,
        Err(PipelineError::Disposed)
    ));
}

#[tokio::test]
async fn test_after_completion_runs_once_before_stream_ends() {
    let after = Arc::new(AtomicUsize::new(0));
    let pipeline = {
        let after = Arc::clone(&after);
        PipelineBuilder::new()
            .add_step(|n: u8| Ok(n))
            .add_step(|n: u8| Ok(n))
            .after_completion(move || async move {
                after.fetch_add(1, Ordering::SeqCst);
                Ok::<(), StepError>(())
            })
            .returns_stream(TerminalOptions::default())
            .unwrap()
    };

    let count = pipeline.invoke_all(0..10u8).await.unwrap().count().await;
    assert_eq!(count, 10);
    assert_eq!(after.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancellation_ends_stream() {
    let cancel = CancellationToken::new();
    let pipeline = PipelineBuilder::new()
        .add_async_step(|n: u32| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<u32, StepError>(n)
        })
        .returns_stream(TerminalOptions::with_cancel(cancel.clone()))
        .unwrap();

    let mut results = pipeline.invoke(1).await.unwrap();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        })
    };

    let first = tokio::time::timeout(Duration::from_secs(5), results.next())
        .await
        .unwrap();
    assert!(matches!(first, Some(Err(PipelineError::Cancelled))));
    assert!(results.next().await.is_none());
    canceller.await.unwrap();
}

fn cancel_after(cancel: &CancellationToken, millis: u64) -> tokio::task::JoinHandle<()> {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        cancel.cancel();
    })
}

#[tokio::test]
async fn test_cancel_with_fanned_out_item_in_flight_then_dispose() {
    let cancel = CancellationToken::new();
    let after = Arc::new(AtomicUsize::new(0));
    let pipeline = {
        let after = Arc::clone(&after);
        PipelineBuilder::new()
            .add_stream_step(|n: u32| {
                stream::iter((0..3).map(|_| Ok::<u32, StepError>(n)).collect::<Vec<_>>())
            })
            .add_async_step(|n: u32| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok::<u32, StepError>(n)
            })
            .after_completion(move || async move {
                after.fetch_add(1, Ordering::SeqCst);
                Ok::<(), StepError>(())
            })
            .returns_single(TerminalOptions::with_cancel(cancel.clone()).manual_dispose())
            .unwrap()
    };

    let canceller = cancel_after(&cancel, 50);
    let result = tokio::time::timeout(Duration::from_secs(5), pipeline.invoke(1))
        .await
        .unwrap();
    assert!(matches!(result, Err(PipelineError::Cancelled)));
    canceller.await.unwrap();

    tokio::time::timeout(Duration::from_secs(3), pipeline.dispose())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_step_failing_after_cancel_then_dispose() {
    let cancel = CancellationToken::new();
    let pipeline = PipelineBuilder::new()
        .add_async_step(|_: u32| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Err::<u32, StepError>(anyhow::anyhow!("late failure"))
        })
        .returns_single(TerminalOptions::with_cancel(cancel.clone()).manual_dispose())
        .unwrap();

    let canceller = cancel_after(&cancel, 50);
    let result = tokio::time::timeout(Duration::from_secs(5), pipeline.invoke(1))
        .await
        .unwrap();
    assert!(matches!(result, Err(PipelineError::Cancelled)));
    canceller.await.unwrap();

    tokio::time::timeout(Duration::from_secs(3), pipeline.dispose())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pipeline.metrics().total_failures(), 1);
}

#[tokio::test]
async fn test_config_overrides_named_stage() {
    let config =
        PipelineConfig::from_json(r#"{"stages": {"square": {"parallelism": 4}}}"#).unwrap();
    let pipeline = PipelineBuilder::new()
        .add_step(|n: u64| Ok(n * n))
        .named("square")
        .add_step(|n: u64| Ok(n + 1))
        .configure(&config)
        .returns_stream(TerminalOptions::default())
        .unwrap();

    assert_eq!(pipeline.stage_names(), vec!["square", "stage-1"]);
    let mut out: Vec<u64> = pipeline
        .invoke_all(1..=4u64)
        .await
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
        .await;
    out.sort_unstable();
    assert_eq!(out, vec![2, 5, 10, 17]);

    let metrics = pipeline.metrics();
    let square = metrics.stage("square").unwrap();
    assert_eq!(square.parallelism, 4);
    assert_eq!(square.items_processed, 4);
}

#[tokio::test]
async fn test_accept_collection_empty_input() {
    let pipeline = PipelineBuilder::new()
        .accept_collection::<u8>()
        .add_step(|n: u8| Ok(n))
        .returns_stream(TerminalOptions::default())
        .unwrap();

    let count = pipeline.invoke(Vec::new()).await.unwrap().count().await;
    assert_eq!(count, 0);
}
