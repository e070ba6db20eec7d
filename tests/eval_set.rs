//! End-to-end eval-set scenarios driven by scripted pipelines.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::Instant;

use evalset::logstore::{FileLogStore, LogStore, MemoryLogStore};
use evalset::runner::{NoSandbox, SampleError, SampleOutput, SamplePipeline, SampleRequest};
use evalset::scheduler::{EvalSetConfig, FairnessPolicy, Scheduler};
use evalset::task::{SolverSpec, TaskDefinition};
use evalset::work::{FailOnError, SampleRecord, WorkUnitKey};

#[derive(Debug, Clone)]
struct Call {
    model: String,
    sample: String,
    started: Instant,
    ended: Instant,
}

/// Sleeps for `delay` per sample and fails chosen samples a set number of
/// times with a rate limit before letting them succeed.
struct ScriptedPipeline {
    delay: Duration,
    failures: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedPipeline {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn failing(self, sample: &str, times: u32) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(sample.to_string(), times);
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn samples_called(&self) -> HashSet<String> {
        self.calls().into_iter().map(|c| c.sample).collect()
    }
}

#[async_trait]
impl SamplePipeline for ScriptedPipeline {
    async fn execute(&self, request: SampleRequest) -> Result<SampleOutput, SampleError> {
        let started = Instant::now();
        tokio::time::sleep(self.delay).await;
        let sample = request.unit.sample_id.as_str().to_string();

        self.calls.lock().unwrap().push(Call {
            model: request.unit.model.clone(),
            sample: sample.clone(),
            started,
            ended: Instant::now(),
        });

        let mut failures = self.failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(&sample) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SampleError::RateLimited(format!("429 for {}", sample)));
            }
        }
        Ok(SampleOutput::new(json!({ "sample": sample, "score": 1.0 })))
    }
}

/// Largest number of calls running at the same instant.
fn peak_overlap(calls: &[Call]) -> usize {
    calls
        .iter()
        .map(|at| {
            calls
                .iter()
                .filter(|c| c.started <= at.started && at.started < c.ended)
                .count()
        })
        .max()
        .unwrap_or(0)
}

fn scheduler<P: SamplePipeline + 'static>(
    config: EvalSetConfig,
    store: Arc<dyn LogStore>,
    pipeline: Arc<P>,
) -> Scheduler {
    Scheduler::new(config, store, pipeline, Arc::new(NoSandbox))
}

fn numbered_task(name: &str, samples: u64) -> TaskDefinition {
    TaskDefinition::new(name, 1..=samples)
}

#[tokio::test]
async fn test_second_invocation_makes_no_calls() {
    let temp = tempfile::TempDir::new().unwrap();
    let config = EvalSetConfig::new()
        .with_log_dir(temp.path())
        .with_model("mock/a", 4)
        .with_model("mock/b", 4);
    let tasks = vec![numbered_task("arith", 5), numbered_task("spelling", 3)];

    let first = Arc::new(ScriptedPipeline::new(Duration::from_millis(1)));
    let store: Arc<dyn LogStore> = Arc::new(FileLogStore::new(temp.path()));
    let outcome = scheduler(config.clone(), store, first.clone())
        .run(&tasks)
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.headers.len(), 4);
    assert_eq!(first.call_count(), 16);

    let second = Arc::new(ScriptedPipeline::new(Duration::from_millis(1)));
    let store: Arc<dyn LogStore> = Arc::new(FileLogStore::new(temp.path()));
    let again = scheduler(config, store, second.clone())
        .run(&tasks)
        .await
        .unwrap();

    assert_eq!(second.call_count(), 0);
    assert_eq!(again.success, outcome.success);
    assert_eq!(again.stats.skipped, 4);
    let digests = |o: &evalset::EvalSetOutcome| {
        o.headers
            .iter()
            .map(|h| h.signature_digest.clone())
            .collect::<Vec<_>>()
    };
    assert_eq!(digests(&again), digests(&outcome));
}

#[tokio::test]
async fn test_resume_runs_only_missing_samples() {
    let temp = tempfile::TempDir::new().unwrap();
    let config = EvalSetConfig::new()
        .with_log_dir(temp.path())
        .with_model("mock/a", 2);
    let task = numbered_task("arith", 10);

    // A previous process got through samples 1..=6 before it died.
    let store = Arc::new(FileLogStore::new(temp.path()));
    let signature = task.signature("mock/a");
    for id in 1..=6u64 {
        let mut record = SampleRecord::new();
        record.begin().unwrap();
        record.succeed(json!({ "score": 1 })).unwrap();
        store
            .append(&signature, &WorkUnitKey::new(id, 1), &record)
            .await
            .unwrap();
    }
    // One more was mid-flight.
    let mut running = SampleRecord::new();
    running.begin().unwrap();
    store
        .append(&signature, &WorkUnitKey::new(7u64, 1), &running)
        .await
        .unwrap();

    let pipeline = Arc::new(ScriptedPipeline::new(Duration::from_millis(1)));
    let outcome = scheduler(config, store, pipeline.clone())
        .run(&[task])
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.stats.reused_samples, 6);
    assert_eq!(
        pipeline.samples_called(),
        ["7", "8", "9", "10"].map(String::from).into_iter().collect()
    );
    assert_eq!(pipeline.call_count(), 4);
    assert_eq!(outcome.headers[0].succeeded, 10);
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_invocation_resumes() {
    let store: Arc<dyn LogStore> = Arc::new(MemoryLogStore::new());
    let config = EvalSetConfig::new()
        .with_model("mock/a", 2)
        .with_max_tasks(2);
    let task = numbered_task("arith", 10);

    let first = Arc::new(ScriptedPipeline::new(Duration::from_secs(1)));
    let sched = scheduler(config.clone(), Arc::clone(&store), first.clone());
    let token = sched.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        token.cancel();
    });
    let interrupted = sched.run(&[task.clone()]).await.unwrap();

    assert!(!interrupted.success);
    assert_eq!(interrupted.incomplete.len(), 1);
    let done = interrupted.incomplete[0].counts.succeeded;
    // Two waves finished, the third was allowed to finish within the grace period.
    assert_eq!(done, 6);
    assert_eq!(first.call_count(), 6);

    let second = Arc::new(ScriptedPipeline::new(Duration::from_secs(1)));
    let resumed = scheduler(config, store, second.clone())
        .run(&[task])
        .await
        .unwrap();

    assert!(resumed.success);
    assert_eq!(second.call_count(), 10 - done);
    assert!(second
        .samples_called()
        .is_disjoint(&first.samples_called()));
}

#[tokio::test]
async fn test_changed_signature_reruns_everything() {
    let temp = tempfile::TempDir::new().unwrap();
    let config = EvalSetConfig::new()
        .with_log_dir(temp.path())
        .with_model("mock/a", 4);
    let cold = numbered_task("arith", 4)
        .with_solver(SolverSpec::new("generate").with_args(json!({ "temperature": 0.0 })));
    let warm = numbered_task("arith", 4)
        .with_solver(SolverSpec::new("generate").with_args(json!({ "temperature": 0.7 })));

    let pipeline = Arc::new(ScriptedPipeline::new(Duration::from_millis(1)));
    let store: Arc<dyn LogStore> = Arc::new(FileLogStore::new(temp.path()));
    scheduler(config.clone(), Arc::clone(&store), pipeline.clone())
        .run(&[cold.clone()])
        .await
        .unwrap();
    assert_eq!(pipeline.call_count(), 4);

    let outcome = scheduler(config.clone(), Arc::clone(&store), pipeline.clone())
        .run(&[warm])
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.stats.reused_samples, 0);
    assert_eq!(pipeline.call_count(), 8);

    // The original configuration is still finalized and untouched.
    let outcome = scheduler(config, store, pipeline.clone())
        .run(&[cold])
        .await
        .unwrap();
    assert_eq!(outcome.stats.skipped, 1);
    assert_eq!(pipeline.call_count(), 8);
}

#[tokio::test]
async fn test_grown_work_set_runs_new_units() {
    let temp = tempfile::TempDir::new().unwrap();
    let config = EvalSetConfig::new()
        .with_log_dir(temp.path())
        .with_model("mock/a", 4);
    let store: Arc<dyn LogStore> = Arc::new(FileLogStore::new(temp.path()));

    let pipeline = Arc::new(ScriptedPipeline::new(Duration::from_millis(1)));
    let small = TaskDefinition::new("arith", ["a", "b", "c"]);
    let outcome = scheduler(config.clone(), Arc::clone(&store), pipeline.clone())
        .run(&[small])
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(pipeline.call_count(), 3);

    // More samples and a second epoch under the same signature.
    let grown = TaskDefinition::new("arith", ["a", "b", "c", "d", "e"]).with_epochs(2);
    let outcome = scheduler(config.clone(), Arc::clone(&store), pipeline.clone())
        .run(&[grown.clone()])
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.stats.skipped, 0);
    assert_eq!(outcome.stats.reused_samples, 3);
    // d and e in epoch 1, everything in epoch 2.
    assert_eq!(pipeline.call_count(), 3 + 7);
    assert_eq!(outcome.headers[0].samples_total, 10);
    assert_eq!(outcome.headers[0].succeeded, 10);

    let outcome = scheduler(config, store, pipeline.clone())
        .run(&[grown])
        .await
        .unwrap();
    assert_eq!(outcome.stats.skipped, 1);
    assert_eq!(outcome.headers[0].samples_total, 10);
    assert_eq!(pipeline.call_count(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retry_with_halved_cap() {
    let config = EvalSetConfig::new()
        .with_model("mock/a", 4)
        .with_max_tasks(4)
        .with_retry_attempts(3)
        .with_retry_wait(Duration::from_secs(30))
        .with_retry_connections(0.5);
    let task = numbered_task("arith", 10);

    let pipeline = ScriptedPipeline::new(Duration::from_secs(1))
        .failing("1", 1)
        .failing("2", 1)
        .failing("3", 1)
        .failing("4", 1);
    let pipeline = Arc::new(pipeline);
    let store = Arc::new(MemoryLogStore::new());

    let outcome = scheduler(config, store, pipeline.clone())
        .run(&[task])
        .await
        .unwrap();

    assert!(outcome.success);
    let header = &outcome.headers[0];
    assert_eq!(header.succeeded, 10);
    assert_eq!(header.failed, 0);
    assert_eq!(header.attempts, 2);
    assert_eq!(outcome.stats.retries, 1);
    assert_eq!(outcome.stats.models[0].effective_cap, 2);

    let calls = pipeline.calls();
    assert_eq!(calls.len(), 14);
    let (first, second) = calls.split_at(10);
    assert_eq!(peak_overlap(first), 4);

    let retried: HashSet<String> = second.iter().map(|c| c.sample.clone()).collect();
    assert_eq!(
        retried,
        ["1", "2", "3", "4"].map(String::from).into_iter().collect()
    );
    assert_eq!(peak_overlap(second), 2);

    let first_end = first.iter().map(|c| c.ended).max().unwrap();
    let second_start = second.iter().map(|c| c.started).min().unwrap();
    assert!(second_start - first_end >= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_abandon_for_good() {
    let config = EvalSetConfig::new()
        .with_model("mock/a", 4)
        .with_retry_attempts(3)
        .with_retry_wait(Duration::from_secs(30))
        .with_cleanup_logs(false);
    let task = TaskDefinition::new("arith", ["ok", "flaky"]);

    let pipeline = Arc::new(ScriptedPipeline::new(Duration::from_secs(1)).failing("flaky", u32::MAX));
    let store = Arc::new(MemoryLogStore::new());
    let started = Instant::now();

    let outcome = scheduler(config, store.clone(), pipeline.clone())
        .run(&[task.clone()])
        .await
        .unwrap();

    assert!(!outcome.success);
    assert!(outcome.headers.is_empty());
    let abandoned = &outcome.abandoned[0];
    assert_eq!(abandoned.attempts, 3);
    assert_eq!(abandoned.reason, "retry attempts exhausted");
    assert!(abandoned
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("429")));
    assert!(abandoned
        .log_location
        .as_deref()
        .is_some_and(|l| l.starts_with("memory://arith/mock/a/")));

    // "ok" once, "flaky" on each of the three attempts and never again.
    assert_eq!(pipeline.call_count(), 4);
    // Backoff: 30s + 60s between the three attempts.
    assert!(started.elapsed() >= Duration::from_secs(90));
    assert!(started.elapsed() < Duration::from_secs(210));
    assert!(store.contains(&task.signature("mock/a")));
}

#[tokio::test]
async fn test_abandoned_run_logs_are_removed() {
    let temp = tempfile::TempDir::new().unwrap();
    let config = EvalSetConfig::new()
        .with_log_dir(temp.path())
        .with_model("mock/a", 4)
        .with_retry_attempts(1)
        .with_retry_wait(Duration::from_millis(5));
    let task = TaskDefinition::new("arith", ["ok", "flaky"]);

    let pipeline =
        Arc::new(ScriptedPipeline::new(Duration::from_millis(1)).failing("flaky", u32::MAX));
    let store = Arc::new(FileLogStore::new(temp.path()));
    let outcome = scheduler(config, store.clone(), pipeline.clone())
        .run(&[task])
        .await
        .unwrap();

    assert_eq!(outcome.abandoned.len(), 1);
    assert!(outcome.abandoned[0].log_location.is_none());
    assert!(store.scan().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_models_share_global_budget() {
    let config = EvalSetConfig::new()
        .with_model("mock/a", 2)
        .with_model("mock/b", 2)
        .with_max_tasks(2)
        .with_fairness(FairnessPolicy::RoundRobin);
    let task = numbered_task("arith", 4);

    let pipeline = Arc::new(ScriptedPipeline::new(Duration::from_secs(1)));
    let outcome = scheduler(config, Arc::new(MemoryLogStore::new()), pipeline.clone())
        .run(&[task])
        .await
        .unwrap();
    assert!(outcome.success);

    let mut calls = pipeline.calls();
    assert_eq!(calls.len(), 8);
    assert!(peak_overlap(&calls) <= 2);

    // Model a's whole backlog is queued first, yet b gets the third slot.
    calls.sort_by_key(|c| c.started);
    let first_b = calls.iter().position(|c| c.model == "mock/b").unwrap();
    assert!(first_b <= 2, "mock/b first started at position {}", first_b);

    let a_end = calls
        .iter()
        .filter(|c| c.model == "mock/a")
        .map(|c| c.ended)
        .max()
        .unwrap();
    let b_start = calls[first_b].started;
    assert!(b_start < a_end);
}

#[tokio::test]
async fn test_tolerated_failures_finalize_without_retry() {
    let config = EvalSetConfig::new()
        .with_model("mock/a", 4)
        .with_fail_on_error(FailOnError::Fraction(0.25));
    let task = numbered_task("arith", 8);

    let pipeline = Arc::new(
        ScriptedPipeline::new(Duration::from_millis(1))
            .failing("3", u32::MAX)
            .failing("5", u32::MAX),
    );
    let outcome = scheduler(config, Arc::new(MemoryLogStore::new()), pipeline.clone())
        .run(&[task])
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.headers[0].failed, 2);
    assert_eq!(outcome.stats.retries, 0);
    assert_eq!(pipeline.call_count(), 8);
}
