//! The eval-set control loop.
//!
//! One logical loop owns every [`TaskRun`] and consumes completions from a
//! `JoinSet` of sample workers. Workers only wait for a lease, run one
//! sample and report back; all record mutation, log store writes and retry
//! decisions happen on the loop.
//!
//! Per task run: `NotStarted -> InProgress -> {Completed, Abandoned}`.
//! Attempts dispatch every outstanding unit; when the last report of an
//! attempt arrives the run is finalized, retried after a backoff, or
//! abandoned.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, LogStoreError, TaskError};
use crate::logstore::{with_write_retry, CleanupOutcome, LogStore, TaskRunHeader};
use crate::metrics::MetricsCollector;
use crate::runner::{
    ResourceRegistry, SampleLimits, SamplePipeline, SampleRunner, SandboxProvider,
};
use crate::task::TaskDefinition;
use crate::work::{
    ErrorClass, SampleFailure, SampleRecord, SampleState, TaskRun, TaskRunStatus, WorkUnit,
    WorkUnitKey,
};

use super::balancer::{BalancerError, ConcurrencyBalancer};
use super::config::{EvalSetConfig, DEFAULT_MAX_CONNECTIONS};
use super::outcome::{AbandonedRun, EvalSetOutcome, IncompleteRun, ModelStats};
use super::progress::{ProgressCounters, ProgressMonitor};
use super::retry::{AbandonReason, RetryController, RetryDecision};

/// Errors that stop an invocation before any sample runs.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Log store error: {0}")]
    LogStore(#[from] LogStoreError),

    #[error("Task '{task}' is scheduled more than once for model '{model}' with the same signature")]
    DuplicateRun { task: String, model: String },
}

/// What an invocation would do for one task run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunPlan {
    pub task: String,
    pub model: String,
    pub signature_digest: String,
    pub location: String,
    pub samples_total: usize,
    /// Samples already complete for this exact signature.
    pub reusable: usize,
    pub outstanding: usize,
    /// Header of an earlier invocation that finalized the run.
    pub finalized: Option<TaskRunHeader>,
}

/// Runs eval sets against a log store, a sample pipeline and a sandbox
/// provider.
pub struct Scheduler {
    config: EvalSetConfig,
    store: Arc<dyn LogStore>,
    pipeline: Arc<dyn SamplePipeline>,
    sandboxes: Arc<dyn SandboxProvider>,
    cancel: CancellationToken,
    counters: ProgressCounters,
    metrics: MetricsCollector,
}

impl Scheduler {
    pub fn new(
        config: EvalSetConfig,
        store: Arc<dyn LogStore>,
        pipeline: Arc<dyn SamplePipeline>,
        sandboxes: Arc<dyn SandboxProvider>,
    ) -> Self {
        Self {
            config,
            store,
            pipeline,
            sandboxes,
            cancel: CancellationToken::new(),
            counters: ProgressCounters::new(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &EvalSetConfig {
        &self.config
    }

    /// Token that interrupts every in-flight sample of this scheduler.
    /// Cancelled samples get `cancel_grace` to wind down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn counters(&self) -> &ProgressCounters {
        &self.counters
    }

    /// Reports, per task run, how much work an invocation would do.
    pub async fn plan(&self, tasks: &[TaskDefinition]) -> Result<Vec<RunPlan>, SchedulerError> {
        self.config.validate()?;
        let mut plans = Vec::new();
        for loaded in self.load_runs(tasks).await? {
            let counts = loaded.run.counts();
            let complete = counts.complete();
            plans.push(RunPlan {
                task: loaded.run.task().to_string(),
                model: loaded.run.model().to_string(),
                signature_digest: loaded.run.signature().digest(),
                location: self.store.location(loaded.run.signature()),
                samples_total: counts.total,
                reusable: complete,
                outstanding: if loaded.finalized.is_some() {
                    0
                } else {
                    counts.total - complete
                },
                finalized: loaded.finalized,
            });
        }
        Ok(plans)
    }

    /// Runs every task against every configured model until each task run
    /// is finalized, abandoned, or the invocation is cancelled.
    ///
    /// Work already complete in the log store for the same signature is
    /// reused, so a failed invocation can simply be repeated.
    pub async fn run(&self, tasks: &[TaskDefinition]) -> Result<EvalSetOutcome, SchedulerError> {
        self.config.validate()?;
        let mut outcome = EvalSetOutcome::default();
        let mut slots = Vec::new();

        for loaded in self.load_runs(tasks).await? {
            outcome.stats.task_runs += 1;
            if let Some(header) = loaded.finalized {
                info!(
                    task = %header.task,
                    model = %header.model,
                    status = %header.status,
                    "Task run already finalized, skipping"
                );
                outcome.stats.skipped += 1;
                outcome.headers.push(header);
                continue;
            }
            outcome.stats.reused_samples += loaded.reused;
            self.counters
                .reused
                .fetch_add(loaded.reused, Ordering::Relaxed);
            let window = self
                .config
                .model(loaded.run.model())
                .map_or(DEFAULT_MAX_CONNECTIONS, |m| m.max_connections)
                .min(self.config.effective_max_tasks())
                .max(1);
            slots.push(RunSlot::new(loaded.run, loaded.limits, window));
        }

        let total_samples: usize = slots.iter().map(|s| s.run.units().len()).sum();
        info!(
            task_runs = outcome.stats.task_runs,
            skipped = outcome.stats.skipped,
            pending_runs = slots.len(),
            total_samples,
            max_tasks = self.config.effective_max_tasks(),
            "Starting eval set"
        );

        let monitor = ProgressMonitor::start(
            self.counters.clone(),
            total_samples,
            self.config.progress_interval,
        );
        let resources = ResourceRegistry::new(Arc::clone(&self.sandboxes));
        let (started_tx, started_rx) = mpsc::unbounded_channel();
        let mut set = EvalSetRun {
            scheduler: self,
            balancer: ConcurrencyBalancer::from_config(&self.config),
            runner: Arc::new(SampleRunner::new(
                Arc::clone(&self.pipeline),
                resources.clone(),
                self.config.cancel_grace,
            )),
            retry: RetryController::new(self.config.retry_policy()),
            slots,
            workers: JoinSet::new(),
            started_tx,
            started_rx,
            outcome,
        };

        set.drive().await;
        let balancer = set.balancer.clone();
        let mut outcome = set.into_outcome();

        balancer.close();
        let leftovers = resources.teardown().await;
        if leftovers > 0 {
            warn!(count = leftovers, "Tore down sandboxes left behind by interrupted samples");
        }
        monitor.stop().await;

        outcome.stats.models = balancer
            .snapshot()
            .models
            .into_iter()
            .map(|m| ModelStats {
                model: m.model,
                max_connections: m.max_connections,
                effective_cap: m.effective_cap,
            })
            .collect();
        outcome.settle();

        if outcome.success {
            info!(
                finalized = outcome.headers.len(),
                samples_executed = outcome.stats.samples_executed,
                "Eval set succeeded"
            );
        } else {
            warn!(
                finalized = outcome.headers.len(),
                abandoned = outcome.abandoned.len(),
                incomplete = outcome.incomplete.len(),
                "Eval set did not succeed"
            );
        }
        Ok(outcome)
    }

    /// Builds every (task, model) run and adopts what the log store holds.
    async fn load_runs(&self, tasks: &[TaskDefinition]) -> Result<Vec<LoadedRun>, SchedulerError> {
        let mut digests = HashSet::new();
        let mut loaded = Vec::new();
        for task in tasks {
            task.validate()?;
            for model in &self.config.models {
                let mut run = TaskRun::new(task, &model.name, self.config.fail_on_error);
                if !digests.insert(run.signature().digest()) {
                    return Err(SchedulerError::DuplicateRun {
                        task: task.name.clone(),
                        model: model.name.clone(),
                    });
                }

                let signature = Arc::clone(run.signature());
                let (store, sig) = (&self.store, &signature);
                let prior = with_write_retry(self.config.log_write_attempts, "load", move || {
                    store.load(sig)
                })
                .await?;
                let reused = run.hydrate(prior.records);
                // A header only stands for the work set it was written for.
                let units_digest = run.units_digest();
                let finalized = prior.header.filter(|h| {
                    let current = h.units_digest == units_digest;
                    if !current {
                        info!(
                            task = %task.name,
                            model = %model.name,
                            previous_total = h.samples_total,
                            samples_total = run.units().len(),
                            "Work set changed since the run was finalized, resuming it"
                        );
                    }
                    current
                });
                debug!(
                    task = %task.name,
                    model = %model.name,
                    digest = %signature.digest(),
                    reused,
                    finalized = finalized.is_some(),
                    "Loaded prior task run state"
                );
                loaded.push(LoadedRun {
                    run,
                    limits: task.limits.clone(),
                    reused,
                    finalized,
                });
            }
        }
        Ok(loaded)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

struct LoadedRun {
    run: TaskRun,
    limits: SampleLimits,
    reused: usize,
    finalized: Option<TaskRunHeader>,
}

/// Loop-side state of one task run.
struct RunSlot {
    run: TaskRun,
    limits: SampleLimits,
    /// Cancels the current attempt; parent of every unit token.
    attempt_token: CancellationToken,
    /// Units of the current attempt not yet handed to a worker.
    queue: VecDeque<WorkUnit>,
    /// Most workers the run keeps alive at once; a run can never hold more
    /// leases than its model's connection cap.
    window: usize,
    /// Units of the current attempt that have not reported yet.
    dispatched: HashMap<WorkUnitKey, CancellationToken>,
    /// Subset of `dispatched` that holds a lease and is executing.
    running: HashSet<WorkUnitKey>,
    breached: bool,
    /// First unretryable problem seen; the run is abandoned once the
    /// current attempt drains.
    fatal: Option<String>,
    done: bool,
}

impl RunSlot {
    fn new(run: TaskRun, limits: SampleLimits, window: usize) -> Self {
        Self {
            run,
            limits,
            attempt_token: CancellationToken::new(),
            queue: VecDeque::new(),
            window,
            dispatched: HashMap::new(),
            running: HashSet::new(),
            breached: false,
            fatal: None,
            done: false,
        }
    }
}

enum Event {
    Sample(SampleReport),
    RetryDue(usize),
}

struct SampleReport {
    slot: usize,
    key: WorkUnitKey,
    outcome: UnitOutcome,
}

enum UnitOutcome {
    Finished(SampleRecord),
    /// Cancelled while still waiting for a lease.
    NotStarted,
    /// The balancer refused a lease.
    Rejected(BalancerError),
    /// The worker itself panicked outside the pipeline.
    Panicked,
}

enum Next {
    Started((usize, WorkUnitKey)),
    Joined(Option<Result<Event, tokio::task::JoinError>>),
}

struct EvalSetRun<'a> {
    scheduler: &'a Scheduler,
    balancer: ConcurrencyBalancer,
    runner: Arc<SampleRunner>,
    retry: RetryController,
    slots: Vec<RunSlot>,
    workers: JoinSet<Event>,
    started_tx: mpsc::UnboundedSender<(usize, WorkUnitKey)>,
    started_rx: mpsc::UnboundedReceiver<(usize, WorkUnitKey)>,
    outcome: EvalSetOutcome,
}

impl EvalSetRun<'_> {
    async fn drive(&mut self) {
        for idx in 0..self.slots.len() {
            self.start_attempt(idx).await;
        }

        loop {
            let next = tokio::select! {
                biased;
                Some(started) = self.started_rx.recv() => Next::Started(started),
                joined = self.workers.join_next() => Next::Joined(joined),
            };
            match next {
                Next::Started((idx, key)) => {
                    let slot = &mut self.slots[idx];
                    // A report may overtake its start notice.
                    if slot.dispatched.contains_key(&key) {
                        slot.running.insert(key);
                    }
                }
                Next::Joined(None) => break,
                Next::Joined(Some(Ok(Event::Sample(report)))) => self.on_report(report).await,
                Next::Joined(Some(Ok(Event::RetryDue(idx)))) => self.start_attempt(idx).await,
                Next::Joined(Some(Err(e))) => {
                    error!(error = %e, "Scheduler worker task failed");
                }
            }
        }
    }

    /// Queues every outstanding unit of a run and starts the first workers.
    async fn start_attempt(&mut self, idx: usize) {
        let scheduler = self.scheduler;
        if scheduler.cancel.is_cancelled() {
            return;
        }
        let slot = &mut self.slots[idx];
        if slot.done {
            return;
        }

        let units = slot.run.dispatchable();
        if units.is_empty() {
            self.finish_attempt(idx).await;
            return;
        }

        let attempt = slot.run.begin_attempt();
        slot.attempt_token = scheduler.cancel.child_token();
        slot.breached = false;
        info!(
            task = slot.run.task(),
            model = slot.run.model(),
            attempt,
            units = units.len(),
            outstanding = slot.run.outstanding().len(),
            window = slot.window,
            "Dispatching task run attempt"
        );
        slot.queue = units.into();
        self.fill(idx);
    }

    /// Hands queued units to workers until the run's window is full.
    fn fill(&mut self, idx: usize) {
        let scheduler = self.scheduler;
        let slot = &mut self.slots[idx];
        let run_id = slot.run.id();

        while slot.dispatched.len() < slot.window && !slot.attempt_token.is_cancelled() {
            let Some(unit) = slot.queue.pop_front() else {
                break;
            };
            let key = unit.key();
            let token = slot.attempt_token.child_token();
            slot.dispatched.insert(key.clone(), token.clone());
            let dispatch = Dispatch {
                slot: idx,
                run_id: run_id.clone(),
                record: slot.run.record_snapshot(&key),
                unit,
                limits: slot.limits.clone(),
                deadline: scheduler.config.sample_deadline,
                token,
            };
            let runner = Arc::clone(&self.runner);
            let balancer = self.balancer.clone();
            let started = self.started_tx.clone();
            scheduler.counters.dispatched.fetch_add(1, Ordering::Relaxed);

            self.workers.spawn(async move {
                let outcome = AssertUnwindSafe(execute_unit(&dispatch, runner, balancer, started))
                    .catch_unwind()
                    .await
                    .unwrap_or(UnitOutcome::Panicked);
                Event::Sample(SampleReport {
                    slot: dispatch.slot,
                    key: dispatch.unit.key(),
                    outcome,
                })
            });
        }
    }

    async fn on_report(&mut self, report: SampleReport) {
        let scheduler = self.scheduler;
        let SampleReport { slot: idx, key, outcome } = report;
        let slot = &mut self.slots[idx];
        slot.dispatched.remove(&key);
        slot.running.remove(&key);

        let record = match outcome {
            UnitOutcome::Finished(record) => Some(record),
            UnitOutcome::NotStarted => None,
            UnitOutcome::Rejected(BalancerError::BudgetExhausted(_)) => None,
            UnitOutcome::Rejected(e) => {
                warn!(task = slot.run.task(), sample = %key, error = %e, "Lease refused");
                None
            }
            UnitOutcome::Panicked => {
                let mut record = slot.run.record_snapshot(&key);
                let _ = record.begin();
                let _ = record.fail(SampleFailure::fatal("fault", "sample worker panicked"));
                Some(record)
            }
        };

        if let Some(record) = record {
            let state = record.state;
            let model = slot.run.model().to_string();
            let duration = record
                .duration()
                .map_or(0.0, |d| d.num_milliseconds() as f64 / 1000.0);
            scheduler.metrics.record_sample(state.as_str(), &model, duration);
            scheduler.counters.record(state);
            self.outcome.stats.samples_executed += 1;

            let fatal = record
                .last_error
                .as_ref()
                .filter(|f| state == SampleState::Failed && f.is_fatal())
                .map(|f| f.to_string());

            let signature = Arc::clone(slot.run.signature());
            let store = &scheduler.store;
            let (sig, key_ref, record_ref) = (&signature, &key, &record);
            let written = with_write_retry(scheduler.config.log_write_attempts, "append", move || {
                store.append(sig, key_ref, record_ref)
            })
            .await;

            if let Err(e) = slot.run.apply(&key, record) {
                error!(task = slot.run.task(), sample = %key, error = %e, "Rejected sample record");
            }

            let halt_reason = match (written, fatal) {
                (Err(e), _) => Some(format!("log store: {}", e)),
                (Ok(()), Some(cause)) => Some(cause),
                (Ok(()), None) => None,
            };
            if let Some(reason) = halt_reason {
                if slot.fatal.is_none() {
                    error!(
                        task = slot.run.task(),
                        model = %model,
                        sample = %key,
                        reason = %reason,
                        "Unretryable failure, stopping task run"
                    );
                    slot.fatal = Some(reason);
                    slot.attempt_token.cancel();
                    self.balancer.abandon(&slot.run.id());
                }
            } else if !slot.breached && slot.run.tolerance_breached() {
                slot.breached = true;
                let counts = slot.run.counts();
                warn!(
                    task = slot.run.task(),
                    model = %model,
                    failed = counts.failed,
                    total = counts.total,
                    running = slot.running.len(),
                    "Failure tolerance exceeded, cancelling running samples"
                );
                for running in &slot.running {
                    if let Some(token) = slot.dispatched.get(running) {
                        token.cancel();
                    }
                }
            }
        }

        if slot.fatal.is_some() {
            slot.queue.clear();
        }
        self.fill(idx);
        if self.slots[idx].dispatched.is_empty() {
            self.finish_attempt(idx).await;
        }
    }

    /// Decides what happens to a run once its attempt has drained.
    async fn finish_attempt(&mut self, idx: usize) {
        let scheduler = self.scheduler;
        if scheduler.cancel.is_cancelled() {
            return;
        }
        let slot = &mut self.slots[idx];
        let run_id = slot.run.id();

        let status = slot.run.status();
        if slot.fatal.is_none() && status == TaskRunStatus::Success {
            slot.run.complete();
            let store = &scheduler.store;
            let run = &slot.run;
            let finalized = with_write_retry(scheduler.config.log_write_attempts, "finalize", move || {
                store.finalize(run)
            })
            .await;
            match finalized {
                Ok(result) => {
                    let header = result.into_header();
                    info!(
                        task = %header.task,
                        model = %header.model,
                        status = %header.status,
                        attempts = slot.run.attempts(),
                        location = %header.location,
                        "Task run finalized"
                    );
                    scheduler.metrics.record_task_run(&header.status.to_string());
                    self.retry.on_success(&run_id);
                    self.outcome.headers.push(header);
                    slot.done = true;
                    return;
                }
                Err(e) => slot.fatal = Some(format!("log store: {}", e)),
            }
        }

        let class = if slot.fatal.is_some() {
            ErrorClass::Fatal
        } else {
            ErrorClass::Retryable
        };
        match self.retry.on_failure(&run_id, class) {
            RetryDecision::Retry {
                attempt,
                wait,
                connection_scale_factor,
            } => {
                let readmitted = slot.run.readmit_failed();
                self.balancer
                    .scale_down(slot.run.model(), connection_scale_factor);
                scheduler.counters.retries.fetch_add(1, Ordering::Relaxed);
                scheduler.metrics.record_retry(slot.run.model());
                self.outcome.stats.retries += 1;
                info!(
                    task = slot.run.task(),
                    model = slot.run.model(),
                    retry = attempt,
                    readmitted,
                    outstanding = slot.run.outstanding().len(),
                    wait_secs = wait.as_secs_f64(),
                    "Task run attempt failed, retrying after backoff"
                );
                self.schedule_retry(idx, wait);
            }
            RetryDecision::Abandon { reason, .. } => self.abandon(idx, reason).await,
        }
    }

    fn schedule_retry(&mut self, idx: usize, wait: Duration) {
        let token = self.scheduler.cancel.clone();
        self.workers.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = token.cancelled() => {}
            }
            Event::RetryDue(idx)
        });
    }

    async fn abandon(&mut self, idx: usize, reason: AbandonReason) {
        let scheduler = self.scheduler;
        let slot = &mut self.slots[idx];
        slot.run.abandon();
        slot.done = true;
        self.balancer.abandon(&slot.run.id());

        let last_error = slot
            .fatal
            .clone()
            .or_else(|| slot.run.last_error().map(|e| e.to_string()));

        let store = &scheduler.store;
        let run = &slot.run;
        let remove = scheduler.config.cleanup_logs;
        let cleaned = with_write_retry(scheduler.config.log_write_attempts, "cleanup", move || {
            store.cleanup(run, remove)
        })
        .await;
        let log_location = match cleaned {
            Ok(CleanupOutcome::Removed) => None,
            Ok(CleanupOutcome::Retained { location }) => Some(location),
            Err(e) => {
                warn!(task = run.task(), model = run.model(), error = %e, "Failed to clean up logs of abandoned task run");
                Some(store.location(run.signature()))
            }
        };

        error!(
            task = run.task(),
            model = run.model(),
            attempts = run.attempts(),
            reason = %reason,
            last_error = last_error.as_deref().unwrap_or("none"),
            "Task run abandoned"
        );
        scheduler.metrics.record_task_run("abandoned");
        self.outcome.abandoned.push(AbandonedRun {
            task: run.task().to_string(),
            model: run.model().to_string(),
            attempts: run.attempts(),
            reason: reason.to_string(),
            last_error,
            log_location,
        });
    }

    fn into_outcome(self) -> EvalSetOutcome {
        let mut outcome = self.outcome;
        for slot in self.slots.iter().filter(|s| !s.done) {
            warn!(
                task = slot.run.task(),
                model = slot.run.model(),
                "Task run interrupted before it finished"
            );
            outcome.incomplete.push(IncompleteRun {
                task: slot.run.task().to_string(),
                model: slot.run.model().to_string(),
                counts: slot.run.counts(),
            });
        }
        outcome
    }
}

/// Everything a worker needs to run one unit.
struct Dispatch {
    slot: usize,
    run_id: String,
    unit: WorkUnit,
    record: SampleRecord,
    limits: SampleLimits,
    deadline: Option<Duration>,
    token: CancellationToken,
}

async fn execute_unit(
    dispatch: &Dispatch,
    runner: Arc<SampleRunner>,
    balancer: ConcurrencyBalancer,
    started: mpsc::UnboundedSender<(usize, WorkUnitKey)>,
) -> UnitOutcome {
    let lease = tokio::select! {
        biased;
        _ = dispatch.token.cancelled() => return UnitOutcome::NotStarted,
        acquired = balancer.acquire(&dispatch.unit.model, &dispatch.run_id) => match acquired {
            Ok(lease) => lease,
            Err(e) => return UnitOutcome::Rejected(e),
        },
    };

    let _ = started.send((dispatch.slot, dispatch.unit.key()));
    let record = runner
        .run(
            &dispatch.unit,
            dispatch.record.clone(),
            dispatch.deadline,
            &dispatch.limits,
            &dispatch.token,
        )
        .await;
    drop(lease);
    UnitOutcome::Finished(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logstore::{FinalizeOutcome, MemoryLogStore, PriorRun};
    use crate::runner::{NoSandbox, SampleError, SampleOutput, SampleRequest};
    use crate::task::TaskSignature;
    use crate::work::FailOnError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Succeeds on everything except the listed sample ids, which fail with
    /// the given error on every call.
    struct FixedPipeline {
        calls: AtomicUsize,
        transient: Vec<&'static str>,
        fatal: Vec<&'static str>,
    }

    impl FixedPipeline {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                transient: Vec::new(),
                fatal: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl SamplePipeline for FixedPipeline {
        async fn execute(&self, request: SampleRequest) -> Result<SampleOutput, SampleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            let id = request.unit.sample_id.as_str();
            if self.fatal.contains(&id) {
                return Err(SampleError::Configuration("scorer is misconfigured".into()));
            }
            if self.transient.contains(&id) {
                return Err(SampleError::RateLimited("429".into()));
            }
            Ok(SampleOutput::new(json!({ "score": 1 })))
        }
    }

    fn config() -> EvalSetConfig {
        EvalSetConfig::new()
            .with_model("m1", 4)
            .with_retry_attempts(3)
            .with_retry_wait(Duration::from_secs(1))
    }

    fn scheduler(config: EvalSetConfig, store: Arc<MemoryLogStore>, pipeline: Arc<FixedPipeline>) -> Scheduler {
        Scheduler::new(config, store, pipeline, Arc::new(NoSandbox))
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_finalizes() {
        let store = Arc::new(MemoryLogStore::new());
        let pipeline = Arc::new(FixedPipeline::new());
        let task = TaskDefinition::new("arith", ["a", "b", "c"]);

        let outcome = scheduler(config(), store.clone(), pipeline.clone())
            .run(&[task])
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.headers.len(), 1);
        assert_eq!(outcome.headers[0].succeeded, 3);
        assert_eq!(outcome.stats.samples_executed, 3);
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tolerated_failures_still_finalize() {
        let store = Arc::new(MemoryLogStore::new());
        let mut pipeline = FixedPipeline::new();
        pipeline.transient = vec!["b"];
        let pipeline = Arc::new(pipeline);
        let task = TaskDefinition::new("arith", ["a", "b", "c", "d"]);

        let outcome = scheduler(
            config().with_fail_on_error(FailOnError::Count(1)),
            store,
            pipeline.clone(),
        )
        .run(&[task])
        .await
        .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.headers[0].failed, 1);
        assert_eq!(outcome.stats.retries, 0);
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_failure_is_abandoned() {
        let store = Arc::new(MemoryLogStore::new());
        let mut pipeline = FixedPipeline::new();
        pipeline.transient = vec!["b"];
        let pipeline = Arc::new(pipeline);
        let task = TaskDefinition::new("arith", ["a", "b"]);

        let outcome = scheduler(config(), store.clone(), pipeline.clone())
            .run(&[task.clone()])
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.abandoned.len(), 1);
        assert_eq!(outcome.abandoned[0].attempts, 3);
        assert_eq!(outcome.abandoned[0].reason, "retry attempts exhausted");
        assert_eq!(outcome.stats.retries, 2);
        // a once, b on each of the three attempts.
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 4);
        // cleanup_logs defaults to true.
        assert!(!store.contains(&task.signature("m1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_abandons_without_retry() {
        let store = Arc::new(MemoryLogStore::new());
        let mut pipeline = FixedPipeline::new();
        pipeline.fatal = vec!["a"];
        let pipeline = Arc::new(pipeline);
        let task = TaskDefinition::new("arith", ["a"]);

        let outcome = scheduler(config().with_cleanup_logs(false), store.clone(), pipeline.clone())
            .run(&[task.clone()])
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.stats.retries, 0);
        let abandoned = &outcome.abandoned[0];
        assert_eq!(abandoned.reason, "fatal error");
        assert!(abandoned
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("misconfigured")));
        assert!(abandoned.log_location.is_some());
        assert!(store.contains(&task.signature("m1")));
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_run_is_rejected() {
        let store = Arc::new(MemoryLogStore::new());
        let task = TaskDefinition::new("arith", ["a"]);
        let err = scheduler(config(), store, Arc::new(FixedPipeline::new()))
            .run(&[task.clone(), task])
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateRun { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_reports_outstanding_work() {
        let store = Arc::new(MemoryLogStore::new());
        let pipeline = Arc::new(FixedPipeline::new());
        let done = TaskDefinition::new("done", ["a", "b"]);
        let fresh = TaskDefinition::new("fresh", ["x", "y", "z"]);

        let sched = scheduler(config(), store.clone(), pipeline.clone());
        sched.run(&[done.clone()]).await.unwrap();

        let plans = sched.plan(&[done, fresh]).await.unwrap();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].outstanding, 0);
        assert!(plans[0].finalized.is_some());
        assert_eq!(plans[1].outstanding, 3);
        assert_eq!(plans[1].reusable, 0);
        assert!(plans[1].location.starts_with("memory://fresh/m1/"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_invocation_is_incomplete() {
        let store = Arc::new(MemoryLogStore::new());
        let pipeline = Arc::new(FixedPipeline::new());
        let task = TaskDefinition::new("arith", ["a", "b"]);

        let sched = scheduler(config(), store, pipeline.clone());
        sched.cancellation_token().cancel();
        let outcome = sched.run(&[task]).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.incomplete.len(), 1);
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 0);
    }

    /// First call of `slow` hangs for an hour and first call of `bad` is
    /// rate limited; every later call succeeds.
    struct FirstCallPipeline {
        calls: Mutex<HashMap<String, u32>>,
    }

    impl FirstCallPipeline {
        fn calls(&self, id: &str) -> u32 {
            self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl SamplePipeline for FirstCallPipeline {
        async fn execute(&self, request: SampleRequest) -> Result<SampleOutput, SampleError> {
            let id = request.unit.sample_id.as_str().to_string();
            let n = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(id.clone()).or_insert(0);
                *n += 1;
                *n
            };
            match (id.as_str(), n) {
                ("slow", 1) => tokio::time::sleep(Duration::from_secs(3600)).await,
                ("bad", 1) => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    return Err(SampleError::RateLimited("429".into()));
                }
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
            Ok(SampleOutput::new(json!({ "score": 1 })))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_breach_cancels_running_samples() {
        let pipeline = Arc::new(FirstCallPipeline {
            calls: Mutex::new(HashMap::new()),
        });
        let sched = Scheduler::new(
            config().with_cancel_grace(Duration::from_secs(30)),
            Arc::new(MemoryLogStore::new()),
            pipeline.clone(),
            Arc::new(NoSandbox),
        );
        let task = TaskDefinition::new("arith", ["slow", "bad"]);
        let start = tokio::time::Instant::now();

        let outcome = sched.run(&[task]).await.unwrap();

        assert!(outcome.success);
        // The hour-long sample was cut at the grace period, then retried.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed < Duration::from_secs(60));
        assert_eq!(sched.counters().cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.calls("slow"), 2);
        assert_eq!(pipeline.calls("bad"), 2);
        assert_eq!(outcome.headers[0].attempts, 2);
        assert_eq!(outcome.headers[0].succeeded, 2);
    }

    /// Memory store whose appends for one sample always fail.
    struct BrokenAppends {
        inner: MemoryLogStore,
        sample: &'static str,
    }

    #[async_trait]
    impl LogStore for BrokenAppends {
        async fn load(&self, signature: &TaskSignature) -> Result<PriorRun, LogStoreError> {
            self.inner.load(signature).await
        }

        async fn append(
            &self,
            signature: &TaskSignature,
            key: &WorkUnitKey,
            record: &SampleRecord,
        ) -> Result<(), LogStoreError> {
            if key.sample_id.as_str() == self.sample {
                return Err(LogStoreError::Io(std::io::Error::other("disk full")));
            }
            self.inner.append(signature, key, record).await
        }

        async fn finalize(&self, run: &TaskRun) -> Result<FinalizeOutcome, LogStoreError> {
            self.inner.finalize(run).await
        }

        async fn cleanup(&self, run: &TaskRun, remove: bool) -> Result<CleanupOutcome, LogStoreError> {
            self.inner.cleanup(run, remove).await
        }

        fn location(&self, signature: &TaskSignature) -> String {
            self.inner.location(signature)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_write_failure_abandons_run() {
        let pipeline = Arc::new(FixedPipeline::new());
        let store = Arc::new(BrokenAppends {
            inner: MemoryLogStore::new(),
            sample: "x",
        });
        let config = EvalSetConfig::new()
            .with_model("m1", 1)
            .with_max_tasks(1)
            .with_log_write_attempts(2)
            .with_cleanup_logs(false);
        let broken = TaskDefinition::new("broken", ["x", "a", "b"]);
        let other = TaskDefinition::new("other", ["o"]);

        let outcome = Scheduler::new(config, store, pipeline.clone(), Arc::new(NoSandbox))
            .run(&[broken, other])
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.stats.retries, 0);
        let abandoned = &outcome.abandoned[0];
        assert_eq!(abandoned.task, "broken");
        assert_eq!(abandoned.reason, "fatal error");
        assert_eq!(abandoned.attempts, 1);
        assert!(abandoned
            .last_error
            .as_deref()
            .is_some_and(|e| e.starts_with("log store:")));

        // "a" and "b" never ran; the lease went to the other run.
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 2);
        assert!(outcome.header("other", "m1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_bounded_by_model_window() {
        let pipeline = Arc::new(FixedPipeline::new());
        let sched = scheduler(
            EvalSetConfig::new().with_model("m1", 2).with_max_tasks(8),
            Arc::new(MemoryLogStore::new()),
            pipeline.clone(),
        );
        let counters = sched.counters().clone();
        let watcher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            counters.dispatched.load(Ordering::SeqCst)
        });
        let task = TaskDefinition::new("arith", ["a", "b", "c", "d", "e", "f"]);

        let outcome = sched.run(&[task]).await.unwrap();

        assert!(outcome.success);
        assert_eq!(watcher.await.unwrap(), 2);
        assert_eq!(sched.counters().dispatched.load(Ordering::SeqCst), 6);
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 6);
    }
}
