//! Sample runner: drives one work unit through sandbox, pipeline and limits.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::work::{SampleRecord, SampleState, WorkUnit};

use super::error::SampleError;
use super::limits::{LimitKind, SampleLimits};
use super::pipeline::{SampleOutput, SamplePipeline, SampleRequest};
use super::sandbox::ResourceRegistry;

/// Which wall-clock bound fires first.
#[derive(Debug, Clone, Copy)]
enum Expiry {
    /// The sample's own time limit: a design limit, not retried.
    TimeLimit(Duration),
    /// The scheduler's deadline: an infrastructure timeout, retried.
    Deadline(Duration),
}

impl Expiry {
    fn pick(time_limit: Option<Duration>, deadline: Option<Duration>) -> Option<Self> {
        match (time_limit, deadline) {
            (Some(limit), Some(deadline)) if deadline < limit => Some(Expiry::Deadline(deadline)),
            (Some(limit), _) => Some(Expiry::TimeLimit(limit)),
            (None, Some(deadline)) => Some(Expiry::Deadline(deadline)),
            (None, None) => None,
        }
    }

    fn duration(&self) -> Duration {
        match *self {
            Expiry::TimeLimit(d) | Expiry::Deadline(d) => d,
        }
    }

    fn into_error(self) -> SampleError {
        match self {
            Expiry::TimeLimit(d) => SampleError::limit(
                LimitKind::Time,
                format!("sample exceeded its time limit of {:.1}s", d.as_secs_f64()),
            ),
            Expiry::Deadline(d) => SampleError::Timeout(format!(
                "sample missed its {:.1}s deadline",
                d.as_secs_f64()
            )),
        }
    }
}

enum Outcome {
    Finished(Result<SampleOutput, SampleError>),
    Cancelled,
}

/// Runs single samples. Has no view of any other work unit.
pub struct SampleRunner {
    pipeline: Arc<dyn SamplePipeline>,
    resources: ResourceRegistry,
    cancel_grace: Duration,
}

impl SampleRunner {
    pub fn new(
        pipeline: Arc<dyn SamplePipeline>,
        resources: ResourceRegistry,
        cancel_grace: Duration,
    ) -> Self {
        Self {
            pipeline,
            resources,
            cancel_grace,
        }
    }

    /// Executes `unit` starting from the scheduler's `Pending` snapshot of its
    /// record and returns the record in a terminal state.
    ///
    /// Errors never escape: every failure, panic, timeout and cancellation is
    /// folded into the returned record.
    pub async fn run(
        &self,
        unit: &WorkUnit,
        mut record: SampleRecord,
        deadline: Option<Duration>,
        limits: &SampleLimits,
        cancel: &CancellationToken,
    ) -> SampleRecord {
        if let Err(e) = record.begin() {
            error!(unit = %unit, error = %e, "Runner received a record that is not pending");
            return record;
        }
        let attempt = record.attempt_count;
        let start = Instant::now();
        debug!(unit = %unit, attempt, "Starting sample");

        let sandbox = tokio::select! {
            biased;
            acquired = self.resources.acquire(unit, unit.signature.sandbox.as_ref()) => acquired,
            _ = cancel.cancelled() => {
                settle(unit, &mut record, |r| r.cancel("cancelled before the sandbox was ready"));
                return record;
            }
        };
        let sandbox = match sandbox {
            Ok(handle) => handle,
            Err(e) => {
                let failure = SampleError::from(e).to_failure();
                warn!(unit = %unit, attempt, error = %failure, "Sandbox initialization failed");
                settle(unit, &mut record, |r| r.fail(failure));
                return record;
            }
        };

        let request = SampleRequest {
            unit: unit.clone(),
            sandbox: sandbox.clone(),
            limits: limits.clone(),
            attempt,
            cancel: cancel.clone(),
        };
        let outcome = self.execute(request, limits, deadline, cancel).await;

        self.resources.release(&sandbox).await;

        match outcome {
            Outcome::Finished(Ok(output)) => match limits.check_usage(&output.usage) {
                Some((kind, detail)) => {
                    let failure = SampleError::limit(kind, detail).to_failure();
                    settle(unit, &mut record, |r| r.exceed_limit(failure, Some(output.result)));
                }
                None => settle(unit, &mut record, |r| r.succeed(output.result)),
            },
            Outcome::Finished(Err(mut e)) => {
                let failure = e.to_failure();
                match e.state() {
                    SampleState::LimitExceeded => {
                        let partial = match &mut e {
                            SampleError::LimitExceeded { partial, .. } => partial.take(),
                            _ => None,
                        };
                        settle(unit, &mut record, |r| r.exceed_limit(failure, partial));
                    }
                    _ => {
                        warn!(
                            unit = %unit,
                            attempt,
                            class = ?failure.class,
                            error = %failure,
                            "Sample failed"
                        );
                        settle(unit, &mut record, |r| r.fail(failure));
                    }
                }
            }
            Outcome::Cancelled => {
                warn!(
                    unit = %unit,
                    grace_secs = self.cancel_grace.as_secs_f64(),
                    "Sample did not finish within the cancellation grace period"
                );
                settle(unit, &mut record, |r| r.cancel("cancelled"));
            }
        }

        info!(
            unit = %unit,
            attempt,
            state = %record.state,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sample finished"
        );
        record
    }

    async fn execute(
        &self,
        request: SampleRequest,
        limits: &SampleLimits,
        deadline: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Outcome {
        let pipeline = Arc::clone(&self.pipeline);
        let guarded = async move {
            match AssertUnwindSafe(pipeline.execute(request)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(SampleError::Fault(format!(
                    "pipeline panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            }
        };

        let expiry = Expiry::pick(limits.time_limit, deadline);
        let bounded = async move {
            match expiry {
                Some(expiry) => match tokio::time::timeout(expiry.duration(), guarded).await {
                    Ok(result) => result,
                    Err(_) => Err(expiry.into_error()),
                },
                None => guarded.await,
            }
        };
        tokio::pin!(bounded);

        tokio::select! {
            biased;
            result = &mut bounded => Outcome::Finished(result),
            _ = cancel.cancelled() => {
                match tokio::time::timeout(self.cancel_grace, &mut bounded).await {
                    Ok(result) => Outcome::Finished(result),
                    Err(_) => Outcome::Cancelled,
                }
            }
        }
    }
}

/// Applies a transition that the runner's own sequencing guarantees.
fn settle<F>(unit: &WorkUnit, record: &mut SampleRecord, transition: F)
where
    F: FnOnce(&mut SampleRecord) -> Result<(), crate::work::TransitionError>,
{
    if let Err(e) = transition(record) {
        error!(unit = %unit, error = %e, "Unexpected sample transition");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
