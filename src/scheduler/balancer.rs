//! Admission control for sample dispatch.
//!
//! The balancer hands out [`Lease`]s under two caps: a global `max_tasks`
//! and a per-model cap of `floor(max_connections * scale)` (at least one),
//! where `scale` shrinks as that model's task runs are retried. When several
//! models have waiters, free global slots are spread across them by the
//! configured [`FairnessPolicy`] instead of first-come-first-served.
//!
//! Counters live behind one mutex that is only held for bookkeeping, never
//! across an await.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::metrics::MetricsCollector;

use super::config::{EvalSetConfig, FairnessPolicy};
use super::retry::RetryPolicy;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BalancerError {
    /// The task run has spent its retry budget; its work is unschedulable.
    #[error("retry budget of task run {0} is exhausted")]
    BudgetExhausted(String),

    #[error("model {0} is not registered with the balancer")]
    UnknownModel(String),

    #[error("balancer is closed")]
    Closed,
}

struct Waiter {
    run: String,
    tx: oneshot::Sender<Result<Lease, BalancerError>>,
}

struct ModelSlot {
    name: String,
    max_connections: usize,
    scale: f64,
    in_flight: usize,
    waiters: VecDeque<Waiter>,
}

impl ModelSlot {
    fn cap(&self) -> usize {
        RetryPolicy::effective_cap(self.max_connections, self.scale)
    }

    fn admissible(&self) -> bool {
        !self.waiters.is_empty() && self.in_flight < self.cap()
    }

    /// Share of the model's cap already in use.
    fn load(&self) -> f64 {
        self.in_flight as f64 / self.cap() as f64
    }
}

struct BalancerState {
    max_tasks: usize,
    in_flight: usize,
    models: Vec<ModelSlot>,
    cursor: usize,
    abandoned: HashSet<String>,
    closed: bool,
}

impl BalancerState {
    fn slot_mut(&mut self, model: &str) -> Option<&mut ModelSlot> {
        self.models.iter_mut().find(|slot| slot.name == model)
    }

    /// Index of the model that receives the next free global slot.
    fn pick(&mut self, policy: FairnessPolicy) -> Option<usize> {
        let n = self.models.len();
        let order = (0..n).map(|i| (self.cursor + i) % n);
        let picked = match policy {
            FairnessPolicy::RoundRobin => order
                .into_iter()
                .find(|&idx| self.models[idx].admissible()),
            FairnessPolicy::Weighted => {
                let mut best: Option<usize> = None;
                for idx in order {
                    let slot = &self.models[idx];
                    if !slot.admissible() {
                        continue;
                    }
                    if best.map_or(true, |b| slot.load() < self.models[b].load()) {
                        best = Some(idx);
                    }
                }
                best
            }
        };
        if let Some(idx) = picked {
            self.cursor = (idx + 1) % n;
        }
        picked
    }
}

struct Inner {
    state: Mutex<BalancerState>,
    policy: FairnessPolicy,
    metrics: MetricsCollector,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BalancerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(self: &Arc<Self>, model: &str) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if let Some(slot) = state.slot_mut(model) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
            self.metrics.update_leases(model, slot.in_flight);
        }
        self.dispatch(&mut state);
    }

    /// Grants leases to waiters while both caps allow it.
    fn dispatch(self: &Arc<Self>, state: &mut BalancerState) {
        while !state.closed && state.in_flight < state.max_tasks {
            let Some(idx) = state.pick(self.policy) else {
                break;
            };
            let slot = &mut state.models[idx];
            let Some(waiter) = slot.waiters.pop_front() else {
                continue;
            };
            if waiter.tx.is_closed() {
                continue;
            }

            slot.in_flight += 1;
            state.in_flight += 1;
            let lease = Lease {
                inner: Some(Arc::clone(self)),
                model: slot.name.clone(),
            };
            if let Err(rejected) = waiter.tx.send(Ok(lease)) {
                // The acquirer went away between the check and the send.
                if let Ok(mut lease) = rejected {
                    lease.inner = None;
                }
                slot.in_flight -= 1;
                state.in_flight -= 1;
                continue;
            }
            debug!(
                model = %slot.name,
                run = %waiter.run,
                model_in_flight = slot.in_flight,
                global_in_flight = state.in_flight,
                "Lease granted"
            );
            self.metrics.update_leases(&slot.name, slot.in_flight);
        }
    }
}

/// A granted concurrency slot. Dropping it returns the slot.
pub struct Lease {
    inner: Option<Arc<Inner>>,
    model: String,
}

impl Lease {
    pub fn model(&self) -> &str {
        &self.model
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release(&self.model);
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("model", &self.model).finish()
    }
}

/// Point-in-time usage of one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelUsage {
    pub model: String,
    pub max_connections: usize,
    pub scale: f64,
    pub effective_cap: usize,
    pub in_flight: usize,
    pub waiting: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BalancerSnapshot {
    pub max_tasks: usize,
    pub in_flight: usize,
    pub models: Vec<ModelUsage>,
}

/// Shared admission controller. Cheap to clone.
#[derive(Clone)]
pub struct ConcurrencyBalancer {
    inner: Arc<Inner>,
}

impl ConcurrencyBalancer {
    pub fn new(max_tasks: usize, policy: FairnessPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BalancerState {
                    max_tasks: max_tasks.max(1),
                    in_flight: 0,
                    models: Vec::new(),
                    cursor: 0,
                    abandoned: HashSet::new(),
                    closed: false,
                }),
                policy,
                metrics: MetricsCollector::new(),
            }),
        }
    }

    /// Builds a balancer with every configured model registered.
    pub fn from_config(config: &EvalSetConfig) -> Self {
        let balancer = Self::new(config.effective_max_tasks(), config.fairness);
        for model in &config.models {
            balancer.register_model(&model.name, model.max_connections);
        }
        balancer
    }

    pub fn policy(&self) -> FairnessPolicy {
        self.inner.policy
    }

    /// Registers `model` with its configured connection limit. Registering
    /// an existing model updates its limit and keeps its scale.
    pub fn register_model(&self, model: &str, max_connections: usize) {
        let mut state = self.inner.lock();
        let max_connections = max_connections.max(1);
        match state.slot_mut(model) {
            Some(slot) => slot.max_connections = max_connections,
            None => state.models.push(ModelSlot {
                name: model.to_string(),
                max_connections,
                scale: 1.0,
                in_flight: 0,
                waiters: VecDeque::new(),
            }),
        }
        self.inner.dispatch(&mut state);
    }

    /// Waits for a slot on `model` on behalf of task run `run`.
    ///
    /// Fails fast with [`BalancerError::BudgetExhausted`] once `run` has been
    /// abandoned, including while already waiting.
    pub async fn acquire(&self, model: &str, run: &str) -> Result<Lease, BalancerError> {
        let rx = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(BalancerError::Closed);
            }
            if state.abandoned.contains(run) {
                return Err(BalancerError::BudgetExhausted(run.to_string()));
            }
            let Some(slot) = state.slot_mut(model) else {
                return Err(BalancerError::UnknownModel(model.to_string()));
            };
            let (tx, rx) = oneshot::channel();
            slot.waiters.push_back(Waiter {
                run: run.to_string(),
                tx,
            });
            self.inner.dispatch(&mut state);
            rx
        };
        rx.await.unwrap_or(Err(BalancerError::Closed))
    }

    /// Returns a lease early. Equivalent to dropping it.
    pub fn release(&self, lease: Lease) {
        drop(lease);
    }

    /// Marks `run` as out of budget and fails its pending acquisitions.
    pub fn abandon(&self, run: &str) {
        let mut state = self.inner.lock();
        if !state.abandoned.insert(run.to_string()) {
            return;
        }
        let mut rejected = 0;
        for slot in &mut state.models {
            let (theirs, others): (VecDeque<_>, VecDeque<_>) =
                slot.waiters.drain(..).partition(|w| w.run == run);
            slot.waiters = others;
            for waiter in theirs {
                rejected += 1;
                let _ = waiter
                    .tx
                    .send(Err(BalancerError::BudgetExhausted(run.to_string())));
            }
        }
        debug!(run, rejected, "Rejected pending acquisitions of abandoned run");
    }

    /// Lowers `model`'s connection scale to `scale` if that is smaller than
    /// the current one. Held leases are not revoked; the new cap applies to
    /// subsequent grants.
    pub fn scale_down(&self, model: &str, scale: f64) {
        let mut state = self.inner.lock();
        if let Some(slot) = state.slot_mut(model) {
            if scale < slot.scale {
                slot.scale = scale;
                info!(
                    model,
                    connection_scale = scale,
                    effective_cap = slot.cap(),
                    "Reduced model connection cap"
                );
            }
        }
    }

    pub fn effective_cap(&self, model: &str) -> Option<usize> {
        let mut state = self.inner.lock();
        state.slot_mut(model).map(|slot| slot.cap())
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// Fails every pending acquisition and refuses new ones.
    pub fn close(&self) {
        let mut state = self.inner.lock();
        state.closed = true;
        for slot in &mut state.models {
            for waiter in slot.waiters.drain(..) {
                let _ = waiter.tx.send(Err(BalancerError::Closed));
            }
        }
    }

    pub fn snapshot(&self) -> BalancerSnapshot {
        let state = self.inner.lock();
        BalancerSnapshot {
            max_tasks: state.max_tasks,
            in_flight: state.in_flight,
            models: state
                .models
                .iter()
                .map(|slot| ModelUsage {
                    model: slot.name.clone(),
                    max_connections: slot.max_connections,
                    scale: slot.scale,
                    effective_cap: slot.cap(),
                    in_flight: slot.in_flight,
                    waiting: slot.waiters.len(),
                })
                .collect(),
        }
    }
}

impl std::fmt::Debug for ConcurrencyBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyBalancer")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::task::JoinHandle;

    /// Spawns an acquisition and lets it enqueue before returning.
    async fn spawn_acquire(
        balancer: &ConcurrencyBalancer,
        model: &str,
        run: &str,
    ) -> JoinHandle<Result<Lease, BalancerError>> {
        let balancer = balancer.clone();
        let (model, run) = (model.to_string(), run.to_string());
        let handle = tokio::spawn(async move { balancer.acquire(&model, &run).await });
        tokio::task::yield_now().await;
        handle
    }

    #[tokio::test]
    async fn test_global_cap() {
        let balancer = ConcurrencyBalancer::new(2, FairnessPolicy::RoundRobin);
        balancer.register_model("a", 10);

        let first = balancer.acquire("a", "t/a").await.unwrap();
        let _second = balancer.acquire("a", "t/a").await.unwrap();
        let third = spawn_acquire(&balancer, "a", "t/a").await;

        assert_eq!(balancer.in_flight(), 2);
        assert!(!third.is_finished());

        balancer.release(first);
        let third = third.await.unwrap().unwrap();
        assert_eq!(third.model(), "a");
        assert_eq!(balancer.in_flight(), 2);
    }

    #[tokio::test]
    async fn test_model_cap_and_scale_down() {
        let balancer = ConcurrencyBalancer::new(10, FairnessPolicy::RoundRobin);
        balancer.register_model("a", 4);
        assert_eq!(balancer.effective_cap("a"), Some(4));

        balancer.scale_down("a", 0.5);
        assert_eq!(balancer.effective_cap("a"), Some(2));
        // Never raised by a later, larger scale.
        balancer.scale_down("a", 0.75);
        assert_eq!(balancer.effective_cap("a"), Some(2));

        let _l1 = balancer.acquire("a", "t/a").await.unwrap();
        let _l2 = balancer.acquire("a", "t/a").await.unwrap();
        let blocked = spawn_acquire(&balancer, "a", "t/a").await;
        assert!(!blocked.is_finished());
        assert_eq!(balancer.snapshot().models[0].waiting, 1);

        balancer.scale_down("a", 0.01);
        assert_eq!(balancer.effective_cap("a"), Some(1));
    }

    #[tokio::test]
    async fn test_abandon_fails_waiters_and_new_acquires() {
        let balancer = ConcurrencyBalancer::new(1, FairnessPolicy::RoundRobin);
        balancer.register_model("a", 1);

        let held = balancer.acquire("a", "t1/a").await.unwrap();
        let doomed = spawn_acquire(&balancer, "a", "t2/a").await;
        let survivor = spawn_acquire(&balancer, "a", "t1/a").await;

        balancer.abandon("t2/a");
        assert_eq!(
            doomed.await.unwrap().unwrap_err(),
            BalancerError::BudgetExhausted("t2/a".into())
        );
        assert!(matches!(
            balancer.acquire("a", "t2/a").await,
            Err(BalancerError::BudgetExhausted(_))
        ));

        drop(held);
        assert!(survivor.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unknown_model_and_close() {
        let balancer = ConcurrencyBalancer::new(1, FairnessPolicy::RoundRobin);
        assert_eq!(
            balancer.acquire("nope", "t/nope").await.unwrap_err(),
            BalancerError::UnknownModel("nope".into())
        );

        balancer.register_model("a", 1);
        let _held = balancer.acquire("a", "t/a").await.unwrap();
        let pending = spawn_acquire(&balancer, "a", "t/a").await;
        balancer.close();
        assert_eq!(pending.await.unwrap().unwrap_err(), BalancerError::Closed);
        assert_eq!(
            balancer.acquire("a", "t/a").await.unwrap_err(),
            BalancerError::Closed
        );
    }

    #[tokio::test]
    async fn test_dropped_acquire_does_not_leak_slot() {
        let balancer = ConcurrencyBalancer::new(1, FairnessPolicy::RoundRobin);
        balancer.register_model("a", 1);

        let held = balancer.acquire("a", "t/a").await.unwrap();
        let abandoned_wait = spawn_acquire(&balancer, "a", "t/a").await;
        abandoned_wait.abort();
        let _ = abandoned_wait.await;

        drop(held);
        assert_eq!(balancer.in_flight(), 0);
        let again = balancer.acquire("a", "t/a").await.unwrap();
        assert_eq!(balancer.in_flight(), 1);
        drop(again);
        assert_eq!(balancer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_round_robin_alternates_between_models() {
        let balancer = ConcurrencyBalancer::new(1, FairnessPolicy::RoundRobin);
        balancer.register_model("a", 10);
        balancer.register_model("b", 10);

        let grants = Arc::new(StdMutex::new(Vec::new()));
        let first = balancer.acquire("a", "t/a").await.unwrap();

        let mut handles = Vec::new();
        // Model a's backlog is queued entirely before model b's.
        for (model, run) in [("a", "t/a"), ("a", "t/a"), ("b", "t/b"), ("b", "t/b")] {
            let balancer = balancer.clone();
            let grants = Arc::clone(&grants);
            handles.push(tokio::spawn(async move {
                let lease = balancer.acquire(model, run).await.unwrap();
                grants.lock().unwrap().push(lease.model().to_string());
                tokio::task::yield_now().await;
                drop(lease);
            }));
            tokio::task::yield_now().await;
        }

        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*grants.lock().unwrap(), vec!["b", "a", "b", "a"]);
    }

    #[tokio::test]
    async fn test_weighted_prefers_least_loaded_model() {
        let balancer = ConcurrencyBalancer::new(3, FairnessPolicy::Weighted);
        balancer.register_model("big", 4);
        balancer.register_model("small", 2);

        let _b1 = balancer.acquire("big", "t/big").await.unwrap();
        let _s1 = balancer.acquire("small", "t/small").await.unwrap();
        let b2 = balancer.acquire("big", "t/big").await.unwrap();

        let big = spawn_acquire(&balancer, "big", "t/big").await;
        let small = spawn_acquire(&balancer, "small", "t/small").await;
        assert!(!big.is_finished() && !small.is_finished());

        // big drops to 1/4 while small stays at 1/2.
        drop(b2);
        let granted = big.await.unwrap().unwrap();
        assert_eq!(granted.model(), "big");
        tokio::task::yield_now().await;
        assert!(!small.is_finished());
    }
}
