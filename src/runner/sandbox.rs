//! Sandbox lifecycle around sample execution.
//!
//! Sandbox environments themselves live behind [`SandboxProvider`]. The
//! runner only calls `sample_init` before and `sample_cleanup` after the
//! pipeline; every acquired handle is tracked in a [`ResourceRegistry`]
//! owned by the scheduler so nothing leaks if a sample is aborted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::work::WorkUnit;

/// A sandbox acquired for one sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    /// Unique identifier for this sandbox.
    pub id: String,
    /// Work unit the sandbox was created for.
    pub unit: String,
}

impl SandboxHandle {
    pub fn new(unit: &WorkUnit) -> Self {
        Self {
            id: format!("evalset-sandbox-{}", Uuid::new_v4()),
            unit: unit.to_string(),
        }
    }
}

/// Async lifecycle hooks of a sandbox environment.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Prepares a sandbox for `unit` using the task's sandbox configuration.
    async fn sample_init(
        &self,
        unit: &WorkUnit,
        config: Option<&Value>,
    ) -> Result<SandboxHandle, SandboxError>;

    /// Releases a sandbox. Must tolerate handles whose sample was aborted.
    async fn sample_cleanup(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;
}

/// Provider for tasks that need no isolation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSandbox;

#[async_trait]
impl SandboxProvider for NoSandbox {
    async fn sample_init(
        &self,
        unit: &WorkUnit,
        _config: Option<&Value>,
    ) -> Result<SandboxHandle, SandboxError> {
        Ok(SandboxHandle::new(unit))
    }

    async fn sample_cleanup(&self, _handle: &SandboxHandle) -> Result<(), SandboxError> {
        Ok(())
    }
}

/// Error types for sandbox operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    #[error("Sandbox unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

struct RegistryInner {
    provider: Arc<dyn SandboxProvider>,
    active: Mutex<HashMap<String, SandboxHandle>>,
}

impl RegistryInner {
    fn active(&self) -> MutexGuard<'_, HashMap<String, SandboxHandle>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        let active = self.active.get_mut().unwrap_or_else(|e| e.into_inner());
        if !active.is_empty() {
            warn!(
                count = active.len(),
                "Resource registry dropped with sandboxes that were not cleaned up"
            );
        }
    }
}

/// Task-scoped registry of active sandbox handles.
///
/// Cloning shares the registry.
#[derive(Clone)]
pub struct ResourceRegistry {
    inner: Arc<RegistryInner>,
}

impl ResourceRegistry {
    pub fn new(provider: Arc<dyn SandboxProvider>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                provider,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Initializes and registers a sandbox for `unit`.
    pub async fn acquire(
        &self,
        unit: &WorkUnit,
        config: Option<&Value>,
    ) -> Result<SandboxHandle, SandboxError> {
        let handle = self.inner.provider.sample_init(unit, config).await?;
        debug!(sandbox = %handle.id, unit = %unit, "Sandbox ready");
        self.inner
            .active()
            .insert(handle.id.clone(), handle.clone());
        Ok(handle)
    }

    /// Cleans up and unregisters a sandbox. Cleanup failures are logged, not
    /// returned: the sample's outcome is already decided at this point.
    pub async fn release(&self, handle: &SandboxHandle) {
        let registered = self.inner.active().remove(&handle.id).is_some();
        if !registered {
            return;
        }
        if let Err(e) = self.inner.provider.sample_cleanup(handle).await {
            warn!(sandbox = %handle.id, error = %e, "Failed to clean up sandbox");
        }
    }

    /// Number of sandboxes currently registered.
    pub fn active_count(&self) -> usize {
        self.inner.active().len()
    }

    /// Cleans up every sandbox still registered, e.g. those of samples that
    /// were aborted mid-flight. Returns how many were torn down.
    pub async fn teardown(&self) -> usize {
        let leftovers: Vec<SandboxHandle> =
            self.inner.active().drain().map(|(_, h)| h).collect();
        if leftovers.is_empty() {
            return 0;
        }

        info!(count = leftovers.len(), "Tearing down leftover sandboxes");
        for handle in &leftovers {
            if let Err(e) = self.inner.provider.sample_cleanup(handle).await {
                warn!(sandbox = %handle.id, error = %e, "Failed to clean up sandbox");
            }
        }
        leftovers.len()
    }
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("active", &self.active_count())
            .finish()
    }
}
