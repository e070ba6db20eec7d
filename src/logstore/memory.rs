//! In-process log store.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::LogStoreError;
use crate::task::TaskSignature;
use crate::work::{SampleRecord, TaskRun, WorkUnitKey};

use super::{
    reduce_journal, CleanupOutcome, FinalizeOutcome, JournalEntry, LogStore, PriorRun,
    TaskRunHeader,
};

#[derive(Debug, Default)]
struct StoredRun {
    canonical: Vec<u8>,
    journal: Vec<JournalEntry>,
    header: Option<TaskRunHeader>,
}

/// Log store that keeps everything in memory. Shares the journal semantics
/// of the filesystem store, so it can stand in for it in tests.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    runs: Mutex<HashMap<String, StoredRun>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, StoredRun>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of journal entries written for `signature`.
    pub fn journal_len(&self, signature: &TaskSignature) -> usize {
        self.runs()
            .get(&signature.digest())
            .map_or(0, |run| run.journal.len())
    }

    /// Whether anything is stored for `signature`.
    pub fn contains(&self, signature: &TaskSignature) -> bool {
        self.runs().contains_key(&signature.digest())
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn load(&self, signature: &TaskSignature) -> Result<PriorRun, LogStoreError> {
        let runs = self.runs();
        let Some(stored) = runs.get(&signature.digest()) else {
            return Ok(PriorRun::default());
        };
        if !signature.matches(&stored.canonical) {
            return Ok(PriorRun::default());
        }
        Ok(PriorRun {
            records: reduce_journal(stored.journal.iter().cloned(), &signature.digest()),
            header: stored.header.clone(),
        })
    }

    async fn append(
        &self,
        signature: &TaskSignature,
        key: &WorkUnitKey,
        record: &SampleRecord,
    ) -> Result<(), LogStoreError> {
        let digest = signature.digest();
        let mut runs = self.runs();
        let stored = runs.entry(digest.clone()).or_insert_with(|| StoredRun {
            canonical: signature.canonical_bytes(),
            ..Default::default()
        });
        stored.journal.push(JournalEntry {
            key: key.clone(),
            signature_digest: digest,
            record: record.clone(),
        });
        Ok(())
    }

    async fn finalize(&self, run: &TaskRun) -> Result<FinalizeOutcome, LogStoreError> {
        let signature = run.signature();
        let location = self.location(signature);
        let mut runs = self.runs();
        let stored = runs.entry(signature.digest()).or_insert_with(|| StoredRun {
            canonical: signature.canonical_bytes(),
            ..Default::default()
        });
        let header = run.header(location);
        if let Some(existing) = &stored.header {
            if existing.units_digest == header.units_digest {
                return Ok(FinalizeOutcome::AlreadyFinalized(existing.clone()));
            }
        }
        stored.header = Some(header.clone());
        info!(run = %signature, "Task run finalized");
        Ok(FinalizeOutcome::Finalized(header))
    }

    async fn cleanup(&self, run: &TaskRun, remove: bool) -> Result<CleanupOutcome, LogStoreError> {
        let signature = run.signature();
        if !remove {
            let location = self.location(signature);
            warn!(
                task = run.task(),
                model = run.model(),
                location = %location,
                "Keeping logs of abandoned task run for inspection"
            );
            return Ok(CleanupOutcome::Retained { location });
        }
        self.runs().remove(&signature.digest());
        Ok(CleanupOutcome::Removed)
    }

    fn location(&self, signature: &TaskSignature) -> String {
        format!("memory://{}/{}", signature.run_id(), &signature.digest()[..16])
    }
}
