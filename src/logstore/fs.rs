//! Filesystem log store.
//!
//! Layout under the log directory:
//!
//! ```text
//! <log_dir>/<task>_<model-slug>_<digest16>/
//!     signature.json   canonical signature bytes
//!     samples.jsonl    append-only journal, one JournalEntry per line
//!     header.json      published once on finalize
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::LogStoreError;
use crate::task::TaskSignature;
use crate::work::{SampleRecord, TaskRun, WorkUnitKey};

use super::{
    reduce_journal, CleanupOutcome, FinalizeOutcome, JournalEntry, LogStore, PriorRun,
    TaskRunHeader,
};

const SIGNATURE_FILE: &str = "signature.json";
const JOURNAL_FILE: &str = "samples.jsonl";
const HEADER_FILE: &str = "header.json";

/// Per-run writer state; the mutex serializes appends within this process.
#[derive(Default)]
struct RunWriter {
    tail_checked: bool,
}

/// Log store backed by a local directory.
pub struct FileLogStore {
    root: PathBuf,
    writers: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<RunWriter>>>>,
}

/// What `status` reports for one run directory.
#[derive(Debug, Clone, Serialize)]
pub struct RunDirSummary {
    pub path: PathBuf,
    pub signature: Option<TaskSignature>,
    pub header: Option<TaskRunHeader>,
    /// Reduced journal record counts by state.
    pub counts: BTreeMap<String, usize>,
}

impl FileLogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the artifacts of `signature`.
    pub fn run_dir(&self, signature: &TaskSignature) -> PathBuf {
        let digest = signature.digest();
        self.root.join(format!(
            "{}_{}_{}",
            slug(&signature.task),
            slug(&signature.model),
            &digest[..16]
        ))
    }

    fn writer(&self, dir: &Path) -> Arc<tokio::sync::Mutex<RunWriter>> {
        let mut writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(writers.entry(dir.to_path_buf()).or_default())
    }

    async fn ensure_run_dir(&self, dir: &Path, signature: &TaskSignature) -> Result<(), LogStoreError> {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| LogStoreError::DirectoryCreationFailed {
                path: dir.to_path_buf(),
                message: e.to_string(),
            })?;
        let sig_path = dir.join(SIGNATURE_FILE);
        if !fs::try_exists(&sig_path).await? {
            atomic_write_bytes(&sig_path, &signature.canonical_bytes()).await?;
        }
        Ok(())
    }

    /// Summarizes every run directory under the root.
    pub async fn scan(&self) -> Result<Vec<RunDirSummary>, LogStoreError> {
        if !fs::try_exists(&self.root).await? {
            return Ok(Vec::new());
        }
        let dirs: Vec<PathBuf> = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_dir())
            .map(|e| e.into_path())
            .collect();

        let mut summaries = Vec::with_capacity(dirs.len());
        for path in dirs {
            let sig_bytes = match fs::read(path.join(SIGNATURE_FILE)).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let signature: Option<TaskSignature> = serde_json::from_slice(&sig_bytes).ok();
            let digest = hex::encode(Sha256::digest(&sig_bytes));
            let header = read_header(&path).await?;
            let entries = read_journal(&path.join(JOURNAL_FILE)).await?;

            let mut counts = BTreeMap::new();
            for record in reduce_journal(entries, &digest).values() {
                *counts.entry(record.state.as_str().to_string()).or_insert(0) += 1;
            }
            summaries.push(RunDirSummary {
                path,
                signature,
                header,
                counts,
            });
        }
        Ok(summaries)
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn load(&self, signature: &TaskSignature) -> Result<PriorRun, LogStoreError> {
        let dir = self.run_dir(signature);
        let stored = match fs::read(dir.join(SIGNATURE_FILE)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(run = %signature, "No prior log for run");
                return Ok(PriorRun::default());
            }
            Err(e) => return Err(e.into()),
        };
        if !signature.matches(&stored) {
            warn!(
                run = %signature,
                dir = %dir.display(),
                "Stored signature differs from the current configuration, ignoring prior records"
            );
            return Ok(PriorRun::default());
        }

        let digest = signature.digest();
        let entries = read_journal(&dir.join(JOURNAL_FILE)).await?;
        let records = reduce_journal(entries, &digest);
        let header = read_header(&dir)
            .await?
            .filter(|h| h.signature_digest == digest);

        debug!(
            run = %signature,
            records = records.len(),
            finalized = header.is_some(),
            "Loaded prior run"
        );
        Ok(PriorRun { records, header })
    }

    async fn append(
        &self,
        signature: &TaskSignature,
        key: &WorkUnitKey,
        record: &SampleRecord,
    ) -> Result<(), LogStoreError> {
        let dir = self.run_dir(signature);
        let writer = self.writer(&dir);
        let mut writer = writer.lock().await;

        self.ensure_run_dir(&dir, signature).await?;
        let path = dir.join(JOURNAL_FILE);
        if !writer.tail_checked {
            repair_torn_tail(&path).await?;
            writer.tail_checked = true;
        }

        let entry = JournalEntry {
            key: key.clone(),
            signature_digest: signature.digest(),
            record: record.clone(),
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn finalize(&self, run: &TaskRun) -> Result<FinalizeOutcome, LogStoreError> {
        let signature = run.signature();
        let dir = self.run_dir(signature);
        self.ensure_run_dir(&dir, signature).await?;

        let header = run.header(dir.display().to_string());
        let header_path = dir.join(HEADER_FILE);
        let claim_path = dir.join(claim_file(&header.units_digest));
        let tmp = dir.join(format!(".{}.tmp.{}", HEADER_FILE, Uuid::new_v4()));
        write_synced(&tmp, &serde_json::to_vec_pretty(&header)?).await?;

        // A hard link fails if the target exists, so only one finalizer of
        // a given work set wins.
        match fs::hard_link(&tmp, &claim_path).await {
            Ok(()) => {
                // Replaces a header published for a different work set.
                fs::rename(&tmp, &header_path).await?;
                info!(run = %signature, dir = %dir.display(), "Task run finalized");
                Ok(FinalizeOutcome::Finalized(header))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&tmp).await;
                let bytes = fs::read(&claim_path).await?;
                let existing: TaskRunHeader = serde_json::from_slice(&bytes)?;
                // The winner may have died between claiming and publishing.
                let published = read_header(&dir).await?;
                if published.map_or(true, |h| h.units_digest != existing.units_digest) {
                    atomic_write_bytes(&header_path, &bytes).await?;
                }
                info!(run = %signature, "Task run was already finalized by another invocation");
                Ok(FinalizeOutcome::AlreadyFinalized(existing))
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                Err(e.into())
            }
        }
    }

    async fn cleanup(&self, run: &TaskRun, remove: bool) -> Result<CleanupOutcome, LogStoreError> {
        let dir = self.run_dir(run.signature());
        if !remove {
            warn!(
                task = run.task(),
                model = run.model(),
                digest = %run.signature().digest(),
                dir = %dir.display(),
                "Keeping logs of abandoned task run for inspection"
            );
            return Ok(CleanupOutcome::Retained {
                location: dir.display().to_string(),
            });
        }

        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.writers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&dir);
        info!(run = %run.signature(), dir = %dir.display(), "Removed logs of abandoned task run");
        Ok(CleanupOutcome::Removed)
    }

    fn location(&self, signature: &TaskSignature) -> String {
        self.run_dir(signature).display().to_string()
    }
}

/// Replaces anything outside `[A-Za-z0-9._-]` so names are path-safe.
fn slug(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), LogStoreError> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

/// Writes `bytes` to a temp file next to `path` and renames it into place.
async fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<(), LogStoreError> {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}", name, Uuid::new_v4()));
    write_synced(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Finalization claim of one work set, next to `header.json`.
fn claim_file(units_digest: &str) -> String {
    let short = units_digest.get(..16).unwrap_or(units_digest);
    format!("header.{}.json", short)
}

async fn read_header(dir: &Path) -> Result<Option<TaskRunHeader>, LogStoreError> {
    match fs::read(dir.join(HEADER_FILE)).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Parses a journal. A malformed final line without a trailing newline is
/// a write torn by a crash and is skipped; malformed lines anywhere else
/// are corruption.
async fn read_journal(path: &Path) -> Result<Vec<JournalEntry>, LogStoreError> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let complete = content.ends_with('\n');
    let lines: Vec<&str> = content.lines().collect();

    let mut entries = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) if idx + 1 == lines.len() && !complete => {
                warn!(path = %path.display(), error = %e, "Skipping torn journal line");
            }
            Err(e) => {
                return Err(LogStoreError::CorruptEntry {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    message: e.to_string(),
                })
            }
        }
    }
    Ok(entries)
}

/// Truncates a partially written last line so new appends start cleanly.
async fn repair_torn_tail(path: &Path) -> Result<(), LogStoreError> {
    let content = match fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if content.is_empty() || content.ends_with(b"\n") {
        return Ok(());
    }
    let keep = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(0);
    warn!(
        path = %path.display(),
        dropped_bytes = content.len() - keep,
        "Truncating torn journal tail"
    );
    let file = fs::OpenOptions::new().write(true).open(path).await?;
    file.set_len(keep as u64).await?;
    file.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskDefinition;
    use crate::work::{FailOnError, SampleFailure, SampleState};
    use serde_json::json;
    use tempfile::TempDir;

    fn task() -> TaskDefinition {
        TaskDefinition::new("arith", ["a", "b"]).with_args(json!({"level": 1}))
    }

    fn finished(ok: bool) -> SampleRecord {
        let mut r = SampleRecord::new();
        r.begin().unwrap();
        if ok {
            r.succeed(json!({"score": 1})).unwrap();
        } else {
            r.fail(SampleFailure::retryable("timeout", "slow")).unwrap();
        }
        r
    }

    fn completed_run(task: &TaskDefinition) -> TaskRun {
        let mut run = TaskRun::new(task, "openai/gpt-4o", FailOnError::Any);
        for key in run.units().iter().map(|u| u.key()).collect::<Vec<_>>() {
            run.mark_running(&key).unwrap();
            let mut record = run.record_snapshot(&key);
            record.succeed(json!(1)).unwrap();
            run.apply(&key, record).unwrap();
        }
        run.complete();
        run
    }

    #[test]
    fn test_run_dir_naming() {
        let temp = TempDir::new().unwrap();
        let store = FileLogStore::new(temp.path());
        let sig = task().signature("openai/gpt-4o");
        let dir = store.run_dir(&sig);
        let name = dir.file_name().unwrap().to_str().unwrap();

        assert!(name.starts_with("arith_openai-gpt-4o_"));
        assert_eq!(name.len(), "arith_openai-gpt-4o_".len() + 16);
    }

    #[tokio::test]
    async fn test_append_then_load() {
        let temp = TempDir::new().unwrap();
        let store = FileLogStore::new(temp.path());
        let sig = task().signature("m1");

        store.append(&sig, &WorkUnitKey::new("a", 1), &finished(false)).await.unwrap();
        store.append(&sig, &WorkUnitKey::new("a", 1), &finished(true)).await.unwrap();
        store.append(&sig, &WorkUnitKey::new("b", 1), &finished(false)).await.unwrap();

        let prior = store.load(&sig).await.unwrap();
        assert!(!prior.is_finalized());
        assert_eq!(prior.records.len(), 2);
        assert_eq!(prior.records[&WorkUnitKey::new("a", 1)].state, SampleState::Succeeded);
        assert_eq!(prior.records[&WorkUnitKey::new("b", 1)].state, SampleState::Failed);
    }

    #[tokio::test]
    async fn test_changed_signature_sees_nothing() {
        let temp = TempDir::new().unwrap();
        let store = FileLogStore::new(temp.path());
        let sig = task().signature("m1");
        store.append(&sig, &WorkUnitKey::new("a", 1), &finished(true)).await.unwrap();

        let changed = task().with_args(json!({"level": 2})).signature("m1");
        assert!(store.load(&changed).await.unwrap().records.is_empty());

        // Same directory name but different stored bytes is also rejected.
        let dir = store.run_dir(&sig);
        std::fs::write(dir.join(SIGNATURE_FILE), b"{\"task\":\"other\"}").unwrap();
        assert!(store.load(&sig).await.unwrap().records.is_empty());
    }

    #[tokio::test]
    async fn test_torn_tail_is_skipped_and_repaired() {
        let temp = TempDir::new().unwrap();
        let store = FileLogStore::new(temp.path());
        let sig = task().signature("m1");
        store.append(&sig, &WorkUnitKey::new("a", 1), &finished(true)).await.unwrap();

        let journal = store.run_dir(&sig).join(JOURNAL_FILE);
        let mut content = std::fs::read(&journal).unwrap();
        content.extend_from_slice(b"{\"key\":{\"sample_id\":\"b\"");
        std::fs::write(&journal, &content).unwrap();

        let prior = store.load(&sig).await.unwrap();
        assert_eq!(prior.records.len(), 1);

        let fresh = FileLogStore::new(temp.path());
        fresh.append(&sig, &WorkUnitKey::new("b", 1), &finished(true)).await.unwrap();
        let prior = fresh.load(&sig).await.unwrap();
        assert_eq!(prior.records.len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_middle_line_is_an_error() {
        let temp = TempDir::new().unwrap();
        let store = FileLogStore::new(temp.path());
        let sig = task().signature("m1");
        store.append(&sig, &WorkUnitKey::new("a", 1), &finished(true)).await.unwrap();

        let journal = store.run_dir(&sig).join(JOURNAL_FILE);
        let mut content = b"not json\n".to_vec();
        content.extend(std::fs::read(&journal).unwrap());
        std::fs::write(&journal, &content).unwrap();

        let err = store.load(&sig).await.unwrap_err();
        assert!(matches!(err, LogStoreError::CorruptEntry { line: 1, .. }));
    }

    #[tokio::test]
    async fn test_only_one_finalizer_wins() {
        let temp = TempDir::new().unwrap();
        let task = task();
        let run = completed_run(&task);

        let first = FileLogStore::new(temp.path());
        let second = FileLogStore::new(temp.path());
        let (a, b) = tokio::join!(first.finalize(&run), second.finalize(&run));
        let outcomes = [a.unwrap(), b.unwrap()];

        let finalized = outcomes
            .iter()
            .filter(|o| matches!(o, FinalizeOutcome::Finalized(_)))
            .count();
        assert_eq!(finalized, 1);
        assert_eq!(outcomes[0].header(), outcomes[1].header());

        let prior = first.load(run.signature()).await.unwrap();
        assert!(prior.is_finalized());
        assert_eq!(prior.header.unwrap().succeeded, 2);
    }

    #[tokio::test]
    async fn test_grown_work_set_republishes_header() {
        let temp = TempDir::new().unwrap();
        let store = FileLogStore::new(temp.path());
        let small = completed_run(&task());
        store.finalize(&small).await.unwrap();

        let grown = completed_run(&task().with_epochs(2));
        assert_eq!(grown.signature().digest(), small.signature().digest());
        let outcome = store.finalize(&grown).await.unwrap();
        assert!(matches!(outcome, FinalizeOutcome::Finalized(_)));

        let header = store.load(grown.signature()).await.unwrap().header.unwrap();
        assert_eq!(header.samples_total, 4);
        assert_eq!(header.units_digest, grown.units_digest());

        // A second finalizer of the same grown set loses.
        let again = FileLogStore::new(temp.path()).finalize(&grown).await.unwrap();
        assert!(matches!(again, FinalizeOutcome::AlreadyFinalized(h) if h.samples_total == 4));
    }

    #[tokio::test]
    async fn test_cleanup_removes_or_retains() {
        let temp = TempDir::new().unwrap();
        let store = FileLogStore::new(temp.path());
        let task = task();
        let run = TaskRun::new(&task, "m1", FailOnError::Any);
        store
            .append(run.signature(), &WorkUnitKey::new("a", 1), &finished(false))
            .await
            .unwrap();
        let dir = store.run_dir(run.signature());

        let kept = store.cleanup(&run, false).await.unwrap();
        assert_eq!(
            kept,
            CleanupOutcome::Retained {
                location: dir.display().to_string()
            }
        );
        assert!(dir.exists());

        assert_eq!(store.cleanup(&run, true).await.unwrap(), CleanupOutcome::Removed);
        assert!(!dir.exists());
        assert_eq!(store.cleanup(&run, true).await.unwrap(), CleanupOutcome::Removed);
    }

    #[tokio::test]
    async fn test_scan_summarizes_runs() {
        let temp = TempDir::new().unwrap();
        let store = FileLogStore::new(temp.path());
        let task = task();
        let sig = task.signature("m1");
        store.append(&sig, &WorkUnitKey::new("a", 1), &finished(true)).await.unwrap();
        store.append(&sig, &WorkUnitKey::new("b", 1), &finished(false)).await.unwrap();

        let summaries = store.scan().await.unwrap();
        assert_eq!(summaries.len(), 1);
        let summary = &summaries[0];
        assert_eq!(summary.signature.as_ref().unwrap().task, "arith");
        assert!(summary.header.is_none());
        assert_eq!(summary.counts.get("succeeded"), Some(&1));
        assert_eq!(summary.counts.get("failed"), Some(&1));
    }
}
