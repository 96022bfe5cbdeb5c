//! Approval record storage.
//!
//! Two backings that can be used alone or composed:
//! - [`MemoryApprovalStore`]: indexed by request id and run id
//! - [`FileApprovalStore`]: append-only `approvals.jsonl` per run directory,
//!   replayed into an in-memory cache on first access
//!
//! [`CompositeApprovalStore`] writes to both and reads memory first.
//!
//! Remember scopes behave the same in every backing: `run` records answer
//! only their own run, `session` records answer any run served by the same
//! store instance, and `permanent` records answer any run. The file backing
//! rebuilds the permanent set from every run's log, so those survive a
//! restart; session records do not.

use crate::approval::types::{ApprovalRecord, ApprovalRequest};
use crate::errors::ApprovalError;
use crate::runtime::run_store::is_plain_name;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const APPROVALS_FILE: &str = "approvals.jsonl";

pub trait ApprovalStore: Send + Sync {
    /// Append a decided record. Records are never overwritten.
    fn save(&self, record: &ApprovalRecord) -> Result<(), ApprovalError>;

    fn get(&self, run_id: &str, id: &str) -> Result<Option<ApprovalRecord>, ApprovalError>;

    /// All records for a run, ordered by decision time.
    fn list_for_run(&self, run_id: &str) -> Result<Vec<ApprovalRecord>, ApprovalError>;

    /// First remembered record that applies to `request`, if any.
    fn find_matching(
        &self,
        request: &ApprovalRequest,
    ) -> Result<Option<ApprovalRecord>, ApprovalError>;
}

fn sorted_by_decision(mut records: Vec<ApprovalRecord>) -> Vec<ApprovalRecord> {
    records.sort_by_key(|r| r.decided_at_ms);
    records
}

#[derive(Default)]
struct MemoryIndex {
    by_id: HashMap<String, ApprovalRecord>,
    by_run: HashMap<String, Vec<String>>,
    order: Vec<String>,
}

#[derive(Default)]
pub struct MemoryApprovalStore {
    inner: Mutex<MemoryIndex>,
}

impl MemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.by_id.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ApprovalStore for MemoryApprovalStore {
    fn save(&self, record: &ApprovalRecord) -> Result<(), ApprovalError> {
        let mut index = self.inner.lock().map_err(|_| ApprovalError::LockPoisoned)?;
        let id = record.id().to_string();
        if index.by_id.contains_key(&id) {
            tracing::warn!(request_id = %id, "approval record already stored; keeping the original");
            return Ok(());
        }
        index
            .by_run
            .entry(record.run_id().to_string())
            .or_default()
            .push(id.clone());
        index.order.push(id.clone());
        index.by_id.insert(id, record.clone());
        Ok(())
    }

    fn get(&self, _run_id: &str, id: &str) -> Result<Option<ApprovalRecord>, ApprovalError> {
        let index = self.inner.lock().map_err(|_| ApprovalError::LockPoisoned)?;
        Ok(index.by_id.get(id).cloned())
    }

    fn list_for_run(&self, run_id: &str) -> Result<Vec<ApprovalRecord>, ApprovalError> {
        let index = self.inner.lock().map_err(|_| ApprovalError::LockPoisoned)?;
        let records = index
            .by_run
            .get(run_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| index.by_id.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(sorted_by_decision(records))
    }

    fn find_matching(
        &self,
        request: &ApprovalRequest,
    ) -> Result<Option<ApprovalRecord>, ApprovalError> {
        let index = self.inner.lock().map_err(|_| ApprovalError::LockPoisoned)?;
        Ok(index
            .order
            .iter()
            .filter_map(|id| index.by_id.get(id))
            .find(|record| record.applies_to(request))
            .cloned())
    }
}

/// Append-only JSONL log under `<root>/<run-id>/approvals.jsonl`.
pub struct FileApprovalStore {
    root: PathBuf,
    cache: Mutex<HashMap<String, Vec<ApprovalRecord>>>,
    /// Records that may answer other runs: permanent ones from disk plus
    /// session/permanent ones saved through this instance. Loaded lazily.
    cross_run: Mutex<Option<Vec<ApprovalRecord>>>,
}

impl FileApprovalStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            cache: Mutex::new(HashMap::new()),
            cross_run: Mutex::new(None),
        }
    }

    pub fn log_path(&self, run_id: &str) -> Result<PathBuf, ApprovalError> {
        if !is_plain_name(run_id) || Path::new(run_id).components().count() != 1 {
            return Err(ApprovalError::InvalidRunId(run_id.to_string()));
        }
        Ok(self.root.join(run_id).join(APPROVALS_FILE))
    }

    /// Permanent records from every run log under the root, oldest first.
    fn load_permanent(&self) -> Result<Vec<ApprovalRecord>, ApprovalError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ApprovalError::Io {
                    path: self.root.clone(),
                    source,
                });
            }
        };
        let mut records = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            if !entry.path().is_dir() {
                continue;
            }
            let run_id = entry.file_name().to_string_lossy().into_owned();
            match self.replay(&run_id) {
                Ok(replayed) => records.extend(replayed.into_iter().filter(|r| r.is_permanent())),
                Err(e) => tracing::warn!(run_id = %run_id, error = %e, "skipping unreadable approval log"),
            }
        }
        Ok(sorted_by_decision(records))
    }

    fn with_cross_run<T>(
        &self,
        f: impl FnOnce(&mut Vec<ApprovalRecord>) -> T,
    ) -> Result<T, ApprovalError> {
        let mut cross_run = self.cross_run.lock().map_err(|_| ApprovalError::LockPoisoned)?;
        if cross_run.is_none() {
            *cross_run = Some(self.load_permanent()?);
        }
        Ok(f(cross_run.get_or_insert_with(Vec::new)))
    }

    fn replay(&self, run_id: &str) -> Result<Vec<ApprovalRecord>, ApprovalError> {
        let path = self.log_path(run_id)?;
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path).map_err(|source| ApprovalError::Io {
            path: path.clone(),
            source,
        })?;
        let records = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<ApprovalRecord>(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping malformed approval line");
                    None
                }
            })
            .collect();
        Ok(records)
    }

    /// Run `f` over the cached records for a run, replaying the log first if needed.
    fn with_run<T>(
        &self,
        run_id: &str,
        f: impl FnOnce(&mut Vec<ApprovalRecord>) -> T,
    ) -> Result<T, ApprovalError> {
        let mut cache = self.cache.lock().map_err(|_| ApprovalError::LockPoisoned)?;
        if !cache.contains_key(run_id) {
            let records = self.replay(run_id)?;
            cache.insert(run_id.to_string(), records);
        }
        let records = cache.entry(run_id.to_string()).or_default();
        Ok(f(records))
    }
}

impl ApprovalStore for FileApprovalStore {
    fn save(&self, record: &ApprovalRecord) -> Result<(), ApprovalError> {
        let run_id = record.run_id().to_string();
        let duplicate = self.with_run(&run_id, |records| {
            records.iter().any(|r| r.id() == record.id())
        })?;
        if duplicate {
            tracing::warn!(request_id = %record.id(), "approval record already logged; keeping the original");
            return Ok(());
        }

        let path = self.log_path(&run_id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ApprovalError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| file.write_all(line.as_bytes()))
            .map_err(|source| ApprovalError::Io {
                path: path.clone(),
                source,
            })?;

        self.with_run(&run_id, |records| records.push(record.clone()))?;
        if record.crosses_runs() {
            self.with_cross_run(|records| {
                if !records.iter().any(|r| r.id() == record.id()) {
                    records.push(record.clone());
                }
            })?;
        }
        Ok(())
    }

    fn get(&self, run_id: &str, id: &str) -> Result<Option<ApprovalRecord>, ApprovalError> {
        self.with_run(run_id, |records| records.iter().find(|r| r.id() == id).cloned())
    }

    fn list_for_run(&self, run_id: &str) -> Result<Vec<ApprovalRecord>, ApprovalError> {
        let records = self.with_run(run_id, |records| records.clone())?;
        Ok(sorted_by_decision(records))
    }

    fn find_matching(
        &self,
        request: &ApprovalRequest,
    ) -> Result<Option<ApprovalRecord>, ApprovalError> {
        let own = self.with_run(&request.run_id, |records| {
            records.iter().find(|r| r.applies_to(request)).cloned()
        })?;
        if own.is_some() {
            return Ok(own);
        }
        self.with_cross_run(|records| records.iter().find(|r| r.applies_to(request)).cloned())
    }
}

/// Memory + file, written together.
pub struct CompositeApprovalStore {
    memory: MemoryApprovalStore,
    file: FileApprovalStore,
}

impl CompositeApprovalStore {
    pub fn new(root: &Path) -> Self {
        Self {
            memory: MemoryApprovalStore::new(),
            file: FileApprovalStore::new(root),
        }
    }
}

impl ApprovalStore for CompositeApprovalStore {
    fn save(&self, record: &ApprovalRecord) -> Result<(), ApprovalError> {
        self.file.save(record)?;
        self.memory.save(record)
    }

    fn get(&self, run_id: &str, id: &str) -> Result<Option<ApprovalRecord>, ApprovalError> {
        match self.memory.get(run_id, id)? {
            Some(record) => Ok(Some(record)),
            None => self.file.get(run_id, id),
        }
    }

    fn list_for_run(&self, run_id: &str) -> Result<Vec<ApprovalRecord>, ApprovalError> {
        let records = self.memory.list_for_run(run_id)?;
        if records.is_empty() {
            self.file.list_for_run(run_id)
        } else {
            Ok(records)
        }
    }

    fn find_matching(
        &self,
        request: &ApprovalRequest,
    ) -> Result<Option<ApprovalRecord>, ApprovalError> {
        match self.memory.find_matching(request)? {
            Some(record) => Ok(Some(record)),
            None => self.file.find_matching(request),
        }
    }
}
