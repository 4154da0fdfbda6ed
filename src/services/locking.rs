//! Per-workspace locking.
//!
//! A lock is a [`LockRecord`] stored under its [`LockKey`] id. The backend only
//! offers read, list and compare-and-swap; acquire and release are CAS loops on
//! top of it, so two callers racing for the same key can never both win.
//!
//! ## Policy
//!
//! - Different keys never conflict.
//! - The holding pull request may re-acquire; the original record is kept.
//! - Any other pull request is denied. There is no queue.

use crate::domain::{AcquireOutcome, LockKey, LockRecord, PullRequest, ReleaseOutcome};
use crate::error::{LockError, LockResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Upper bound on CAS retries before giving up on a contended key
const MAX_CAS_ATTEMPTS: usize = 32;

/// Durable arena of lock records
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Record stored under `id`
    async fn get(&self, id: &str) -> LockResult<Option<LockRecord>>;

    /// Replace the record under `id` with `new` only if it currently equals
    /// `expected`. Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        id: &str,
        expected: Option<&LockRecord>,
        new: Option<LockRecord>,
    ) -> LockResult<bool>;

    /// All stored records, ordered by id
    async fn list(&self) -> LockResult<Vec<LockRecord>>;
}

fn swap_in(
    records: &mut BTreeMap<String, LockRecord>,
    id: &str,
    expected: Option<&LockRecord>,
    new: Option<LockRecord>,
) -> bool {
    if records.get(id) != expected {
        return false;
    }
    match new {
        Some(record) => {
            records.insert(id.to_string(), record);
        }
        None => {
            records.remove(id);
        }
    }
    true
}

/// In-process backend; state is lost on restart
#[derive(Debug, Default)]
pub struct MemoryLockBackend {
    records: Mutex<BTreeMap<String, LockRecord>>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn get(&self, id: &str) -> LockResult<Option<LockRecord>> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn compare_and_swap(
        &self,
        id: &str,
        expected: Option<&LockRecord>,
        new: Option<LockRecord>,
    ) -> LockResult<bool> {
        let mut records = self.records.lock().await;
        Ok(swap_in(&mut records, id, expected, new))
    }

    async fn list(&self) -> LockResult<Vec<LockRecord>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }
}

/// Backend persisted as a JSON document.
///
/// Every successful swap rewrites the file through a temp file and rename, so
/// a crash leaves either the old or the new arena on disk.
#[derive(Debug)]
pub struct FileLockBackend {
    path: PathBuf,
    records: Mutex<BTreeMap<String, LockRecord>>,
}

impl FileLockBackend {
    /// Open the arena at `path`, creating parent directories as needed
    pub async fn open(path: impl AsRef<Path>) -> LockResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let records = match tokio::fs::read(&path).await {
            Ok(data) if data.is_empty() => BTreeMap::new(),
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), locks = records.len(), "opened lock store");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, records: &BTreeMap<String, LockRecord>) -> LockResult<()> {
        let data = serde_json::to_vec_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl LockBackend for FileLockBackend {
    async fn get(&self, id: &str) -> LockResult<Option<LockRecord>> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn compare_and_swap(
        &self,
        id: &str,
        expected: Option<&LockRecord>,
        new: Option<LockRecord>,
    ) -> LockResult<bool> {
        let mut records = self.records.lock().await;
        let mut next = records.clone();
        if !swap_in(&mut next, id, expected, new) {
            return Ok(false);
        }
        // Memory only changes once the new arena is on disk
        self.persist(&next).await?;
        *records = next;
        Ok(true)
    }

    async fn list(&self) -> LockResult<Vec<LockRecord>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }
}

/// Grants, denies and releases workspace locks
pub struct LockManager<B: LockBackend + ?Sized> {
    backend: Arc<B>,
}

impl<B: LockBackend + ?Sized> Clone for LockManager<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: LockBackend + ?Sized> LockManager<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Try to lock `key` for `pull`. Never waits for the current holder.
    pub async fn try_acquire(
        &self,
        key: &LockKey,
        pull: &PullRequest,
        project_name: Option<&str>,
    ) -> LockResult<AcquireOutcome> {
        let id = key.id();
        for _ in 0..MAX_CAS_ATTEMPTS {
            match self.backend.get(&id).await? {
                Some(existing) if existing.is_held_by(pull.num) => {
                    tracing::debug!(lock = %id, pull = pull.num, "lock already held by this pull request");
                    return Ok(AcquireOutcome::AlreadyHeldBySelf(existing));
                }
                Some(existing) => {
                    tracing::info!(
                        lock = %id,
                        pull = pull.num,
                        holder = existing.pull.num,
                        "lock denied"
                    );
                    return Ok(AcquireOutcome::DeniedHeldByOther(existing));
                }
                None => {
                    let record = LockRecord::new(
                        key.clone(),
                        pull.clone(),
                        project_name.map(str::to_string),
                    );
                    if self
                        .backend
                        .compare_and_swap(&id, None, Some(record.clone()))
                        .await?
                    {
                        tracing::info!(lock = %id, pull = pull.num, "lock acquired");
                        return Ok(AcquireOutcome::Acquired(record));
                    }
                }
            }
        }
        Err(LockError::Storage(format!(
            "gave up acquiring {} after {} attempts",
            id, MAX_CAS_ATTEMPTS
        )))
    }

    /// Release `key` if `pull_num` holds it
    pub async fn release(&self, key: &LockKey, pull_num: u64) -> LockResult<ReleaseOutcome> {
        self.release_matching(key, |rec| rec.is_held_by(pull_num))
            .await
    }

    /// Release `key` whoever holds it
    pub async fn force_release(&self, key: &LockKey) -> LockResult<ReleaseOutcome> {
        self.release_matching(key, |_| true).await
    }

    async fn release_matching<F>(&self, key: &LockKey, allowed: F) -> LockResult<ReleaseOutcome>
    where
        F: Fn(&LockRecord) -> bool,
    {
        let id = key.id();
        for _ in 0..MAX_CAS_ATTEMPTS {
            let existing = match self.backend.get(&id).await? {
                Some(rec) if allowed(&rec) => rec,
                _ => return Ok(ReleaseOutcome::NotHeld),
            };
            if self
                .backend
                .compare_and_swap(&id, Some(&existing), None)
                .await?
            {
                tracing::info!(lock = %id, pull = existing.pull.num, "lock released");
                return Ok(ReleaseOutcome::Released(existing));
            }
        }
        Err(LockError::Storage(format!(
            "gave up releasing {} after {} attempts",
            id, MAX_CAS_ATTEMPTS
        )))
    }

    /// Drop every lock a pull request holds in a repo, e.g. when it closes
    pub async fn release_all_for_pull(
        &self,
        repo_full_name: &str,
        pull_num: u64,
    ) -> LockResult<Vec<LockRecord>> {
        let mut released = Vec::new();
        for record in self.list().await? {
            if record.key.repo_full_name != repo_full_name || !record.is_held_by(pull_num) {
                continue;
            }
            if let ReleaseOutcome::Released(rec) = self.release(&record.key, pull_num).await? {
                released.push(rec);
            }
        }
        tracing::info!(
            repo = repo_full_name,
            pull = pull_num,
            count = released.len(),
            "released pull request locks"
        );
        Ok(released)
    }

    /// Current holder of `key`
    pub async fn get(&self, key: &LockKey) -> LockResult<Option<LockRecord>> {
        self.backend.get(&key.id()).await
    }

    pub async fn list(&self) -> LockResult<Vec<LockRecord>> {
        self.backend.list().await
    }
}
