use crate::error::ControlError;
use crate::models::{BulkImportJob, JobState, Stage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {0} already exists")]
    Duplicate(Uuid),
    #[error("job store backend failed: {0}")]
    Backend(String),
    #[error("job record could not be decoded: {0}")]
    Codec(String),
}

/// Durable record of bulk imports. `update` is a full-record overwrite and must be atomic.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &BulkImportJob) -> Result<(), StoreError>;
    async fn update(&self, job: &BulkImportJob) -> Result<(), StoreError>;
    async fn get(&self, job_id: Uuid) -> Result<Option<BulkImportJob>, StoreError>;
    async fn list_nonterminal(&self, target: &str) -> Result<Vec<BulkImportJob>, StoreError>;
    /// Every job ever created for `target`, newest first.
    async fn list_for_target(&self, target: &str) -> Result<Vec<BulkImportJob>, StoreError>;
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, BulkImportJob>>,
    #[cfg(test)]
    writes: std::sync::atomic::AtomicUsize,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn write_count(&self) -> usize {
        self.writes.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &BulkImportJob) -> Result<(), StoreError> {
        let mut guard = self.jobs.lock().await;
        if guard.contains_key(&job.job_id) {
            return Err(StoreError::Duplicate(job.job_id));
        }
        guard.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn update(&self, job: &BulkImportJob) -> Result<(), StoreError> {
        let mut guard = self.jobs.lock().await;
        let Some(slot) = guard.get_mut(&job.job_id) else {
            return Err(StoreError::NotFound(job.job_id));
        };
        *slot = job.clone();
        #[cfg(test)]
        self.writes
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<BulkImportJob>, StoreError> {
        Ok(self.jobs.lock().await.get(&job_id).cloned())
    }

    async fn list_nonterminal(&self, target: &str) -> Result<Vec<BulkImportJob>, StoreError> {
        let guard = self.jobs.lock().await;
        let mut open: Vec<_> = guard
            .values()
            .filter(|job| job.target == target && !job.state.is_terminal())
            .cloned()
            .collect();
        open.sort_by_key(|job| job.created_at);
        Ok(open)
    }

    async fn list_for_target(&self, target: &str) -> Result<Vec<BulkImportJob>, StoreError> {
        let guard = self.jobs.lock().await;
        let mut all: Vec<_> = guard
            .values()
            .filter(|job| job.target == target)
            .cloned()
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }
}

#[derive(Clone)]
pub struct RedisJobStore {
    client: redis::Client,
    prefix: String,
}

impl RedisJobStore {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    pub fn from_env() -> Option<Self> {
        let url = std::env::var("REDIS_URL").ok()?;
        let client = match redis::Client::open(url) {
            Ok(client) => client,
            Err(err) => {
                warn!(target = "bulk.store", error = %err, "invalid REDIS_URL");
                return None;
            }
        };
        let prefix = std::env::var("REDIS_KEY_PREFIX").unwrap_or_else(|_| "bulk_import".into());
        Some(Self::new(client, prefix))
    }

    fn job_key(&self, job_id: Uuid) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    fn open_key(&self, target: &str) -> String {
        format!("{}:target:{}:open", self.prefix, target)
    }

    fn history_key(&self, target: &str) -> String {
        format!("{}:target:{}:all", self.prefix, target)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))
    }

    // Record and both indexes go out in one MULTI/EXEC so a failed create leaves nothing.
    fn create_pipeline(&self, job: &BulkImportJob) -> Result<redis::Pipeline, StoreError> {
        let id = job.job_id.to_string();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.job_key(job.job_id), encode(job)?)
            .ignore()
            .lpush(self.history_key(&job.target), &id)
            .ignore();
        if !job.state.is_terminal() {
            pipe.sadd(self.open_key(&job.target), &id).ignore();
        }
        Ok(pipe)
    }

    async fn load_many(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        ids: Vec<String>,
    ) -> Result<Vec<BulkImportJob>, StoreError> {
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let key = format!("{}:job:{}", self.prefix, id);
            let raw: Option<String> = conn
                .get(&key)
                .await
                .map_err(|err| StoreError::Backend(err.to_string()))?;
            match raw {
                Some(raw) => jobs.push(decode(&raw)?),
                None => warn!(target = "bulk.store", job_id = %id, "indexed job record missing"),
            }
        }
        Ok(jobs)
    }
}

fn encode(job: &BulkImportJob) -> Result<String, StoreError> {
    serde_json::to_string(job).map_err(|err| StoreError::Codec(err.to_string()))
}

fn decode(raw: &str) -> Result<BulkImportJob, StoreError> {
    serde_json::from_str(raw).map_err(|err| StoreError::Codec(err.to_string()))
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn create(&self, job: &BulkImportJob) -> Result<(), StoreError> {
        let pipe = self.create_pipeline(job)?;
        let mut conn = self.connection().await?;
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))
    }

    async fn update(&self, job: &BulkImportJob) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let key = self.job_key(job.job_id);
        let exists: bool = conn
            .exists(&key)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        if !exists {
            return Err(StoreError::NotFound(job.job_id));
        }
        let id = job.job_id.to_string();
        let mut pipe = redis::pipe();
        pipe.atomic().set(&key, encode(job)?).ignore();
        if job.state.is_terminal() {
            pipe.srem(self.open_key(&job.target), &id).ignore();
        } else {
            pipe.sadd(self.open_key(&job.target), &id).ignore();
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<BulkImportJob>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .get(self.job_key(job_id))
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        raw.as_deref().map(decode).transpose()
    }

    async fn list_nonterminal(&self, target: &str) -> Result<Vec<BulkImportJob>, StoreError> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = conn
            .smembers(self.open_key(target))
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let mut jobs = self.load_many(&mut conn, ids).await?;
        jobs.retain(|job| !job.state.is_terminal());
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn list_for_target(&self, target: &str) -> Result<Vec<BulkImportJob>, StoreError> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = conn
            .lrange(self.history_key(target), 0, -1)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        self.load_many(&mut conn, ids).await
    }
}

/// Outcome of a guarded read-modify-write on a job record.
#[derive(Debug, Clone)]
pub enum Transition {
    Applied(BulkImportJob),
    /// The job was already terminal; nothing was written.
    Frozen(BulkImportJob),
}

impl Transition {
    pub fn into_job(self) -> BulkImportJob {
        match self {
            Transition::Applied(job) | Transition::Frozen(job) => job,
        }
    }
}

/// Serializes writes to job records; terminal records are never rewritten.
pub struct JobRegistry {
    store: Arc<dyn JobStore>,
    job_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    target_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            job_locks: Mutex::new(HashMap::new()),
            target_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    async fn job_lock(&self, job_id: Uuid) -> Arc<Mutex<()>> {
        let mut guard = self.job_locks.lock().await;
        guard.entry(job_id).or_default().clone()
    }

    async fn target_lock(&self, target: &str) -> Arc<Mutex<()>> {
        let mut guard = self.target_locks.lock().await;
        guard.entry(target.to_string()).or_default().clone()
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<BulkImportJob>, StoreError> {
        self.store.get(job_id).await
    }

    /// Create a new job unless its target already has a non-terminal one.
    pub async fn create_exclusive(&self, job: BulkImportJob) -> Result<BulkImportJob, ControlError> {
        let lock = self.target_lock(&job.target).await;
        let _held = lock.lock().await;
        let open = self.store.list_nonterminal(&job.target).await?;
        if let Some(existing) = open.first() {
            return Err(ControlError::ImportInProgress {
                target: job.target.clone(),
                job_id: existing.job_id,
            });
        }
        self.store.create(&job).await?;
        crate::metrics::job_created(&job.target);
        debug!(target = "bulk.store", job_id = %job.job_id, shop = %job.target, "job created");
        Ok(job)
    }

    pub async fn transition<F>(&self, job_id: Uuid, apply: F) -> Result<Transition, StoreError>
    where
        F: FnOnce(&mut BulkImportJob),
    {
        let lock = self.job_lock(job_id).await;
        let _held = lock.lock().await;
        let current = self
            .store
            .get(job_id)
            .await?
            .ok_or(StoreError::NotFound(job_id))?;
        if current.state.is_terminal() {
            return Ok(Transition::Frozen(current));
        }
        let mut next = current.clone();
        apply(&mut next);
        if next.cursor < current.cursor {
            warn!(
                target = "bulk.store",
                job_id = %job_id,
                cursor = current.cursor,
                proposed = next.cursor,
                "refusing to move cursor backwards"
            );
            next.cursor = current.cursor;
        }
        self.store.update(&next).await?;
        if next.state != current.state {
            crate::metrics::job_transition(&next.target, current.state, next.state);
        }
        drop(_held);
        if next.state.is_terminal() {
            self.job_locks.lock().await.remove(&job_id);
        }
        Ok(Transition::Applied(next))
    }

    /// Freeze a non-terminal job as `Cancelled`. Returns the job and the state it left.
    pub async fn cancel(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(BulkImportJob, JobState), ControlError> {
        let mut previous = None;
        let outcome = self
            .transition(job_id, |job| {
                previous = Some(job.state);
                job.state = JobState::Cancelled;
                job.next_attempt_at = None;
                job.error_log.push(crate::models::ErrorEntry {
                    at: now,
                    stage: Stage::Cancel,
                    message: "cancelled by operator".into(),
                    offset: None,
                });
            })
            .await
            .map_err(|err| match err {
                StoreError::NotFound(id) => ControlError::JobNotFound(id),
                other => ControlError::Store(other),
            })?;
        match (outcome, previous) {
            (Transition::Applied(job), Some(previous)) => Ok((job, previous)),
            (transition, _) => {
                let job = transition.into_job();
                Err(ControlError::JobClosed {
                    job_id: job.job_id,
                    state: job.state,
                })
            }
        }
    }
}
