use crate::clock::Clock;
use crate::error::{ControlError, ImportError};
use crate::models::{BulkImportJob, ErrorEntry, JobState, Stage};
use crate::parser::RecordStream;
use crate::retry::{self, GiveUpReason, RetryDecision, RetryPolicy};
use crate::shopify::{BulkOperationClient, OperationStatus};
use crate::sink::{CatalogSink, SinkError, UpsertOutcome};
use crate::store::{JobRegistry, StoreError, Transition};
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct MachineTuning {
    pub retry: RetryPolicy,
    /// Records applied between cursor commits.
    pub batch_size: usize,
    /// Batches streamed per step; `None` streams until the export ends.
    pub batches_per_step: Option<usize>,
    pub max_children: usize,
}

impl Default for MachineTuning {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            batch_size: 1,
            batches_per_step: None,
            max_children: 100_000,
        }
    }
}

pub struct ImportMachine {
    target: String,
    client: Arc<dyn BulkOperationClient>,
    sink: Arc<dyn CatalogSink>,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
    tuning: MachineTuning,
}

struct Conflict {
    product_id: String,
    offset: u64,
    message: String,
}

#[derive(Default)]
struct Batch {
    /// End offset of the last record the sink answered.
    end_offset: Option<u64>,
    applied: u64,
    conflicts: Vec<Conflict>,
    interruption: Option<ImportError>,
    exhausted: bool,
}

impl Batch {
    fn made_progress(&self) -> bool {
        self.end_offset.is_some() || self.exhausted
    }
}

impl ImportMachine {
    pub fn new(
        target: impl Into<String>,
        client: Arc<dyn BulkOperationClient>,
        sink: Arc<dyn CatalogSink>,
        registry: Arc<JobRegistry>,
        clock: Arc<dyn Clock>,
        tuning: MachineTuning,
    ) -> Self {
        Self {
            target: target.into(),
            client,
            sink,
            registry,
            clock,
            tuning,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub async fn step(&self, job_id: Uuid) -> Result<BulkImportJob, StoreError> {
        let job = self
            .registry
            .get(job_id)
            .await?
            .ok_or(StoreError::NotFound(job_id))?;
        if job.state.is_terminal() {
            return Ok(job);
        }
        let now = self.clock.now();
        if job.state.is_active() && job.elapsed_since_submit(now) >= self.tuning.retry.timeout {
            return self
                .fail(job_id, ImportError::Timeout(self.tuning.retry.timeout))
                .await;
        }
        if job.next_attempt_at.is_some_and(|at| now < at) {
            trace!(target = "bulk.machine", %job_id, state = %job.state, "backing off");
            return Ok(job);
        }
        match job.state {
            JobState::Pending => self.submit(job).await,
            JobState::Submitted | JobState::Polling => self.poll(job).await,
            JobState::Fetching | JobState::Streaming => self.stream(job).await,
            JobState::Completed | JobState::Failed | JobState::Cancelled => Ok(job),
        }
    }

    /// Cancel a non-terminal job and, if the provider may still be exporting, ask it to stop.
    pub async fn cancel(&self, job_id: Uuid) -> Result<BulkImportJob, ControlError> {
        let (job, previous) = self.registry.cancel(job_id, self.clock.now()).await?;
        info!(
            target = "bulk.machine",
            %job_id,
            shop = %self.target,
            previous = %previous,
            cursor = job.cursor,
            "bulk import cancelled"
        );
        if matches!(previous, JobState::Submitted | JobState::Polling) {
            self.cancel_provider_operation(&job).await;
        }
        Ok(job)
    }

    async fn cancel_provider_operation(&self, job: &BulkImportJob) {
        if job.provider_operation_id.is_empty() {
            return;
        }
        if let Err(err) = self.client.cancel(&job.provider_operation_id).await {
            warn!(
                target = "bulk.machine",
                job_id = %job.job_id,
                error = %err,
                "provider cancel request failed"
            );
        }
    }

    async fn apply<F>(&self, job_id: Uuid, apply: F) -> Result<BulkImportJob, StoreError>
    where
        F: FnOnce(&mut BulkImportJob),
    {
        Ok(self.registry.transition(job_id, apply).await?.into_job())
    }

    async fn submit(&self, job: BulkImportJob) -> Result<BulkImportJob, StoreError> {
        let job_id = job.job_id;
        let operation_id = match self.client.submit(&job.query).await {
            Ok(id) => id,
            Err(err) => return self.fail(job_id, err).await,
        };
        let now = self.clock.now();
        let accepted = operation_id.clone();
        let outcome = self
            .registry
            .transition(job_id, |job| {
                job.provider_operation_id = accepted;
                job.state = JobState::Submitted;
                job.submitted_at = Some(now);
                job.next_attempt_at = None;
            })
            .await?;
        match outcome {
            Transition::Applied(job) => {
                info!(
                    target = "bulk.machine",
                    %job_id,
                    shop = %self.target,
                    operation_id = %job.provider_operation_id,
                    "bulk query submitted"
                );
                Ok(job)
            }
            Transition::Frozen(mut job) => {
                // Cancelled while the submission was in flight.
                job.provider_operation_id = operation_id;
                self.cancel_provider_operation(&job).await;
                Ok(job)
            }
        }
    }

    async fn poll(&self, job: BulkImportJob) -> Result<BulkImportJob, StoreError> {
        let job_id = job.job_id;
        let status = self.client.poll(&job.provider_operation_id).await;
        let now = self.clock.now();
        match status {
            Ok(OperationStatus::Running) => {
                self.apply(job_id, |job| {
                    job.state = JobState::Polling;
                    job.last_polled_at = Some(now);
                    job.next_attempt_at = None;
                })
                .await
            }
            Ok(OperationStatus::Completed {
                result_url,
                object_count,
            }) => {
                info!(
                    target = "bulk.machine",
                    %job_id,
                    shop = %self.target,
                    object_count = object_count.unwrap_or_default(),
                    empty = result_url.is_none(),
                    "bulk operation completed"
                );
                self.apply(job_id, |job| {
                    job.state = JobState::Fetching;
                    job.last_polled_at = Some(now);
                    job.result_url = result_url.unwrap_or_default();
                    job.next_attempt_at = None;
                })
                .await
            }
            Ok(OperationStatus::Failed { error }) => {
                self.fail(
                    job_id,
                    ImportError::PermanentPoll(format!("bulk operation failed: {error}")),
                )
                .await
            }
            Ok(OperationStatus::Cancelled) => {
                self.fail(
                    job_id,
                    ImportError::PermanentPoll("bulk operation was cancelled upstream".into()),
                )
                .await
            }
            Err(err) if err.is_retryable() => self.retry_later(job_id, err).await,
            Err(err) => self.fail(job_id, err).await,
        }
    }

    async fn stream(&self, job: BulkImportJob) -> Result<BulkImportJob, StoreError> {
        let job_id = job.job_id;
        if job.result_url.is_empty() {
            let now = self.clock.now();
            info!(target = "bulk.machine", %job_id, shop = %self.target, "export is empty");
            return self.apply(job_id, |job| complete(job, now)).await;
        }

        let bytes = match self.client.fetch_stream(&job.result_url, job.cursor).await {
            Ok(bytes) => bytes,
            Err(err) if err.is_retryable() => return self.retry_later(job_id, err).await,
            Err(err) => return self.fail(job_id, err).await,
        };
        let mut job = match self
            .registry
            .transition(job_id, |job| {
                job.state = JobState::Streaming;
                job.next_attempt_at = None;
            })
            .await?
        {
            Transition::Applied(job) => job,
            Transition::Frozen(job) => return Ok(job),
        };
        debug!(target = "bulk.machine", %job_id, cursor = job.cursor, "streaming export");

        let mut records = RecordStream::new(bytes, job.cursor, self.tuning.max_children);
        let mut batches = 0usize;
        loop {
            if self
                .tuning
                .batches_per_step
                .is_some_and(|limit| batches >= limit)
            {
                return Ok(job);
            }
            if let Some(current) = self.registry.get(job_id).await?
                && current.state.is_terminal()
            {
                return Ok(current);
            }

            let batch = self.next_batch(&mut records).await;
            if batch.made_progress() {
                let now = self.clock.now();
                let applied = batch.applied;
                let conflicts = batch.conflicts.len() as u64;
                let completes = batch.exhausted && batch.interruption.is_none();
                let end_offset = batch.end_offset;
                let entries = batch.conflicts.iter().map(|c| ErrorEntry {
                    at: now,
                    stage: Stage::Sink,
                    message: format!("conflict on {}: {}", c.product_id, c.message),
                    offset: Some(c.offset),
                });
                let entries: Vec<_> = entries.collect();
                job = match self
                    .registry
                    .transition(job_id, |job| {
                        if let Some(end) = end_offset {
                            job.cursor = end;
                        }
                        job.records_processed += applied;
                        job.records_failed += conflicts;
                        job.error_log.extend(entries);
                        if completes {
                            complete(job, now);
                        }
                    })
                    .await?
                {
                    Transition::Applied(job) => job,
                    Transition::Frozen(job) => return Ok(job),
                };
                crate::metrics::records_applied(&self.target, applied, conflicts);
                trace!(target = "bulk.machine", %job_id, cursor = job.cursor, applied, conflicts, "batch committed");
            }

            if let Some(err) = batch.interruption {
                return if err.is_retryable() {
                    self.retry_later(job_id, err).await
                } else {
                    self.fail(job_id, err).await
                };
            }
            if job.state.is_terminal() {
                info!(
                    target = "bulk.machine",
                    %job_id,
                    shop = %self.target,
                    records_processed = job.records_processed,
                    records_failed = job.records_failed,
                    "bulk import completed"
                );
                return Ok(job);
            }
            batches += 1;
        }
    }

    async fn next_batch(&self, records: &mut RecordStream) -> Batch {
        let mut batch = Batch::default();
        for _ in 0..self.tuning.batch_size.max(1) {
            let parsed = match records.next().await {
                None => {
                    batch.exhausted = true;
                    break;
                }
                Some(Err(err)) => {
                    batch.interruption = Some(err);
                    break;
                }
                Some(Ok(parsed)) => parsed,
            };
            match self.sink.upsert(&self.target, &parsed.record).await {
                Ok(UpsertOutcome::Applied) => batch.applied += 1,
                Ok(UpsertOutcome::Conflict(message)) => {
                    warn!(
                        target = "bulk.machine",
                        shop = %self.target,
                        product_id = %parsed.record.product_id,
                        offset = parsed.start_offset,
                        %message,
                        "catalog conflict"
                    );
                    batch.conflicts.push(Conflict {
                        product_id: parsed.record.product_id,
                        offset: parsed.start_offset,
                        message,
                    });
                }
                Err(SinkError::Unavailable(message)) => {
                    batch.interruption = Some(ImportError::SinkUnavailable(message));
                    break;
                }
                Err(SinkError::Rejected(message)) => {
                    batch.interruption = Some(ImportError::Sink {
                        product_id: parsed.record.product_id,
                        offset: parsed.start_offset,
                        message,
                    });
                    break;
                }
            }
            batch.end_offset = Some(parsed.end_offset);
        }
        batch
    }

    async fn fail(&self, job_id: Uuid, err: ImportError) -> Result<BulkImportJob, StoreError> {
        let now = self.clock.now();
        warn!(
            target = "bulk.machine",
            %job_id,
            shop = %self.target,
            stage = err.stage().as_str(),
            error = %err,
            "bulk import failed"
        );
        self.apply(job_id, |job| {
            job.record_error(now, err.stage(), err.to_string(), err.offset());
            job.state = JobState::Failed;
            job.next_attempt_at = None;
        })
        .await
    }

    /// Record a retryable failure and either arm the backoff gate or give up.
    async fn retry_later(&self, job_id: Uuid, err: ImportError) -> Result<BulkImportJob, StoreError> {
        let now = self.clock.now();
        let policy = &self.tuning.retry;
        let window = TimeDelta::from_std(policy.window).unwrap_or(TimeDelta::MAX);
        let stage = err.stage();
        let mut decision = None;
        let job = self
            .apply(job_id, |job| {
                job.attempt_count += 1;
                job.recent_failures.retain(|at| now - *at < window);
                job.recent_failures.push(now);
                job.record_error(now, stage, err.to_string(), err.offset());
                let attempts = job.recent_failures.len() as u32;
                let outcome = retry::decide(policy, attempts, job.elapsed_since_submit(now));
                match outcome {
                    RetryDecision::RetryAfter(delay) => {
                        job.next_attempt_at = retry_at(now, delay);
                    }
                    RetryDecision::GiveUp(reason) => {
                        let fatal = match reason {
                            GiveUpReason::TimedOut => ImportError::Timeout(policy.timeout),
                            GiveUpReason::AttemptsExhausted => {
                                ImportError::AttemptsExhausted { attempts, stage }
                            }
                        };
                        job.record_error(now, fatal.stage(), fatal.to_string(), None);
                        job.state = JobState::Failed;
                        job.next_attempt_at = None;
                    }
                }
                decision = Some(outcome);
            })
            .await?;
        match decision {
            Some(RetryDecision::RetryAfter(delay)) => {
                crate::metrics::retry_scheduled(&self.target, stage.as_str());
                debug!(
                    target = "bulk.machine",
                    %job_id,
                    stage = stage.as_str(),
                    attempt = job.attempt_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retry scheduled"
                );
            }
            Some(RetryDecision::GiveUp(reason)) => {
                warn!(
                    target = "bulk.machine",
                    %job_id,
                    shop = %self.target,
                    ?reason,
                    error = %err,
                    "giving up on bulk import"
                );
            }
            None => {}
        }
        Ok(job)
    }
}

fn complete(job: &mut BulkImportJob, now: DateTime<Utc>) {
    job.state = JobState::Completed;
    job.completed_at = Some(now);
    job.next_attempt_at = None;
}

fn retry_at(now: DateTime<Utc>, delay: std::time::Duration) -> Option<DateTime<Utc>> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
}
