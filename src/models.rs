use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::{fmt, time::Duration};
use uuid::Uuid;

/// Lifecycle of a single bulk import.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Submitted,
    Polling,
    Fetching,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Submitted => "submitted",
            JobState::Polling => "polling",
            JobState::Fetching => "fetching",
            JobState::Streaming => "streaming",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// States in which a provider-side operation exists for the job.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobState::Submitted | JobState::Polling | JobState::Fetching | JobState::Streaming
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Submit,
    Poll,
    Fetch,
    Stream,
    Sink,
    Timeout,
    Cancel,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Submit => "submit",
            Stage::Poll => "poll",
            Stage::Fetch => "fetch",
            Stage::Stream => "stream",
            Stage::Sink => "sink",
            Stage::Timeout => "timeout",
            Stage::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorEntry {
    pub at: DateTime<Utc>,
    pub stage: Stage,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BulkImportJob {
    pub job_id: Uuid,
    pub target: String,
    pub query: String,
    #[serde(default)]
    pub provider_operation_id: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_polled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result_url: String,
    #[serde(default)]
    pub cursor: u64,
    #[serde(default)]
    pub records_processed: u64,
    #[serde(default)]
    pub records_failed: u64,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub error_log: Vec<ErrorEntry>,
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recent_failures: Vec<DateTime<Utc>>,
}

impl BulkImportJob {
    pub fn new(target: impl Into<String>, query: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            target: target.into(),
            query: query.into(),
            provider_operation_id: String::new(),
            state: JobState::Pending,
            created_at: now,
            submitted_at: None,
            last_polled_at: None,
            completed_at: None,
            result_url: String::new(),
            cursor: 0,
            records_processed: 0,
            records_failed: 0,
            attempt_count: 0,
            last_error: None,
            error_log: Vec::new(),
            next_attempt_at: None,
            recent_failures: Vec::new(),
        }
    }

    pub fn record_error(
        &mut self,
        at: DateTime<Utc>,
        stage: Stage,
        message: impl Into<String>,
        offset: Option<u64>,
    ) {
        let message = message.into();
        self.last_error = Some(message.clone());
        self.error_log.push(ErrorEntry {
            at,
            stage,
            message,
            offset,
        });
    }

    /// Wall-clock time since submission; zero before the job was submitted.
    pub fn elapsed_since_submit(&self, now: DateTime<Utc>) -> Duration {
        self.submitted_at
            .and_then(|at| (now - at).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CatalogRecord {
    pub product_id: String,
    pub title: String,
    pub description: Option<String>,
    pub product_type: Option<String>,
    pub vendor: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub options: Vec<ProductOption>,
    #[serde(default)]
    pub variants: Vec<VariantRecord>,
    #[serde(default)]
    pub images: Vec<ImageRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductOption {
    pub name: String,
    #[serde(default)]
    pub values: Vec<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VariantRecord {
    pub variant_id: String,
    pub sku: Option<String>,
    pub title: Option<String>,
    pub price: Option<String>,
    pub compare_at_price: Option<String>,
    pub inventory_quantity: Option<i64>,
    pub weight: Option<f64>,
    pub weight_uom: Option<String>,
    #[serde(default)]
    pub option_values: Vec<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ImageRecord {
    pub image_id: String,
    pub src: Option<String>,
    pub alt_text: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
