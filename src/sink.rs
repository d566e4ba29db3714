use crate::http::build_api_client;
use crate::models::CatalogRecord;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::env;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use urlencoding::encode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Applied,
    /// The catalog refused this record; the import carries on with the next one.
    Conflict(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
    #[error("catalog rejected request: {0}")]
    Rejected(String),
}

/// Idempotent product upsert keyed by product id. Replaying a record is harmless.
#[async_trait]
pub trait CatalogSink: Send + Sync {
    async fn upsert(&self, target: &str, record: &CatalogRecord)
    -> Result<UpsertOutcome, SinkError>;
}

pub struct ErpSink {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ErpSink {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: build_api_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: Some(token.into()).filter(|t| !t.trim().is_empty()),
        }
    }

    /// `ERP_CATALOG_URL` + `ERP_API_TOKEN`; `None` when the URL is unset.
    pub fn from_env() -> Option<Self> {
        let base = env::var("ERP_CATALOG_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())?;
        let token = env::var("ERP_API_TOKEN").unwrap_or_default();
        info!(target = "bulk.sink", base_url = %base, "using ERP catalog sink");
        Some(Self::new(base, token))
    }
}

#[async_trait]
impl CatalogSink for ErpSink {
    async fn upsert(
        &self,
        target: &str,
        record: &CatalogRecord,
    ) -> Result<UpsertOutcome, SinkError> {
        let url = format!(
            "{}/catalog/{}/products/{}",
            self.base_url,
            encode(target),
            encode(&record.product_id)
        );
        let mut request = self.client.put(url).json(record);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("token {token}"));
        }
        let response = request
            .send()
            .await
            .map_err(|err| SinkError::Unavailable(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(UpsertOutcome::Applied);
        }
        let detail = response.text().await.unwrap_or_default();
        let message = if detail.trim().is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, detail.trim())
        };
        match status {
            StatusCode::CONFLICT => Ok(UpsertOutcome::Conflict(message)),
            StatusCode::TOO_MANY_REQUESTS => Err(SinkError::Unavailable(message)),
            s if s.is_server_error() => Err(SinkError::Unavailable(message)),
            _ => Err(SinkError::Rejected(message)),
        }
    }
}

/// In-process catalog keyed by `(target, product_id)`.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<HashMap<(String, String), CatalogRecord>>,
    conflicts: Vec<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Products whose upsert is answered with a conflict.
    #[cfg(test)]
    pub fn with_conflicts(ids: &[&str]) -> Self {
        Self {
            records: Mutex::default(),
            conflicts: ids.iter().map(|id| id.to_string()).collect(),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn get(&self, target: &str, product_id: &str) -> Option<CatalogRecord> {
        self.records
            .lock()
            .await
            .get(&(target.to_string(), product_id.to_string()))
            .cloned()
    }
}

#[async_trait]
impl CatalogSink for MemorySink {
    async fn upsert(
        &self,
        target: &str,
        record: &CatalogRecord,
    ) -> Result<UpsertOutcome, SinkError> {
        if self.conflicts.iter().any(|id| *id == record.product_id) {
            return Ok(UpsertOutcome::Conflict(format!(
                "{} conflicts with an existing item",
                record.product_id
            )));
        }
        let mut guard = self.records.lock().await;
        let replaced = guard
            .insert(
                (target.to_string(), record.product_id.clone()),
                record.clone(),
            )
            .is_some();
        debug!(target = "bulk.sink", product_id = %record.product_id, replaced, "upserted");
        Ok(UpsertOutcome::Applied)
    }
}
