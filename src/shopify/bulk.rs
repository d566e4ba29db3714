use crate::error::ImportError;
use crate::http::{build_api_client, build_download_client};
use crate::shopify::config::graphql_endpoint;
use crate::shopify::query::{CANCEL_MUTATION, OPERATION_STATUS_QUERY, RUN_QUERY_MUTATION};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use reqwest::header::RANGE;
use reqwest::{Client, Response, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, warn};

/// Result file bytes, in order, starting at the requested offset.
pub type ByteStream = BoxStream<'static, Result<Bytes, ImportError>>;

#[derive(Debug, Clone, PartialEq)]
pub enum OperationStatus {
    Running,
    Completed {
        /// `None` when the export matched nothing.
        result_url: Option<String>,
        object_count: Option<u64>,
    },
    Failed {
        error: String,
    },
    Cancelled,
}

/// Provider-side bulk operation lifecycle.
#[async_trait]
pub trait BulkOperationClient: Send + Sync {
    async fn submit(&self, query: &str) -> Result<String, ImportError>;
    async fn poll(&self, operation_id: &str) -> Result<OperationStatus, ImportError>;
    async fn fetch_stream(&self, url: &str, offset: u64) -> Result<ByteStream, ImportError>;
    async fn cancel(&self, operation_id: &str) -> Result<(), ImportError>;
}

pub struct ShopifyBulkClient {
    api: Client,
    download: Client,
    endpoint: String,
    access_token: String,
}

impl ShopifyBulkClient {
    pub fn new(shop_url: &str, api_version: &str, access_token: impl Into<String>) -> Self {
        Self {
            api: build_api_client(),
            download: build_download_client(),
            endpoint: graphql_endpoint(shop_url, api_version),
            access_token: access_token.into(),
        }
    }

    async fn execute(&self, document: &str, variables: Value) -> reqwest::Result<Response> {
        self.api
            .post(&self.endpoint)
            .header("X-Shopify-Access-Token", &self.access_token)
            .json(&json!({ "query": document, "variables": variables }))
            .send()
            .await
    }
}

#[async_trait]
impl BulkOperationClient for ShopifyBulkClient {
    async fn submit(&self, query: &str) -> Result<String, ImportError> {
        let response = self
            .execute(RUN_QUERY_MUTATION, json!({ "query": query }))
            .await
            .map_err(|err| ImportError::Submission(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ImportError::Submission(format!("HTTP {}", status)));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|err| ImportError::Submission(err.to_string()))?;
        let operation_id = parse_submit_response(&body)?;
        debug!(target = "bulk.shopify", %operation_id, "bulk query accepted");
        Ok(operation_id)
    }

    async fn poll(&self, operation_id: &str) -> Result<OperationStatus, ImportError> {
        let response = self
            .execute(OPERATION_STATUS_QUERY, json!({ "id": operation_id }))
            .await
            .map_err(|err| ImportError::TransientPoll(err.to_string()))?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(ImportError::TransientPoll(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(ImportError::PermanentPoll(format!("HTTP {}", status)));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|err| ImportError::TransientPoll(err.to_string()))?;
        parse_poll_response(&body)
    }

    async fn fetch_stream(&self, url: &str, offset: u64) -> Result<ByteStream, ImportError> {
        let mut request = self.download.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = request
            .send()
            .await
            .map_err(|err| ImportError::TransientFetch(err.to_string()))?;
        let status = response.status();
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| ImportError::TransientFetch(err.to_string())))
            .boxed();
        match status {
            StatusCode::PARTIAL_CONTENT => Ok(bytes),
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(stream::empty().boxed()),
            s if s.is_success() => {
                if offset > 0 {
                    warn!(
                        target = "bulk.shopify",
                        offset, "range ignored by result host, skipping prefix locally"
                    );
                }
                Ok(skip_prefix(bytes, offset))
            }
            s => Err(ImportError::TransientFetch(format!("HTTP {}", s))),
        }
    }

    async fn cancel(&self, operation_id: &str) -> Result<(), ImportError> {
        let response = self
            .execute(CANCEL_MUTATION, json!({ "id": operation_id }))
            .await
            .map_err(|err| ImportError::TransientPoll(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ImportError::TransientPoll(format!("HTTP {}", status)));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|err| ImportError::TransientPoll(err.to_string()))?;
        match user_errors(&body["data"]["bulkOperationCancel"]) {
            Some(message) => Err(ImportError::PermanentPoll(message)),
            None => Ok(()),
        }
    }
}

fn error_messages(errors: &[Value]) -> String {
    errors
        .iter()
        .filter_map(|e| e["message"].as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

fn user_errors(payload: &Value) -> Option<String> {
    payload["userErrors"]
        .as_array()
        .filter(|errs| !errs.is_empty())
        .map(|errs| error_messages(errs))
}

pub(crate) fn parse_submit_response(body: &Value) -> Result<String, ImportError> {
    if let Some(errors) = body["errors"].as_array().filter(|e| !e.is_empty()) {
        return Err(ImportError::Submission(error_messages(errors)));
    }
    let payload = &body["data"]["bulkOperationRunQuery"];
    if let Some(message) = user_errors(payload) {
        return Err(ImportError::Submission(message));
    }
    payload["bulkOperation"]["id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ImportError::Submission("response carried no bulk operation id".into()))
}

pub(crate) fn parse_poll_response(body: &Value) -> Result<OperationStatus, ImportError> {
    if let Some(errors) = body["errors"].as_array().filter(|e| !e.is_empty()) {
        let transient = errors.iter().any(|e| {
            matches!(
                e["extensions"]["code"].as_str(),
                Some("THROTTLED" | "INTERNAL_SERVER_ERROR")
            )
        });
        let message = error_messages(errors);
        return Err(if transient {
            ImportError::TransientPoll(message)
        } else {
            ImportError::PermanentPoll(message)
        });
    }
    let node = &body["data"]["node"];
    if node.is_null() {
        return Err(ImportError::PermanentPoll(
            "bulk operation not found".to_string(),
        ));
    }
    let status = node["status"].as_str().unwrap_or_default();
    match status {
        "CREATED" | "RUNNING" | "CANCELING" => Ok(OperationStatus::Running),
        "COMPLETED" => Ok(OperationStatus::Completed {
            result_url: node["url"]
                .as_str()
                .filter(|u| !u.is_empty())
                .map(str::to_string),
            object_count: match &node["objectCount"] {
                Value::String(s) => s.parse().ok(),
                other => other.as_u64(),
            },
        }),
        "FAILED" => Ok(OperationStatus::Failed {
            error: node["errorCode"].as_str().unwrap_or("FAILED").to_string(),
        }),
        "EXPIRED" => Ok(OperationStatus::Failed {
            error: "EXPIRED".to_string(),
        }),
        "CANCELED" => Ok(OperationStatus::Cancelled),
        other => Err(ImportError::PermanentPoll(format!(
            "unrecognised bulk operation status `{other}`"
        ))),
    }
}

/// Drop the first `skip` bytes of a stream whose origin ignored the range request.
pub(crate) fn skip_prefix(bytes: ByteStream, skip: u64) -> ByteStream {
    if skip == 0 {
        return bytes;
    }
    let mut remaining = skip;
    bytes
        .filter_map(move |item| {
            let out = match item {
                Ok(mut chunk) => {
                    if remaining >= chunk.len() as u64 {
                        remaining -= chunk.len() as u64;
                        None
                    } else {
                        let tail = chunk.split_off(remaining as usize);
                        remaining = 0;
                        Some(Ok(tail))
                    }
                }
                Err(err) => Some(Err(err)),
            };
            futures::future::ready(out)
        })
        .boxed()
}
