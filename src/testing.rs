use crate::clock::Clock;
use crate::error::ImportError;
use crate::models::CatalogRecord;
use crate::shopify::{BulkOperationClient, ByteStream, OperationStatus};
use crate::sink::{CatalogSink, MemorySink, SinkError, UpsertOutcome};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use futures::stream;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap()
}

pub fn chunked(data: Vec<u8>, size: usize) -> ByteStream {
    let size = size.max(1);
    let chunks: Vec<Result<Bytes, ImportError>> = data
        .chunks(size)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    stream::iter(chunks).boxed()
}

/// Two products: a mug with two variants, a tee with one variant and one image.
pub fn sample_export() -> Vec<u8> {
    [
        r#"{"id":"gid://shopify/Product/1","title":"Mug","vendor":"Acme","status":"ACTIVE","tags":["kitchen"],"options":[{"name":"Color","values":["Red","Blue"]}]}"#,
        r#"{"id":"gid://shopify/ProductVariant/11","sku":"MUG-RED","price":"10.00","inventoryItem":{"measurement":{"weight":{"unit":"KILOGRAMS","value":0.4}}},"selectedOptions":[{"name":"Color","value":"Red"}],"__parentId":"gid://shopify/Product/1"}"#,
        r#"{"id":"gid://shopify/ProductVariant/12","sku":"MUG-BLUE","price":"12.50","inventoryItem":{"measurement":{"weight":{"unit":"KILOGRAMS","value":0.4}}},"selectedOptions":[{"name":"Color","value":"Blue"}],"__parentId":"gid://shopify/Product/1"}"#,
        r#"{"id":"gid://shopify/Product/2","title":"Tee","productType":"Apparel"}"#,
        r#"{"id":"gid://shopify/ProductVariant/21","sku":"TEE-M","price":"20.00","inventoryQuantity":7,"__parentId":"gid://shopify/Product/2"}"#,
        r#"{"id":"gid://shopify/ProductImage/201","src":"https://cdn.example/tee.png","altText":"Tee","__parentId":"gid://shopify/Product/2"}"#,
    ]
    .iter()
    .map(|line| format!("{line}\n"))
    .collect::<String>()
    .into_bytes()
}

/// `count` single-variant products.
pub fn export_of(count: usize) -> Vec<u8> {
    (1..=count)
        .map(|n| {
            format!(
                "{{\"id\":\"gid://shopify/Product/{n}\",\"title\":\"P{n}\"}}\n\
                 {{\"id\":\"gid://shopify/ProductVariant/{n}0\",\"sku\":\"SKU-{n}\",\"__parentId\":\"gid://shopify/Product/{n}\"}}\n"
            )
        })
        .collect::<String>()
        .into_bytes()
}

pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(Mutex::new(at))
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.0.lock().unwrap();
        *guard += chrono::TimeDelta::from_std(by).unwrap();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

const FETCH_CHUNK: usize = 16;

pub struct ScriptedClient {
    submits: Mutex<VecDeque<Result<String, ImportError>>>,
    polls: Mutex<VecDeque<Result<OperationStatus, ImportError>>>,
    payload: Vec<u8>,
    fetch_failures: AtomicUsize,
    interrupt_at: Mutex<Option<u64>>,
    pub fetch_offsets: Mutex<Vec<u64>>,
    pub cancelled: Mutex<Vec<String>>,
    pub poll_calls: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            submits: Mutex::new(VecDeque::new()),
            polls: Mutex::new(VecDeque::new()),
            payload,
            fetch_failures: AtomicUsize::new(0),
            interrupt_at: Mutex::new(None),
            fetch_offsets: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            poll_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_submit(self, result: Result<String, ImportError>) -> Self {
        self.submits.lock().unwrap().push_back(result);
        self
    }

    /// Poll answers in order; once drained the operation reports `Running`.
    pub fn with_polls(self, polls: Vec<Result<OperationStatus, ImportError>>) -> Self {
        self.polls.lock().unwrap().extend(polls);
        self
    }

    pub fn completing_after(self, running: usize) -> Self {
        let mut polls: Vec<_> = (0..running).map(|_| Ok(OperationStatus::Running)).collect();
        polls.push(Ok(completed()));
        self.with_polls(polls)
    }

    pub fn failing_fetches(self, times: usize) -> Self {
        self.fetch_failures.store(times, Ordering::SeqCst);
        self
    }

    /// The first fetch that starts before `byte` drops its connection at `byte`.
    pub fn interrupt_once_at(self, byte: u64) -> Self {
        *self.interrupt_at.lock().unwrap() = Some(byte);
        self
    }

    pub fn offsets(&self) -> Vec<u64> {
        self.fetch_offsets.lock().unwrap().clone()
    }
}

pub fn completed() -> OperationStatus {
    OperationStatus::Completed {
        result_url: Some("https://storage.example/export.jsonl".into()),
        object_count: None,
    }
}

#[async_trait]
impl BulkOperationClient for ScriptedClient {
    async fn submit(&self, _query: &str) -> Result<String, ImportError> {
        self.submits
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("gid://shopify/BulkOperation/1".into()))
    }

    async fn poll(&self, _operation_id: &str) -> Result<OperationStatus, ImportError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        self.polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(OperationStatus::Running))
    }

    async fn fetch_stream(&self, _url: &str, offset: u64) -> Result<ByteStream, ImportError> {
        self.fetch_offsets.lock().unwrap().push(offset);
        if self
            .fetch_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ImportError::TransientFetch("connection reset".into()));
        }
        let start = (offset as usize).min(self.payload.len());
        let interrupt = {
            let mut guard = self.interrupt_at.lock().unwrap();
            if matches!(*guard, Some(at) if at > offset) {
                guard.take()
            } else {
                None
            }
        };
        match interrupt {
            Some(at) => {
                let end = (at as usize).min(self.payload.len());
                let head = chunked(self.payload[start..end].to_vec(), FETCH_CHUNK);
                let tail = stream::iter(vec![Err(ImportError::TransientFetch(
                    "connection dropped mid-body".into(),
                ))]);
                Ok(head.chain(tail).boxed())
            }
            None => Ok(chunked(self.payload[start..].to_vec(), FETCH_CHUNK)),
        }
    }

    async fn cancel(&self, operation_id: &str) -> Result<(), ImportError> {
        self.cancelled
            .lock()
            .unwrap()
            .push(operation_id.to_string());
        Ok(())
    }
}

/// Catalog that is unreachable for its first `failures` calls.
pub struct FlakySink {
    pub inner: MemorySink,
    failures: AtomicUsize,
}

impl FlakySink {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: MemorySink::new(),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl CatalogSink for FlakySink {
    async fn upsert(
        &self,
        target: &str,
        record: &CatalogRecord,
    ) -> Result<UpsertOutcome, SinkError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SinkError::Unavailable("HTTP 503".into()));
        }
        self.inner.upsert(target, record).await
    }
}

/// Catalog that refuses one product outright.
pub struct RejectingSink {
    pub product_id: String,
}

#[async_trait]
impl CatalogSink for RejectingSink {
    async fn upsert(
        &self,
        _target: &str,
        record: &CatalogRecord,
    ) -> Result<UpsertOutcome, SinkError> {
        if record.product_id == self.product_id {
            return Err(SinkError::Rejected("HTTP 422".into()));
        }
        Ok(UpsertOutcome::Applied)
    }
}
