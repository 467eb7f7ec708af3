//! Asynchronous bulk indexer.
//!
//! Documents added to a [`BulkIndexer`] are spread round-robin over a fixed
//! set of flush workers. Each worker buffers NDJSON lines and sends one bulk
//! request when the buffer reaches the byte threshold or the flush interval
//! elapses. Every added document resolves exactly once: the outcome is sent
//! to the consumer channel when one is configured, and logged otherwise.

use crate::config::BulkConfig;
use crate::document::Document;
use crate::error::{RepositoryError, Result};
use crate::executor::{BackendRequest, Executor};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bulk operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkAction {
    /// Index a document, replacing any existing one.
    Index,
    /// Create a document, failing if it exists.
    Create,
    /// Partially update a document. The content is sent as `{"doc": ...}`.
    Update,
    /// Update with a caller-built body such as `{"script": ...}` or
    /// `{"doc": ..., "doc_as_upsert": true}`, sent as is.
    #[serde(rename = "update_raw")]
    UpdateRaw,
    /// Delete a document.
    Delete,
}

impl BulkAction {
    /// Action name on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkAction::Index => "index",
            BulkAction::Create => "create",
            BulkAction::Update | BulkAction::UpdateRaw => "update",
            BulkAction::Delete => "delete",
        }
    }
}

impl fmt::Display for BulkAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one document submitted to a [`BulkIndexer`].
#[derive(Debug)]
pub struct BulkIndexerResult {
    /// The submitted document.
    pub document: Document,
    /// The submitted action.
    pub action: BulkAction,
    /// Per-item status reported by the backend, if the batch reached it.
    pub status: Option<u16>,
    /// Failure, if any.
    pub error: Option<RepositoryError>,
}

impl BulkIndexerResult {
    /// Whether the item succeeded.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Bulk operation response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkResponse {
    /// Time taken in milliseconds.
    #[serde(default)]
    pub took: u64,
    /// Whether there were errors.
    #[serde(default)]
    pub errors: bool,
    /// Individual item results, in request order.
    #[serde(default)]
    pub items: Vec<BulkItem>,
}

/// Individual bulk item result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkItem {
    /// Operation type.
    #[serde(flatten)]
    pub operation: BulkItemResult,
}

/// Bulk item result keyed by action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkItemResult {
    /// Index result.
    Index(BulkItemStatus),
    /// Create result.
    Create(BulkItemStatus),
    /// Update result.
    Update(BulkItemStatus),
    /// Delete result.
    Delete(BulkItemStatus),
}

impl BulkItemResult {
    /// Status of the item regardless of action.
    pub fn status(&self) -> &BulkItemStatus {
        match self {
            BulkItemResult::Index(s)
            | BulkItemResult::Create(s)
            | BulkItemResult::Update(s)
            | BulkItemResult::Delete(s) => s,
        }
    }
}

/// Status of a bulk item operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkItemStatus {
    /// Index name.
    #[serde(rename = "_index", default)]
    pub index: String,
    /// Document ID.
    #[serde(rename = "_id", default)]
    pub id: String,
    /// Document version.
    #[serde(rename = "_version")]
    pub version: Option<i64>,
    /// Result status.
    pub result: Option<String>,
    /// HTTP status code.
    pub status: u16,
    /// Error details.
    pub error: Option<BulkItemError>,
}

/// Bulk item error details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkItemError {
    /// Error type.
    #[serde(rename = "type", default)]
    pub error_type: String,
    /// Error reason.
    #[serde(default)]
    pub reason: String,
}

impl BulkItemStatus {
    /// Check if the operation was successful.
    pub fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300 && self.error.is_none()
    }

    fn error_message(&self) -> String {
        match &self.error {
            Some(e) => format!("[{}] {}: {}", self.status, e.error_type, e.reason),
            None => format!("[{}] bulk item failed", self.status),
        }
    }
}

/// Snapshot of bulk indexer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkIndexerStats {
    /// Documents accepted by `add`.
    pub num_added: u64,
    /// Documents sent in a bulk request that reached the backend.
    pub num_flushed: u64,
    /// Documents that failed.
    pub num_failed: u64,
    /// Successful index actions.
    pub num_indexed: u64,
    /// Successful create actions.
    pub num_created: u64,
    /// Successful update actions.
    pub num_updated: u64,
    /// Successful delete actions.
    pub num_deleted: u64,
    /// Bulk requests sent.
    pub num_requests: u64,
}

#[derive(Default)]
struct Counters {
    added: AtomicU64,
    flushed: AtomicU64,
    failed: AtomicU64,
    indexed: AtomicU64,
    created: AtomicU64,
    updated: AtomicU64,
    deleted: AtomicU64,
    requests: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> BulkIndexerStats {
        BulkIndexerStats {
            num_added: self.added.load(Ordering::Relaxed),
            num_flushed: self.flushed.load(Ordering::Relaxed),
            num_failed: self.failed.load(Ordering::Relaxed),
            num_indexed: self.indexed.load(Ordering::Relaxed),
            num_created: self.created.load(Ordering::Relaxed),
            num_updated: self.updated.load(Ordering::Relaxed),
            num_deleted: self.deleted.load(Ordering::Relaxed),
            num_requests: self.requests.load(Ordering::Relaxed),
        }
    }

    fn succeeded(&self, action: BulkAction) {
        let counter = match action {
            BulkAction::Index => &self.indexed,
            BulkAction::Create => &self.created,
            BulkAction::Update | BulkAction::UpdateRaw => &self.updated,
            BulkAction::Delete => &self.deleted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct BulkItemRequest {
    action: BulkAction,
    document: Document,
    lines: Vec<Value>,
    size: usize,
}

impl BulkItemRequest {
    fn new(action: BulkAction, document: Document) -> Result<Self> {
        let index = document.require_index()?;

        let mut meta = json!({ "_index": index });
        let id = document.id().trim();
        if !id.is_empty() {
            meta["_id"] = json!(id);
        }

        let mut lines = vec![json!({ action.as_str(): meta })];
        if action != BulkAction::Delete {
            let content = document.content_json()?;
            lines.push(match action {
                BulkAction::Update => json!({ "doc": content }),
                _ => content,
            });
        }

        // One newline per NDJSON line.
        let size = lines.iter().map(|l| l.to_string().len() + 1).sum();

        Ok(Self {
            action,
            document,
            lines,
            size,
        })
    }
}

/// Shared state between the handle and its workers.
struct Shared {
    executor: Arc<dyn Executor>,
    consumer: Option<mpsc::Sender<BulkIndexerResult>>,
    counters: Counters,
    refresh: bool,
}

/// Batching write pipeline over an [`Executor`].
///
/// # Example
///
/// ```rust,no_run
/// use armature_docstore::{BulkAction, BulkConfig, Document, Repository};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example(repository: Repository) -> armature_docstore::Result<()> {
/// let (tx, mut rx) = tokio::sync::mpsc::channel(64);
/// let indexer = repository.bulk_indexer(BulkConfig::default(), Some(tx));
///
/// let doc = Document::builder().index("orders").content(r#"{"total":42}"#).build();
/// indexer.add(BulkAction::Index, doc).await?;
///
/// tokio::spawn(async move {
///     while let Some(outcome) = rx.recv().await {
///         println!("{} -> {:?}", outcome.document.id(), outcome.error);
///     }
/// });
///
/// indexer.close(&CancellationToken::new()).await?;
/// # Ok(())
/// # }
/// ```
pub struct BulkIndexer {
    shared: Arc<Shared>,
    senders: RwLock<Option<Vec<mpsc::Sender<BulkItemRequest>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
    stats_cancel: CancellationToken,
    stats_task: Mutex<Option<JoinHandle<()>>>,
}

impl BulkIndexer {
    /// Start the flush workers, and the stats loop when enabled.
    ///
    /// Must be called from within a Tokio runtime. When a consumer is given,
    /// workers wait for it to accept each outcome, so it must be drained for
    /// [`BulkIndexer::close`] to complete.
    pub fn new(
        executor: Arc<dyn Executor>,
        config: BulkConfig,
        consumer: Option<mpsc::Sender<BulkIndexerResult>>,
    ) -> Self {
        debug!(
            config = %serde_json::to_string(&config).unwrap_or_default(),
            "Starting bulk indexer"
        );

        let shared = Arc::new(Shared {
            executor,
            consumer,
            counters: Counters::default(),
            refresh: config.refresh,
        });

        let workers = config.workers.max(1);
        let capacity = config.queue_capacity.max(1);
        let flush_interval = config.flush_interval.max(Duration::from_millis(1));

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let (tx, rx) = mpsc::channel(capacity);
            let worker = Worker {
                id,
                shared: shared.clone(),
                flush_bytes: config.flush_bytes,
                flush_interval,
                buffer: Vec::new(),
                buffered_bytes: 0,
            };
            senders.push(tx);
            handles.push(tokio::spawn(worker.run(rx)));
        }

        let stats_cancel = CancellationToken::new();
        let stats_task = config.stats_enabled.then(|| {
            tokio::spawn(stats_loop(
                shared.clone(),
                config.stats_interval.max(Duration::from_millis(1)),
                stats_cancel.clone(),
            ))
        });

        Self {
            shared,
            senders: RwLock::new(Some(senders)),
            workers: Mutex::new(handles),
            next: AtomicUsize::new(0),
            stats_cancel,
            stats_task: Mutex::new(stats_task),
        }
    }

    /// Queue a document.
    ///
    /// Fails with [`RepositoryError::MalformedIndex`] for an empty index,
    /// [`RepositoryError::MalformedDocumentContent`] when a non-delete action
    /// has no valid JSON content, and [`RepositoryError::Closed`] after
    /// [`BulkIndexer::close`]. Waits while the chosen worker's queue is full.
    pub async fn add(&self, action: BulkAction, document: Document) -> Result<()> {
        let item = BulkItemRequest::new(action, document)?;

        let sender = {
            let senders = self.senders.read();
            let senders = senders.as_ref().ok_or(RepositoryError::Closed)?;
            let i = self.next.fetch_add(1, Ordering::Relaxed) % senders.len();
            senders[i].clone()
        };

        sender.send(item).await.map_err(|_| RepositoryError::Closed)?;
        self.shared.counters.added.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Flush everything queued and wait for every outcome to be delivered.
    ///
    /// Returns [`RepositoryError::Cancelled`] if `cancel` fires first; the
    /// outcome of items still in flight is then unknown. Further calls to
    /// [`BulkIndexer::add`] fail with [`RepositoryError::Closed`]. The stats
    /// loop, when enabled, is stopped and awaited before returning.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        let senders = self.senders.write().take();
        if senders.is_none() {
            return Err(RepositoryError::Closed);
        }
        drop(senders);

        let handles = std::mem::take(&mut *self.workers.lock());
        let join_all = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Bulk worker terminated abnormally");
                }
            }
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                warn!("Bulk indexer close cancelled, in-flight outcomes are unknown");
                Err(RepositoryError::Cancelled)
            }
            _ = join_all => Ok(()),
        };

        self.stats_cancel.cancel();
        let stats_task = self.stats_task.lock().take();
        if let Some(handle) = stats_task {
            if let Err(e) = handle.await {
                error!(error = %e, "Bulk stats loop terminated abnormally");
            }
        }

        let stats = self.stats();
        info!(
            added = stats.num_added,
            flushed = stats.num_flushed,
            failed = stats.num_failed,
            requests = stats.num_requests,
            "Bulk indexer closed"
        );
        result
    }

    /// Current counters.
    pub fn stats(&self) -> BulkIndexerStats {
        self.shared.counters.snapshot()
    }
}

impl Drop for BulkIndexer {
    fn drop(&mut self) {
        self.stats_cancel.cancel();
    }
}

impl fmt::Debug for BulkIndexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkIndexer")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

struct Worker {
    id: usize,
    shared: Arc<Shared>,
    flush_bytes: usize,
    flush_interval: Duration,
    buffer: Vec<BulkItemRequest>,
    buffered_bytes: usize,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<BulkItemRequest>) {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(item) => {
                        if !self.buffer.is_empty() && self.buffered_bytes + item.size > self.flush_bytes {
                            self.flush().await;
                        }
                        self.buffered_bytes += item.size;
                        self.buffer.push(item);
                        if self.buffered_bytes >= self.flush_bytes {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !self.buffer.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }

        if !self.buffer.is_empty() {
            self.flush().await;
        }
        debug!(worker = self.id, "Bulk worker stopped");
    }

    async fn flush(&mut self) {
        let items = std::mem::take(&mut self.buffer);
        let bytes = std::mem::replace(&mut self.buffered_bytes, 0);
        let counters = &self.shared.counters;

        debug!(worker = self.id, items = items.len(), bytes, "Flushing bulk request");

        let lines = items.iter().flat_map(|item| item.lines.iter().cloned()).collect();
        counters.requests.fetch_add(1, Ordering::Relaxed);

        let response = match self
            .shared
            .executor
            .execute(BackendRequest::Bulk {
                lines,
                refresh: self.shared.refresh,
            })
            .await
        {
            Ok(response) if response.is_success() => response,
            Ok(response) => return self.fail_batch(items, response.error_message()).await,
            Err(e) => return self.fail_batch(items, e.to_string()).await,
        };

        let parsed: BulkResponse = match serde_json::from_slice(&response.body) {
            Ok(parsed) => parsed,
            Err(e) => {
                let err = RepositoryError::decode("bulk response", e);
                return self.fail_batch(items, err.to_string()).await;
            }
        };

        counters.flushed.fetch_add(items.len() as u64, Ordering::Relaxed);

        let mut statuses = parsed.items.into_iter();
        for item in items {
            let outcome = match statuses.next() {
                Some(entry) => {
                    let status = entry.operation.status();
                    if status.is_success() {
                        counters.succeeded(item.action);
                        self.outcome(item, Some(status.status), None)
                    } else {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        let err = RepositoryError::Backend(status.error_message());
                        self.outcome(item, Some(status.status), Some(err))
                    }
                }
                None => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    let err = RepositoryError::Bulk("no item status in bulk response".to_string());
                    self.outcome(item, None, Some(err))
                }
            };
            self.deliver(outcome).await;
        }
    }

    /// Report a whole-batch failure against every item in it.
    async fn fail_batch(&self, items: Vec<BulkItemRequest>, message: String) {
        error!(worker = self.id, items = items.len(), error = %message, "Bulk request failed");
        self.shared
            .counters
            .failed
            .fetch_add(items.len() as u64, Ordering::Relaxed);

        for item in items {
            let outcome = self.outcome(item, None, Some(RepositoryError::Bulk(message.clone())));
            self.deliver(outcome).await;
        }
    }

    fn outcome(
        &self,
        item: BulkItemRequest,
        status: Option<u16>,
        error: Option<RepositoryError>,
    ) -> BulkIndexerResult {
        BulkIndexerResult {
            document: item.document,
            action: item.action,
            status,
            error,
        }
    }

    async fn deliver(&self, outcome: BulkIndexerResult) {
        match &self.shared.consumer {
            Some(consumer) => {
                if let Err(mpsc::error::SendError(outcome)) = consumer.send(outcome).await {
                    warn!(
                        id = outcome.document.id(),
                        index = outcome.document.index(),
                        "Bulk consumer dropped, outcome discarded"
                    );
                }
            }
            None => match &outcome.error {
                None => debug!(
                    id = outcome.document.id(),
                    index = outcome.document.index(),
                    action = %outcome.action,
                    "Bulk item succeeded"
                ),
                Some(e) => error!(
                    id = outcome.document.id(),
                    index = outcome.document.index(),
                    action = %outcome.action,
                    error = %e,
                    "Bulk item failed"
                ),
            },
        }
    }
}

async fn stats_loop(shared: Arc<Shared>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let stats = shared.counters.snapshot();
                info!(
                    added = stats.num_added,
                    flushed = stats.num_flushed,
                    failed = stats.num_failed,
                    indexed = stats.num_indexed,
                    created = stats.num_created,
                    updated = stats.num_updated,
                    deleted = stats.num_deleted,
                    requests = stats.num_requests,
                    "Bulk indexer stats"
                );
            }
        }
    }
}
