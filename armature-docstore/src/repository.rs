//! Repository facade.

use crate::bulk::{BulkIndexer, BulkIndexerResult};
use crate::config::BulkConfig;
use crate::document::Document;
use crate::error::{RepositoryError, Result};
use crate::executor::{BackendRequest, BackendResponse, Executor, RequestKind};
use crate::option::SearchOption;
use crate::paginate::{PageStream, Paginator};
use crate::result::QueryResult;
use crate::update::UpdateOption;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Hits logged at trace level for each search response.
const LOG_SEARCH_RESULT_THRESHOLD: usize = 10;

/// Entry point for document operations.
///
/// # Example
///
/// ```rust,no_run
/// use armature_docstore::{OpenSearchClient, Repository, RepositoryConfig, SearchOption};
/// use std::sync::Arc;
///
/// # async fn example() -> armature_docstore::Result<()> {
/// let client = OpenSearchClient::connect(RepositoryConfig::default()).await?;
/// let repository = Repository::new(Arc::new(client));
///
/// let result = repository
///     .search("orders", &SearchOption::new().with_term("status", "open", "filter").with_size(10))
///     .await?;
/// println!("{} open orders", result.total);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Repository {
    executor: Arc<dyn Executor>,
}

impl Repository {
    /// Create a repository over a shared executor.
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    /// The executor requests are sent through.
    pub fn executor(&self) -> Arc<dyn Executor> {
        self.executor.clone()
    }

    /// Write documents one at a time, refreshing after each write.
    ///
    /// Every document is validated before the first request is sent, so a
    /// malformed document anywhere in `documents` means nothing is written.
    pub async fn create(&self, documents: &[Document]) -> Result<QueryResult> {
        let mut requests = Vec::with_capacity(documents.len());
        for doc in documents {
            let index = doc.require_index().map_err(log_error)?;
            let body = doc.content_json().map_err(log_error)?;
            let id = Some(doc.id().trim()).filter(|id| !id.is_empty()).map(str::to_string);

            trace!(index, id = doc.id(), query = "create", "Executing query");
            requests.push(BackendRequest::Index {
                index: index.to_string(),
                id,
                body,
                refresh: true,
            });
        }

        let mut created = QueryResult {
            documents: Some(Vec::with_capacity(requests.len())),
            ..Default::default()
        };
        for request in requests {
            let result = execute(self.executor.as_ref(), request).await?;
            created.total += result.total;
            if let (Some(all), Some(docs)) = (created.documents.as_mut(), result.documents) {
                all.extend(docs);
            }
        }
        Ok(created)
    }

    /// Partially update one document.
    pub async fn update(&self, doc: &Document, options: &UpdateOption) -> Result<QueryResult> {
        let index = doc.require_index().map_err(log_error)?;
        trace!(index, id = doc.id(), query = "update", "Executing query");
        trace!(options = %options, "Update options");

        let body = options.prepare_update(doc).map_err(log_error)?;
        execute(
            self.executor.as_ref(),
            BackendRequest::Update {
                index: index.to_string(),
                id: doc.id().trim().to_string(),
                body,
                refresh: true,
            },
        )
        .await
    }

    /// Delete every document matching `options`.
    ///
    /// Options that compose to an empty query delete nothing and return an
    /// empty result without contacting the backend.
    pub async fn delete(&self, index: &str, options: &SearchOption) -> Result<QueryResult> {
        let index = require_index(index)?;
        trace!(index, query = "delete", options = %options, "Executing query");

        let query = options.prepare_query();
        if !query.has_query() {
            debug!(index, "Delete skipped, no query predicates");
            return Ok(QueryResult::empty());
        }

        trace!(query = %query, "Deleting documents matching query");
        execute(
            self.executor.as_ref(),
            BackendRequest::DeleteByQuery {
                index: index.to_string(),
                body: query.query_body(),
                refresh: true,
            },
        )
        .await
    }

    /// Count documents matching `options`.
    ///
    /// Options that compose to an empty query return an empty result without
    /// contacting the backend.
    pub async fn count(&self, index: &str, options: &SearchOption) -> Result<QueryResult> {
        let index = require_index(index)?;
        trace!(index, query = "count", options = %options, "Executing query");

        let query = options.prepare_query();
        if !query.has_query() {
            debug!(index, "Count skipped, no query predicates");
            return Ok(QueryResult::empty());
        }

        execute(
            self.executor.as_ref(),
            BackendRequest::Count {
                index: index.to_string(),
                body: query.query_body(),
            },
        )
        .await
    }

    /// Search documents matching `options`.
    ///
    /// With an explicit size one bounded request is sent. Without one the
    /// search pages through every match; if a sum was requested the per-page
    /// sums are accumulated into `metrics` and no documents are returned.
    pub async fn search(&self, index: &str, options: &SearchOption) -> Result<QueryResult> {
        let index = require_index(index)?;
        trace!(index, query = "search", options = %options, "Executing query");

        let query = options.prepare_search();
        if !query.has_query() {
            debug!(index, "Search skipped, no query predicates");
            return Ok(QueryResult::empty());
        }

        if options.limit_result() {
            trace!(query = %query, "Search query");
            return execute(
                self.executor.as_ref(),
                BackendRequest::Search {
                    index: index.to_string(),
                    body: query.to_json(),
                },
            )
            .await;
        }

        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        let mut pages = self.paginate(index, options, cancel)?;

        let mut documents = Vec::new();
        let mut sum = 0.0;
        while let Some(page) = pages.next_page().await {
            let page = page?;
            if options.sum() && !page.metrics.is_empty() {
                sum += page.metric(options.sum_key()).unwrap_or_default();
            } else {
                documents.extend(page.documents.unwrap_or_default());
            }
        }

        let mut metrics = Map::new();
        if options.sum() {
            metrics.insert(options.sum_key().to_string(), json!(sum));
        }

        Ok(QueryResult {
            total: documents.len() as u64,
            documents: Some(documents),
            metrics,
        })
    }

    /// Stream every document matching `options` page by page.
    ///
    /// Fetching stops when the stream is dropped or `cancel` fires.
    pub fn paginate(
        &self,
        index: &str,
        options: &SearchOption,
        cancel: CancellationToken,
    ) -> Result<PageStream> {
        let index = require_index(index)?;
        Ok(Paginator::new(self.executor.clone(), index, options.clone()).stream(cancel))
    }

    /// Start a bulk indexer sharing this repository's executor.
    pub fn bulk_indexer(
        &self,
        config: BulkConfig,
        consumer: Option<mpsc::Sender<BulkIndexerResult>>,
    ) -> BulkIndexer {
        BulkIndexer::new(self.executor.clone(), config, consumer)
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").finish_non_exhaustive()
    }
}

fn require_index(index: &str) -> Result<&str> {
    let index = index.trim();
    if index.is_empty() {
        return Err(log_error(RepositoryError::MalformedIndex));
    }
    Ok(index)
}

fn log_error(err: RepositoryError) -> RepositoryError {
    error!(error = %err, "Query execution error");
    err
}

/// Send one request and decode the response by request kind.
pub(crate) async fn execute(executor: &dyn Executor, request: BackendRequest) -> Result<QueryResult> {
    let kind = request.kind();
    let index = request.index().unwrap_or_default().to_string();

    let response = executor.execute(request).await.map_err(log_error)?;
    if !response.is_success() {
        return Err(log_error(classify(kind, &response)));
    }

    decode(kind, &index, &response).map_err(log_error)
}

/// 400 is a caller-fixable query error; anything else is a backend failure.
pub(crate) fn classify(kind: RequestKind, response: &BackendResponse) -> RepositoryError {
    let message = response.error_message();
    if response.status == 400 {
        RepositoryError::Query {
            operation: kind.operation().to_string(),
            message,
        }
    } else {
        RepositoryError::Backend(message)
    }
}

fn decode(kind: RequestKind, index: &str, response: &BackendResponse) -> Result<QueryResult> {
    let body: Value = if response.body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&response.body)
            .map_err(|e| RepositoryError::decode("response body", e))?
    };

    match kind {
        RequestKind::Search => Ok(decode_search(&body)),
        RequestKind::Count => {
            let count = body["count"].as_u64().unwrap_or_default();
            debug!(count, "Retrieved result count");
            Ok(QueryResult {
                total: count,
                documents: Some(Vec::new()),
                ..Default::default()
            })
        }
        RequestKind::Index | RequestKind::Update => Ok(decode_write(index, &body)),
        RequestKind::DeleteByQuery => {
            let deleted = body["deleted"].as_u64().unwrap_or_default();
            debug!(index, deleted, "Deleted documents");
            Ok(QueryResult {
                total: deleted,
                documents: Some(Vec::new()),
                ..Default::default()
            })
        }
        RequestKind::Info | RequestKind::Bulk | RequestKind::Exists | RequestKind::Provision => {
            Err(RepositoryError::Invalid(format!(
                "unsupported request type for query result: {}",
                kind
            )))
        }
    }
}

fn decode_write(index: &str, body: &Value) -> QueryResult {
    let id = body["_id"].as_str().unwrap_or_default();
    let result = body["result"].as_str().unwrap_or_default();
    let index = body["_index"].as_str().unwrap_or(index);

    trace!(id, result, "Received query result");

    let doc = Document::builder()
        .id(id)
        .index(index)
        .json(&json!({ "result": result }))
        .build();

    QueryResult {
        total: 1,
        documents: Some(vec![doc]),
        ..Default::default()
    }
}

fn decode_search(body: &Value) -> QueryResult {
    let hits = body["hits"]["hits"].as_array().map(Vec::as_slice).unwrap_or_default();

    let tail = hits.len().saturating_sub(LOG_SEARCH_RESULT_THRESHOLD);
    trace!(hits = hits.len(), last = ?&hits[tail..], "Retrieved search hits");

    let documents = hits
        .iter()
        .map(|hit| {
            let content = hit
                .get("_source")
                .or_else(|| hit.get("fields"))
                .filter(|c| !c.is_null());

            let mut builder = Document::builder()
                .id(hit["_id"].as_str().unwrap_or_default())
                .index(hit["_index"].as_str().unwrap_or_default())
                .sort(hit["sort"].as_array().cloned().unwrap_or_default());
            if let Some(content) = content {
                builder = builder.json(content);
            }
            builder.build()
        })
        .collect();

    let total = match &body["hits"]["total"] {
        Value::Object(total) => total.get("value").and_then(Value::as_u64),
        other => other.as_u64(),
    }
    .unwrap_or_default();

    let metrics = body["aggregations"]
        .as_object()
        .map(|aggs| {
            aggs.iter()
                .filter_map(|(key, agg)| agg.get("value").map(|v| (key.clone(), v.clone())))
                .collect()
        })
        .unwrap_or_default();

    QueryResult {
        total,
        documents: Some(documents),
        metrics,
    }
}
