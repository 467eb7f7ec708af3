//! Backend executor seam.
//!
//! The repository never builds HTTP requests itself. It hands a fully formed
//! [`BackendRequest`] to an [`Executor`] and decodes the returned body based
//! on the request's [`RequestKind`].

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// A typed request for the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendRequest {
    /// Cluster info (`GET /`).
    Info,
    /// Search an index.
    Search {
        /// Target index.
        index: String,
        /// Query document.
        body: Value,
    },
    /// Count matching documents.
    Count {
        /// Target index.
        index: String,
        /// `{"query": ...}` body.
        body: Value,
    },
    /// Write a single document.
    Index {
        /// Target index.
        index: String,
        /// Document ID, or `None` for a backend-assigned one.
        id: Option<String>,
        /// Document content.
        body: Value,
        /// Refresh after the write.
        refresh: bool,
    },
    /// Partially update a document.
    Update {
        /// Target index.
        index: String,
        /// Document ID.
        id: String,
        /// `{"doc": ...}` body.
        body: Value,
        /// Refresh after the write.
        refresh: bool,
    },
    /// Delete every document matching a query.
    DeleteByQuery {
        /// Target index.
        index: String,
        /// `{"query": ...}` body.
        body: Value,
        /// Refresh after the delete.
        refresh: bool,
    },
    /// Bulk write, one JSON value per NDJSON line.
    Bulk {
        /// Action and body lines.
        lines: Vec<Value>,
        /// Refresh after the write.
        refresh: bool,
    },
    /// Check whether a component template exists.
    ComponentTemplateExists {
        /// Template name.
        name: String,
    },
    /// Create or replace a component template.
    PutComponentTemplate {
        /// Template name.
        name: String,
        /// Template body.
        body: Value,
    },
    /// Check whether an index template exists.
    IndexTemplateExists {
        /// Template name.
        name: String,
    },
    /// Create or replace an index template.
    PutIndexTemplate {
        /// Template name.
        name: String,
        /// Template body.
        body: Value,
    },
    /// Check whether a data stream exists.
    DataStreamExists {
        /// Data stream name.
        name: String,
    },
    /// Create a data stream.
    CreateDataStream {
        /// Data stream name.
        name: String,
    },
    /// Check whether an index exists.
    IndexExists {
        /// Index name.
        name: String,
    },
    /// Create an index.
    CreateIndex {
        /// Index name.
        name: String,
    },
}

impl BackendRequest {
    /// The decoder family this request belongs to.
    pub fn kind(&self) -> RequestKind {
        match self {
            BackendRequest::Info => RequestKind::Info,
            BackendRequest::Search { .. } => RequestKind::Search,
            BackendRequest::Count { .. } => RequestKind::Count,
            BackendRequest::Index { .. } => RequestKind::Index,
            BackendRequest::Update { .. } => RequestKind::Update,
            BackendRequest::DeleteByQuery { .. } => RequestKind::DeleteByQuery,
            BackendRequest::Bulk { .. } => RequestKind::Bulk,
            BackendRequest::ComponentTemplateExists { .. }
            | BackendRequest::IndexTemplateExists { .. }
            | BackendRequest::DataStreamExists { .. }
            | BackendRequest::IndexExists { .. } => RequestKind::Exists,
            BackendRequest::PutComponentTemplate { .. }
            | BackendRequest::PutIndexTemplate { .. }
            | BackendRequest::CreateDataStream { .. }
            | BackendRequest::CreateIndex { .. } => RequestKind::Provision,
        }
    }

    /// Index targeted by a data request, if any.
    pub fn index(&self) -> Option<&str> {
        match self {
            BackendRequest::Search { index, .. }
            | BackendRequest::Count { index, .. }
            | BackendRequest::Index { index, .. }
            | BackendRequest::Update { index, .. }
            | BackendRequest::DeleteByQuery { index, .. } => Some(index),
            _ => None,
        }
    }
}

/// Request families, each mapped to one response decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Cluster info.
    Info,
    /// Search; decoded from `hits` and `aggregations`.
    Search,
    /// Count; decoded from `count`.
    Count,
    /// Single document write; decoded from `_id` and `result`.
    Index,
    /// Partial update; decoded from `_id` and `result`.
    Update,
    /// Delete by query; decoded from `deleted`.
    DeleteByQuery,
    /// Bulk write; decoded item by item.
    Bulk,
    /// Existence probe; only the status matters.
    Exists,
    /// Template, data stream or index creation.
    Provision,
}

impl RequestKind {
    /// Operation name used in error messages and logs.
    pub fn operation(self) -> &'static str {
        match self {
            RequestKind::Info => "info",
            RequestKind::Search => "search",
            RequestKind::Count => "count",
            RequestKind::Index => "index",
            RequestKind::Update => "update",
            RequestKind::DeleteByQuery => "delete_by_query",
            RequestKind::Bulk => "bulk",
            RequestKind::Exists => "exists",
            RequestKind::Provision => "provision",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.operation())
    }
}

/// Raw backend response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, lower-cased names.
    pub headers: BTreeMap<String, String>,
    /// Response body.
    pub body: Bytes,
}

impl BackendResponse {
    /// Create a response with a JSON body.
    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            headers: BTreeMap::from([("content-type".to_string(), "application/json".to_string())]),
            body: Bytes::from(body.to_string()),
        }
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `[status] type: reason` built from the backend error object.
    pub fn error_message(&self) -> String {
        let parsed: Option<Value> = serde_json::from_slice(&self.body).ok();
        let error = parsed.as_ref().and_then(|v| v.get("error"));

        match error {
            Some(Value::Object(e)) => format!(
                "[{}] {}: {}",
                self.status,
                e.get("type").and_then(Value::as_str).unwrap_or("unknown"),
                e.get("reason").and_then(Value::as_str).unwrap_or("unknown"),
            ),
            Some(Value::String(reason)) => format!("[{}] {}", self.status, reason),
            _ => format!("[{}] {}", self.status, String::from_utf8_lossy(&self.body).trim()),
        }
    }
}

/// Sends typed requests to the backend.
///
/// Implementations must be safe for concurrent use; one executor is shared
/// by the repository, its paginators and its bulk indexers.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute a request and return the raw response.
    ///
    /// Non-2xx statuses are returned as responses, not errors. Errors are
    /// reserved for transport failures.
    async fn execute(&self, request: BackendRequest) -> Result<BackendResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_mapping() {
        let search = BackendRequest::Search {
            index: "orders".into(),
            body: json!({}),
        };
        assert_eq!(search.kind(), RequestKind::Search);
        assert_eq!(search.index(), Some("orders"));

        let exists = BackendRequest::IndexExists { name: "orders".into() };
        assert_eq!(exists.kind(), RequestKind::Exists);
        assert_eq!(exists.index(), None);

        assert_eq!(RequestKind::DeleteByQuery.to_string(), "delete_by_query");
    }

    #[test]
    fn test_error_message_from_error_object() {
        let response = BackendResponse::json(
            400,
            &json!({ "error": { "type": "parsing_exception", "reason": "unknown query [nope]" } }),
        );
        assert!(!response.is_success());
        assert_eq!(
            response.error_message(),
            "[400] parsing_exception: unknown query [nope]"
        );
    }

    #[test]
    fn test_error_message_from_plain_body() {
        let response = BackendResponse {
            status: 503,
            body: Bytes::from_static(b"unavailable\n"),
            ..Default::default()
        };
        assert_eq!(response.error_message(), "[503] unavailable");
    }
}
