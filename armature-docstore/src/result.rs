//! Query result value object.

use crate::document::Document;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

/// The outcome of one repository operation.
///
/// `documents` is `None` when no request was issued (an empty composed
/// query) and `Some` (possibly empty) once a request ran.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Best-effort match count; `0` when unknown.
    pub total: u64,
    /// Returned documents.
    pub documents: Option<Vec<Document>>,
    /// Named scalar aggregation outputs.
    pub metrics: Map<String, Value>,
}

impl QueryResult {
    /// A result for an operation that issued no request.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether no request was issued.
    pub fn is_noop(&self) -> bool {
        self.documents.is_none()
    }

    /// Returned documents, empty when none.
    pub fn documents(&self) -> &[Document] {
        self.documents.as_deref().unwrap_or(&[])
    }

    /// Metric value as a float.
    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).and_then(Value::as_f64)
    }
}

#[derive(Serialize)]
struct Rendered<'a> {
    total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    documents: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    metrics: &'a Map<String, Value>,
}

impl fmt::Display for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let documents = self
            .documents
            .as_ref()
            .map(|docs| docs.iter().map(Document::to_json).collect());
        let rendered = Rendered {
            total: self.total,
            documents,
            metrics: &self.metrics,
        };
        let out = serde_json::to_string_pretty(&rendered).map_err(|_| fmt::Error)?;
        f.write_str(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_is_noop() {
        let result = QueryResult::empty();
        assert!(result.is_noop());
        assert!(result.documents().is_empty());
        assert_eq!(result.to_string(), "{\n  \"total\": 0\n}");
    }

    #[test]
    fn test_zero_hits_is_not_noop() {
        let result = QueryResult {
            documents: Some(Vec::new()),
            ..Default::default()
        };
        assert!(!result.is_noop());
    }

    #[test]
    fn test_metric_lookup() {
        let mut result = QueryResult::empty();
        result.metrics.insert("total_bytes".into(), json!(1024));
        assert_eq!(result.metric("total_bytes"), Some(1024.0));
        assert_eq!(result.metric("missing"), None);
    }
}
