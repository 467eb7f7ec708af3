//! Partial update options.

use crate::document::Document;
use crate::error::{RepositoryError, Result};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Fields to change in a partial document update.
///
/// Field names may be dotted paths: `"a.b.c"` updates the nested field `c`
/// inside `a.b`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOption {
    fields: BTreeMap<String, Value>,
}

impl UpdateOption {
    /// Create empty update options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field. Blank names and null values are ignored.
    pub fn with_field(mut self, field: &str, value: impl Into<Value>) -> Self {
        let field = field.trim();
        let value = value.into();
        if !field.is_empty() && !value.is_null() {
            self.fields.insert(field.to_string(), value);
        }
        self
    }

    /// Set several fields at once.
    pub fn with_fields<I, K, V>(self, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        fields
            .into_iter()
            .fold(self, |options, (k, v)| options.with_field(k.as_ref(), v))
    }

    /// Fields recorded so far.
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Build the `{"doc": {...}}` update body for `doc`.
    ///
    /// Fails if the document has no ID, if no fields were set, or if a
    /// dotted path contains an empty segment.
    pub fn prepare_update(&self, doc: &Document) -> Result<Value> {
        if doc.id().trim().is_empty() {
            return Err(RepositoryError::Invalid(
                "document id is required for update".into(),
            ));
        }
        if self.fields.is_empty() {
            return Err(RepositoryError::Invalid(
                "at least one field is required for update".into(),
            ));
        }

        let mut merged = Map::new();
        for (path, value) in &self.fields {
            let expanded = expand(path, value.clone())?;
            merge(&mut merged, expanded);
        }

        Ok(json!({ "doc": merged }))
    }
}

impl fmt::Display for UpdateOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered =
            serde_json::to_string_pretty(&json!({ "fields": self.fields })).map_err(|_| fmt::Error)?;
        f.write_str(&rendered)
    }
}

/// Fold a dotted path into nested objects, innermost segment first.
fn expand(path: &str, value: Value) -> Result<Map<String, Value>> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(RepositoryError::Invalid(format!(
            "field path {:?} has an empty segment",
            path
        )));
    }

    let (first, rest) = segments
        .split_first()
        .ok_or_else(|| RepositoryError::Invalid("field name is required".into()))?;

    let inner = rest
        .iter()
        .rev()
        .fold(value, |acc, segment| json!({ *segment: acc }));

    let mut map = Map::new();
    map.insert(first.to_string(), inner);
    Ok(map)
}

/// Merge `source` into `target`, descending into objects present on both sides.
fn merge(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, value) in source {
        let value = match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge(existing, incoming);
                continue;
            }
            (_, value) => value,
        };
        target.insert(key, value);
    }
}
