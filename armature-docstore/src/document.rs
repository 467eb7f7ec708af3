//! Document value object and typed entity helpers.

use crate::error::{RepositoryError, Result};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Trait for typed entities that can be written through the repository.
///
/// # Example
///
/// ```rust
/// use armature_docstore::{Document, Indexable};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct Order {
///     total: u64,
/// }
///
/// impl Indexable for Order {
///     fn index_name() -> &'static str {
///         "orders"
///     }
/// }
///
/// let doc = Document::from_entity(&Order { total: 42 }).unwrap();
/// assert_eq!(doc.index(), "orders");
/// ```
pub trait Indexable: Serialize + DeserializeOwned + Send + Sync {
    /// Returns the index this entity type is written to.
    fn index_name() -> &'static str;

    /// Returns the document ID, or `None` to let the backend assign one.
    fn document_id(&self) -> Option<String> {
        None
    }
}

/// A document stored in, or returned from, an index.
///
/// Documents are immutable once built. Content is raw JSON; `sort` is only
/// populated on documents returned from a sorted search and acts as the
/// pagination cursor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    id: String,
    index: String,
    content: Bytes,
    sort: Vec<Value>,
}

impl Document {
    /// Start building a document.
    pub fn builder() -> DocumentBuilder {
        DocumentBuilder::default()
    }

    /// Build a write document from a typed entity.
    pub fn from_entity<T: Indexable>(entity: &T) -> Result<Self> {
        let content = serde_json::to_vec(entity)?;
        Ok(Self::builder()
            .index(T::index_name())
            .id(entity.document_id().unwrap_or_default())
            .content(content)
            .build())
    }

    /// Document ID; empty when the backend should assign one.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Index the document is written to or was read from.
    pub fn index(&self) -> &str {
        &self.index
    }

    /// Raw JSON content.
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// Sort values carried by a search hit.
    pub fn sort(&self) -> &[Value] {
        &self.sort
    }

    /// Whether the document has any content.
    pub fn has_content(&self) -> bool {
        !self.content.is_empty()
    }

    /// Parse the content as a JSON value.
    pub fn content_json(&self) -> Result<Value> {
        if self.content.is_empty() {
            return Err(RepositoryError::MalformedDocumentContent);
        }
        serde_json::from_slice(&self.content).map_err(|_| RepositoryError::MalformedDocumentContent)
    }

    /// Deserialize the content into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.content).map_err(|e| RepositoryError::decode("document content", e))
    }

    /// The trimmed index name, or `MalformedIndex` if it is empty.
    pub(crate) fn require_index(&self) -> Result<&str> {
        let index = self.index.trim();
        if index.is_empty() {
            return Err(RepositoryError::MalformedIndex);
        }
        Ok(index)
    }
}

impl Document {
    /// JSON rendering used by `Display`.
    pub(crate) fn to_json(&self) -> Value {
        let content = if self.content.is_empty() {
            json!({})
        } else {
            serde_json::from_slice::<Value>(&self.content)
                .unwrap_or_else(|_| json!({ "error": "could not decode content" }))
        };

        let mut doc = json!({
            "id": self.id,
            "index": self.index,
            "content": content,
        });
        if !self.sort.is_empty() {
            doc["sort"] = Value::Array(self.sort.clone());
        }
        doc
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = serde_json::to_string_pretty(&self.to_json()).map_err(|_| fmt::Error)?;
        f.write_str(&rendered)
    }
}

/// Builder for [`Document`].
#[derive(Debug, Clone, Default)]
pub struct DocumentBuilder {
    doc: Document,
}

impl DocumentBuilder {
    /// Set the document ID.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.doc.id = id.into();
        self
    }

    /// Set the index name.
    pub fn index(mut self, index: impl Into<String>) -> Self {
        self.doc.index = index.into();
        self
    }

    /// Set raw JSON content.
    pub fn content(mut self, content: impl Into<Bytes>) -> Self {
        self.doc.content = content.into();
        self
    }

    /// Set content from a JSON value.
    pub fn json(mut self, value: &Value) -> Self {
        self.doc.content = Bytes::from(value.to_string());
        self
    }

    /// Append sort values.
    pub fn sort(mut self, sort: impl IntoIterator<Item = Value>) -> Self {
        self.doc.sort.extend(sort);
        self
    }

    /// Finish the document.
    pub fn build(self) -> Document {
        self.doc
    }
}
