//! Document repository over OpenSearch for the Armature framework.
//!
//! This crate provides a repository layer with support for:
//! - Create, update, delete-by-query, count and search operations
//! - A boolean query DSL built from declarative search options
//! - Deep pagination past the backend's result window with `search_after`
//! - Batched asynchronous bulk indexing with per-document outcomes
//! - Idempotent template, data stream and index bootstrap
//!
//! Requests go through the [`Executor`] trait. [`OpenSearchClient`] is the
//! production implementation; tests can supply their own.
//!
//! # Example
//!
//! ```rust,no_run
//! use armature_docstore::{Document, OpenSearchClient, Repository, RepositoryConfig, SearchOption};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Connect once and share the client
//!     let client = OpenSearchClient::connect(RepositoryConfig::from_env()?).await?;
//!     let repository = Repository::new(Arc::new(client));
//!
//!     // Write a document
//!     let order = Document::builder()
//!         .index("orders")
//!         .content(r#"{"status":"open","total":42}"#)
//!         .build();
//!     let created = repository.create(&[order]).await?;
//!     println!("created {}", created.documents()[0].id());
//!
//!     // Page through every open order
//!     let open = repository
//!         .search("orders", &SearchOption::new().with_term("status", "open", "filter"))
//!         .await?;
//!     println!("{} open orders", open.total);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod bulk;
mod client;
mod config;
mod document;
mod error;
mod executor;
mod option;
mod paginate;
mod query;
mod repository;
mod result;
mod template;
mod update;

pub use bulk::{
    BulkAction, BulkIndexer, BulkIndexerResult, BulkIndexerStats, BulkItem, BulkItemError,
    BulkItemResult, BulkItemStatus, BulkResponse,
};
pub use client::OpenSearchClient;
pub use config::{
    BulkConfig, MappingConfig, RepositoryConfig, RetryConfig, DEFAULT_FLUSH_BYTES,
    DEFAULT_FLUSH_INTERVAL, DEFAULT_STATS_INTERVAL,
};
pub use document::{Document, DocumentBuilder, Indexable};
pub use error::{RepositoryError, Result};
pub use executor::{BackendRequest, BackendResponse, Executor, RequestKind};
pub use option::SearchOption;
pub use paginate::{PageStream, Paginator, SEARCH_AFTER_TIMESTAMP};
pub use query::{
    BoolPredicate, BoolQuery, Query, RangeQuery, ScriptedSum, SortField, SortOrder, Source,
    MAX_RESULT_SIZE,
};
pub use repository::Repository;
pub use result::QueryResult;
pub use template::{read_templates, Bootstrap, IndicesManifest, Template, TEMPLATE_DIR_ECS, TEMPLATE_DIR_INDEX};
pub use update::UpdateOption;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::{
        BulkAction, BulkIndexer, BulkIndexerResult, Document, Executor, Indexable, OpenSearchClient,
        QueryResult, Repository, RepositoryConfig, RepositoryError, Result, SearchOption,
        UpdateOption,
    };
}
