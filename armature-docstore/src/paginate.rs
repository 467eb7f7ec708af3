//! Cursor-based deep pagination.
//!
//! A [`Paginator`] walks every document matching a search by sorting on a
//! unique tie-break (`_id`, then `@timestamp`) and feeding the sort values of
//! the last hit back as `search_after`. Pages are produced by a background
//! task and handed over through a channel with room for a single page, so a
//! consumer that stops reading also stops fetching.

use crate::error::Result;
use crate::executor::{BackendRequest, Executor};
use crate::option::SearchOption;
use crate::query::{SortField, SortOrder};
use crate::repository::execute;
use crate::result::QueryResult;
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Cursor timestamp used for the first page.
pub const SEARCH_AFTER_TIMESTAMP: &str = "1970-01-01T00:00:00Z";

/// Drives repeated bounded searches over one index.
pub struct Paginator {
    executor: Arc<dyn Executor>,
    index: String,
    options: SearchOption,
}

impl Paginator {
    /// Create a paginator. Term filters and other constraints in `options`
    /// apply to every page; its sort and cursor are replaced.
    pub fn new(executor: Arc<dyn Executor>, index: impl Into<String>, options: SearchOption) -> Self {
        Self {
            executor,
            index: index.into(),
            options,
        }
    }

    /// Sort applied to every page.
    pub fn tie_break_sort() -> Vec<SortField> {
        vec![
            SortField::new("_id", SortOrder::Asc),
            SortField::new("@timestamp", SortOrder::Asc),
        ]
    }

    /// Cursor for the first page.
    pub fn initial_cursor() -> Vec<Value> {
        vec![json!(""), json!(SEARCH_AFTER_TIMESTAMP)]
    }

    /// Start fetching on a background task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn stream(self, cancel: CancellationToken) -> PageStream {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(self.run(tx, cancel));
        PageStream { rx }
    }

    async fn run(self, tx: mpsc::Sender<Result<QueryResult>>, cancel: CancellationToken) {
        let sort = Self::tie_break_sort();
        let mut cursor = Self::initial_cursor();
        let mut page_index = 1usize;

        loop {
            let mut options = self.options.clone();
            options.set_cursor(sort.clone(), cursor);

            let query = options.prepare_search();
            if !query.has_query() {
                return;
            }

            trace!(page_index, search_after = ?options.search_after(), "Preparing page");

            let request = BackendRequest::Search {
                index: self.index.clone(),
                body: query.to_json(),
            };

            let page = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(page_index, "Pagination cancelled");
                    return;
                }
                page = execute(self.executor.as_ref(), request) => page,
            };

            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    error!(error = %e, page_index, "Could not retrieve page");
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            let documents = page.documents();
            if documents.is_empty() {
                debug!(pages = page_index - 1, "Pagination complete");
                return;
            }

            trace!(documents = documents.len(), page_index, "Retrieved results for page");

            let next = documents
                .last()
                .map(|doc| doc.sort().to_vec())
                .unwrap_or_default();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(page_index, "Pagination cancelled");
                    return;
                }
                sent = tx.send(Ok(page)) => {
                    if sent.is_err() {
                        debug!(page_index, "Page consumer dropped");
                        return;
                    }
                }
            }

            if next.is_empty() {
                warn!(page_index, index = %self.index, "Last document has no sort values, pagination truncated");
                return;
            }

            cursor = next;
            page_index += 1;
        }
    }
}

/// Pages produced by a [`Paginator`].
///
/// A backend failure is delivered as the final item. Dropping the stream
/// stops the background task.
#[derive(Debug)]
pub struct PageStream {
    rx: mpsc::Receiver<Result<QueryResult>>,
}

impl PageStream {
    /// Wait for the next page.
    pub async fn next_page(&mut self) -> Option<Result<QueryResult>> {
        self.rx.recv().await
    }
}

impl Stream for PageStream {
    type Item = Result<QueryResult>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
