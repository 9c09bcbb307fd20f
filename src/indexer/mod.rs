//! Issue search indexing fed through a queue.
//!
//! The queue engine only needs a sink for batches of [`IndexerData`];
//! [`indexer_handler`] adapts any [`Indexer`] into one.

mod memory;

pub use memory::MemoryIndexer;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::queue::{handler, HandlerFn};

/// One change to the issue index.
///
/// A non-zero `comment_id` addresses a comment of issue `id`. With
/// `is_delete`, the addressed document is removed; a delete with `id == 0`
/// removes every document of `repo_id`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexerData {
    pub id: i64,
    pub repo_id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub comment_id: i64,
    #[serde(default)]
    pub is_delete: bool,
}

impl IndexerData {
    pub fn issue(id: i64, repo_id: i64, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id,
            repo_id,
            title: title.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn comment(issue_id: i64, repo_id: i64, comment_id: i64, content: impl Into<String>) -> Self {
        Self {
            id: issue_id,
            repo_id,
            content: content.into(),
            comment_id,
            ..Default::default()
        }
    }

    pub fn delete_repo(repo_id: i64) -> Self {
        Self {
            repo_id,
            is_delete: true,
            ..Default::default()
        }
    }
}

/// A search hit.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Match {
    pub id: i64,
    pub repo_id: i64,
    pub score: f64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SearchResult {
    /// Matching issues before `limit`/`start` were applied.
    pub total: usize,
    pub hits: Vec<Match>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexerError {
    /// The indexer was closed.
    Closed,
    /// The backing store failed.
    Backend(String),
}

impl fmt::Display for IndexerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexerError::Closed => write!(f, "indexer is closed"),
            IndexerError::Backend(msg) => write!(f, "indexer backend error: {}", msg),
        }
    }
}

impl std::error::Error for IndexerError {}

pub type IndexerResult<T> = Result<T, IndexerError>;

/// A search index over issues and their comments.
pub trait Indexer: Send + Sync {
    /// Prepare the index. Returns whether it already held data.
    fn init(&self) -> IndexerResult<bool>;

    /// Whether the backend is reachable.
    fn ping(&self) -> bool {
        true
    }

    /// Apply a batch of changes, deletes included.
    fn index(&self, batch: &[IndexerData]) -> IndexerResult<()>;

    /// Remove issues and their comments.
    fn delete(&self, ids: &[i64]) -> IndexerResult<()>;

    /// Issues matching `keyword`; `repo_id == 0` searches every repository.
    fn search(&self, keyword: &str, repo_id: i64, limit: usize, start: usize) -> IndexerResult<SearchResult>;

    fn close(&self);
}

/// Queue handler that feeds batches into `indexer`.
///
/// Batches are returned unhandled while the indexer is unreachable or
/// failing, so the queue retries them.
pub fn indexer_handler(indexer: Arc<dyn Indexer>) -> HandlerFn<IndexerData> {
    handler(move |batch: Vec<IndexerData>| {
        if !indexer.ping() {
            warn!(count = batch.len(), "indexer unavailable, returning batch");
            return batch;
        }
        match indexer.index(&batch) {
            Ok(()) => {
                debug!(count = batch.len(), "indexed batch");
                Vec::new()
            }
            Err(e) => {
                warn!(count = batch.len(), error = %e, "unable to index batch");
                batch
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Flaky {
        inner: MemoryIndexer,
        up: AtomicBool,
    }

    impl Indexer for Flaky {
        fn init(&self) -> IndexerResult<bool> {
            self.inner.init()
        }
        fn ping(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }
        fn index(&self, batch: &[IndexerData]) -> IndexerResult<()> {
            self.inner.index(batch)
        }
        fn delete(&self, ids: &[i64]) -> IndexerResult<()> {
            self.inner.delete(ids)
        }
        fn search(&self, keyword: &str, repo_id: i64, limit: usize, start: usize) -> IndexerResult<SearchResult> {
            self.inner.search(keyword, repo_id, limit, start)
        }
        fn close(&self) {
            self.inner.close()
        }
    }

    #[test]
    fn test_handler_returns_batch_while_down() {
        let flaky = Arc::new(Flaky {
            inner: MemoryIndexer::new(),
            up: AtomicBool::new(false),
        });
        let handle = indexer_handler(flaky.clone());
        let batch = vec![IndexerData::issue(1, 1, "crash", "on start")];

        assert_eq!(handle(batch.clone()), batch);
        flaky.up.store(true, Ordering::SeqCst);
        assert!(handle(batch).is_empty());
        assert_eq!(flaky.search("crash", 1, 10, 0).unwrap().total, 1);
    }

    #[test]
    fn test_handler_returns_batch_when_closed() {
        let indexer = Arc::new(MemoryIndexer::new());
        indexer.close();
        let handle = indexer_handler(indexer);
        let batch = vec![IndexerData::issue(1, 1, "t", "c")];
        assert_eq!(handle(batch.clone()), batch);
    }

    #[test]
    fn test_indexer_data_json_defaults() {
        let data: IndexerData = serde_json::from_str(r#"{"id":3,"repo_id":2}"#).unwrap();
        assert_eq!(data.id, 3);
        assert!(data.title.is_empty());
        assert!(!data.is_delete);
    }
}
