//! In-memory issue index.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use super::{Indexer, IndexerData, IndexerError, IndexerResult, Match, SearchResult};

/// Documents keyed by `(issue id, comment id)`; comment id 0 is the issue itself.
#[derive(Default)]
pub struct MemoryIndexer {
    docs: RwLock<BTreeMap<(i64, i64), Document>>,
    closed: AtomicBool,
}

struct Document {
    repo_id: i64,
    /// Lower-cased title and content.
    text: String,
}

impl MemoryIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed documents.
    pub fn len(&self) -> usize {
        self.docs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_open(&self) -> IndexerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(IndexerError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Indexer for MemoryIndexer {
    fn init(&self) -> IndexerResult<bool> {
        self.check_open()?;
        Ok(!self.is_empty())
    }

    fn ping(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn index(&self, batch: &[IndexerData]) -> IndexerResult<()> {
        self.check_open()?;
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        for data in batch {
            if !data.is_delete {
                let text = format!("{}\n{}", data.title, data.content).to_lowercase();
                docs.insert(
                    (data.id, data.comment_id),
                    Document {
                        repo_id: data.repo_id,
                        text,
                    },
                );
            } else if data.comment_id != 0 {
                docs.remove(&(data.id, data.comment_id));
            } else if data.id != 0 {
                docs.retain(|(id, _), _| *id != data.id);
            } else {
                docs.retain(|_, doc| doc.repo_id != data.repo_id);
            }
        }
        Ok(())
    }

    fn delete(&self, ids: &[i64]) -> IndexerResult<()> {
        self.check_open()?;
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        docs.retain(|(id, _), _| !ids.contains(id));
        Ok(())
    }

    fn search(&self, keyword: &str, repo_id: i64, limit: usize, start: usize) -> IndexerResult<SearchResult> {
        self.check_open()?;
        let keyword = keyword.trim().to_lowercase();
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);

        // Issue id -> (repo id, matching documents)
        let mut scores: HashMap<i64, (i64, usize)> = HashMap::new();
        for ((id, _), doc) in docs.iter() {
            if repo_id != 0 && doc.repo_id != repo_id {
                continue;
            }
            let found = doc.text.matches(keyword.as_str()).count();
            if keyword.is_empty() || found > 0 {
                let entry = scores.entry(*id).or_insert((doc.repo_id, 0));
                entry.1 += found.max(1);
            }
        }

        let mut hits: Vec<Match> = scores
            .into_iter()
            .map(|(id, (repo_id, score))| Match {
                id,
                repo_id,
                score: score as f64,
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(b.id.cmp(&a.id)));

        let total = hits.len();
        let hits = hits.into_iter().skip(start).take(limit).collect();
        Ok(SearchResult { total, hits })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> MemoryIndexer {
        let indexer = MemoryIndexer::new();
        indexer
            .index(&[
                IndexerData::issue(1, 10, "Panic on startup", "the server panics"),
                IndexerData::issue(2, 10, "Slow search", "search takes seconds"),
                IndexerData::comment(2, 10, 100, "still slow, maybe a panic too"),
                IndexerData::issue(3, 20, "Docs", "PANIC section missing"),
            ])
            .unwrap();
        indexer
    }

    #[test]
    fn test_search_scopes_and_orders() {
        let indexer = seeded();
        let all = indexer.search("panic", 0, 10, 0).unwrap();
        assert_eq!(all.total, 3);
        // Issue 1 matches twice, the rest once and are ordered by id desc
        let ids: Vec<_> = all.hits.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![1, 3, 2]);

        let repo = indexer.search("panic", 10, 10, 0).unwrap();
        assert_eq!(repo.total, 2);

        let page = indexer.search("panic", 0, 1, 1).unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.hits.len(), 1);
        assert_eq!(page.hits[0].id, 3);
    }

    #[test]
    fn test_deletes() {
        let indexer = seeded();
        indexer
            .index(&[IndexerData {
                id: 2,
                comment_id: 100,
                is_delete: true,
                ..Default::default()
            }])
            .unwrap();
        assert_eq!(indexer.search("panic", 10, 10, 0).unwrap().total, 1);

        indexer.index(&[IndexerData::delete_repo(10)]).unwrap();
        assert_eq!(indexer.len(), 1);

        indexer.delete(&[3]).unwrap();
        assert!(indexer.is_empty());
        assert!(!indexer.init().unwrap());
    }

    #[test]
    fn test_closed_rejects() {
        let indexer = seeded();
        assert!(indexer.init().unwrap());
        indexer.close();
        assert!(!indexer.ping());
        assert_eq!(indexer.index(&[]).unwrap_err(), IndexerError::Closed);
    }
}
