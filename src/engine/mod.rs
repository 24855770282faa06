//! Context-fusion engine
//!
//! `retriever` gathers similarity and graph material for a learner, `rank`
//! fuses it into one ordered list, `prompt` turns that into model messages and
//! `orchestrator` runs the whole answer pipeline with caching and deferred
//! write-back.

pub mod orchestrator;
pub mod prompt;
pub mod rank;
pub mod retriever;
pub mod types;

pub use orchestrator::{Answer, AnswerOptions, EngineDeps, ResponseOrchestrator};
pub use types::{ContextItem, LearnerContext};

use crate::cache::{CacheStats, TtlCache};
use crate::config::CacheConfig;
use std::sync::Arc;

/// Which retrieval sub-result a cached item list belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubResult {
    Similarity,
    Graph,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RetrievalKey {
    pub source: SubResult,
    pub learner_id: String,
    pub query_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResponseKey {
    pub learner_id: String,
    pub query_prefix: String,
}

/// The three engine caches, each with its own TTL.
pub struct EngineCaches {
    pub learner: TtlCache<String, Arc<LearnerContext>>,
    pub retrieval: TtlCache<RetrievalKey, Vec<ContextItem>>,
    pub response: TtlCache<ResponseKey, Answer>,
}

impl EngineCaches {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            learner: TtlCache::new(
                "learner_context",
                config.learner_context_ttl(),
                config.max_entries,
            ),
            retrieval: TtlCache::new("similarity", config.similarity_ttl(), config.max_entries),
            response: TtlCache::new("response", config.response_ttl(), config.max_entries),
        }
    }

    pub fn clear(&self) {
        self.learner.invalidate_all();
        self.retrieval.invalidate_all();
        self.response.invalidate_all();
    }

    pub fn purge_expired(&self) -> usize {
        self.learner.purge_expired() + self.retrieval.purge_expired() + self.response.purge_expired()
    }

    pub fn stats(&self) -> Vec<CacheStats> {
        vec![
            self.learner.stats(),
            self.retrieval.stats(),
            self.response.stats(),
        ]
    }
}

/// First `max_chars` characters of `text`, never splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");
        assert_eq!(truncate_chars("évaluation", 2), "év");
        assert_eq!(truncate_chars("", 5), "");
    }

    #[tokio::test]
    async fn test_clear_empties_every_cache() {
        let caches = EngineCaches::new(&CacheConfig::default());
        caches
            .learner
            .insert("l1".to_string(), Arc::new(LearnerContext::empty("l1")));
        caches.retrieval.insert(
            RetrievalKey {
                source: SubResult::Similarity,
                learner_id: "l1".to_string(),
                query_prefix: "q".to_string(),
            },
            Vec::new(),
        );

        caches.clear();
        assert!(caches.stats().iter().all(|s| s.entries == 0));
    }
}
