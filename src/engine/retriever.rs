//! Context retriever
//!
//! Resolves the learner snapshot, then runs the similarity search and the
//! graph recommendation query concurrently. Each sub-result is cached on its
//! own; a failed sub-result degrades to an empty list and is not cached.

use crate::config::RetrievalConfig;
use crate::engine::types::{ContextItem, LearnerContext, SourceKind};
use crate::engine::{EngineCaches, RetrievalKey, SubResult, truncate_chars};
use crate::error::Result;
use crate::pool::ConnectionPool;
use crate::stores::{ContentMetadata, GraphQuery, Row, SearchParams, SimilarityStore};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Characters kept from each similarity hit.
pub const CONTENT_CHARS: usize = 500;

/// Material gathered for one question.
#[derive(Debug, Clone)]
pub struct Retrieval {
    pub learner: Arc<LearnerContext>,
    pub similarity: Vec<ContextItem>,
    pub graph: Vec<ContextItem>,
}

#[derive(Debug, Deserialize)]
struct PeerRow {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    peer_count: u32,
    #[serde(default)]
    module: Option<String>,
    #[serde(default)]
    concept: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PrerequisiteRow {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    module: Option<String>,
    #[serde(default)]
    concept: Option<String>,
}

pub struct ContextRetriever {
    similarity: Arc<dyn SimilarityStore>,
    pool: Arc<ConnectionPool>,
    caches: Arc<EngineCaches>,
    config: RetrievalConfig,
    key_chars: usize,
}

impl ContextRetriever {
    pub fn new(
        similarity: Arc<dyn SimilarityStore>,
        pool: Arc<ConnectionPool>,
        caches: Arc<EngineCaches>,
        config: RetrievalConfig,
        key_chars: usize,
    ) -> Self {
        Self {
            similarity,
            pool,
            caches,
            config,
            key_chars,
        }
    }

    pub async fn retrieve(&self, learner_id: &str, query: &str) -> Retrieval {
        let learner = self.learner_context(learner_id).await;
        let query_prefix = truncate_chars(query, self.key_chars);

        let (similarity, graph) = tokio::join!(
            self.similarity_items(&learner, query, query_prefix),
            self.graph_items(&learner, query_prefix),
        );

        Retrieval {
            learner,
            similarity,
            graph,
        }
    }

    /// Cached learner snapshot; a graph failure yields an empty, uncached snapshot.
    pub async fn learner_context(&self, learner_id: &str) -> Arc<LearnerContext> {
        match self.load_learner_context(learner_id).await {
            Ok(context) => context,
            Err(e) => {
                warn!(learner = %learner_id, error = %e, "Learner context unavailable, continuing without it");
                Arc::new(LearnerContext::empty(learner_id))
            }
        }
    }

    /// Like `learner_context`, but surfaces the graph error to the caller.
    pub async fn load_learner_context(&self, learner_id: &str) -> Result<Arc<LearnerContext>> {
        if let Some(cached) = self.caches.learner.get(&learner_id.to_string()) {
            debug!(learner = %learner_id, "Learner context cache hit");
            return Ok(cached);
        }

        let mut conn = self.pool.acquire().await?;
        let rows = conn
            .run_query(&GraphQuery::LearnerContext {
                learner_id: learner_id.to_string(),
            })
            .await?;
        conn.release();

        let context = match rows.into_iter().next() {
            Some(row) => LearnerContext::from_row(learner_id, row)?,
            None => LearnerContext::empty(learner_id),
        };
        debug!(
            learner = %learner_id,
            modules = context.module_progress().len(),
            struggles = context.struggled_concepts().len(),
            mastered = context.mastered_concepts().len(),
            quizzes = context.quiz_history().len(),
            "Learner context loaded"
        );
        let context = Arc::new(context);
        self.caches
            .learner
            .insert(learner_id.to_string(), Arc::clone(&context));
        Ok(context)
    }

    /// The raw query plus up to `enhance_terms` struggled concepts.
    pub fn enhanced_query(&self, query: &str, learner: &LearnerContext) -> String {
        let terms: Vec<&str> = learner
            .struggled_concepts()
            .iter()
            .take(self.config.enhance_terms)
            .map(String::as_str)
            .collect();

        if terms.is_empty() {
            query.to_string()
        } else {
            format!("{} {}", query, terms.join(" "))
        }
    }

    async fn similarity_items(
        &self,
        learner: &LearnerContext,
        query: &str,
        query_prefix: &str,
    ) -> Vec<ContextItem> {
        let key = RetrievalKey {
            source: SubResult::Similarity,
            learner_id: learner.learner_id().to_string(),
            query_prefix: query_prefix.to_string(),
        };
        if let Some(cached) = self.caches.retrieval.get(&key) {
            debug!(learner = %learner.learner_id(), "Similarity cache hit");
            return cached;
        }

        let params = SearchParams {
            result_count: self.config.result_count,
            module_filter: learner.current_module().map(str::to_string),
        };
        let search_text = self.enhanced_query(query, learner);

        match self.similarity.search(&search_text, &params).await {
            Ok(hits) => {
                let items: Vec<ContextItem> = hits
                    .into_iter()
                    .take(self.config.result_count)
                    .map(|hit| ContextItem {
                        content: truncate_chars(&hit.content, CONTENT_CHARS).to_string(),
                        source: SourceKind::Similarity,
                        raw_score: hit.similarity,
                        metadata: hit.metadata,
                    })
                    .collect();
                self.caches.retrieval.insert(key, items.clone());
                items
            }
            Err(e) => {
                warn!(learner = %learner.learner_id(), error = %e, "Similarity search failed, using no similarity context");
                Vec::new()
            }
        }
    }

    async fn graph_items(&self, learner: &LearnerContext, query_prefix: &str) -> Vec<ContextItem> {
        if learner.struggled_concepts().is_empty() {
            debug!(learner = %learner.learner_id(), "No struggled concepts, skipping graph recommendations");
            return Vec::new();
        }

        let key = RetrievalKey {
            source: SubResult::Graph,
            learner_id: learner.learner_id().to_string(),
            query_prefix: query_prefix.to_string(),
        };
        if let Some(cached) = self.caches.retrieval.get(&key) {
            debug!(learner = %learner.learner_id(), "Graph recommendation cache hit");
            return cached;
        }

        match self.fetch_recommendations(learner.learner_id()).await {
            Ok(items) => {
                self.caches.retrieval.insert(key, items.clone());
                items
            }
            Err(e) => {
                warn!(learner = %learner.learner_id(), error = %e, "Graph recommendations failed, using no graph context");
                Vec::new()
            }
        }
    }

    async fn fetch_recommendations(&self, learner_id: &str) -> Result<Vec<ContextItem>> {
        let mut conn = self.pool.acquire().await?;

        let peer_rows = conn
            .run_query(&GraphQuery::PeerRecommendations {
                learner_id: learner_id.to_string(),
                limit: self.config.peer_limit,
            })
            .await?;

        let prerequisite_rows = if self.config.include_prerequisites {
            conn.run_query(&GraphQuery::Prerequisites {
                learner_id: learner_id.to_string(),
                limit: self.config.prerequisite_limit,
            })
            .await?
        } else {
            Vec::new()
        };
        conn.release();

        let mut items = Vec::with_capacity(peer_rows.len() + prerequisite_rows.len());
        for row in peer_rows {
            if let Some(item) = peer_item(row)? {
                items.push(item);
            }
        }
        for row in prerequisite_rows {
            if let Some(item) = prerequisite_item(row)? {
                items.push(item);
            }
        }
        Ok(items)
    }
}

fn peer_item(row: Row) -> Result<Option<ContextItem>> {
    let row: PeerRow = serde_json::from_value(row)?;
    let Some(title) = row.title else {
        return Ok(None);
    };

    Ok(Some(ContextItem {
        content: format!("Peer recommendation: {}", title),
        source: SourceKind::GraphPeer,
        raw_score: f64::from(row.peer_count),
        metadata: ContentMetadata {
            module: row.module,
            title: Some(title),
            concepts: row.concept.into_iter().collect(),
        },
    }))
}

fn prerequisite_item(row: Row) -> Result<Option<ContextItem>> {
    let row: PrerequisiteRow = serde_json::from_value(row)?;
    let Some(title) = row.title else {
        return Ok(None);
    };

    let content = match &row.module {
        Some(module) => format!("Prerequisite: {} for {}", title, module),
        None => format!("Prerequisite: {}", title),
    };

    Ok(Some(ContextItem {
        content,
        source: SourceKind::GraphPrerequisite,
        raw_score: 0.0,
        metadata: ContentMetadata {
            module: row.module,
            title: Some(title),
            concepts: row.concept.into_iter().collect(),
        },
    }))
}
