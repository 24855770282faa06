//! Collaborator stores consumed by the engine
//!
//! The engine only sees these traits. `graph`, `semantic` and `session` hold
//! local file-backed implementations used by the CLI; `seed` bulk-loads them.

pub mod graph;
pub mod seed;
pub mod semantic;
pub mod session;

use crate::batch::BatchItem;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metadata attached to a piece of course content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentMetadata {
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub concepts: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchParams {
    pub result_count: usize,
    /// Restrict hits to this module when set.
    pub module_filter: Option<String>,
}

/// One hit from the similarity store. `similarity` is normalized to [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityHit {
    pub content: String,
    pub metadata: ContentMetadata,
    pub similarity: f64,
}

#[async_trait]
pub trait SimilarityStore: Send + Sync {
    async fn search(&self, text: &str, params: &SearchParams) -> Result<Vec<SimilarityHit>>;
}

/// The typed query vocabulary the engine issues against the graph store.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphQuery {
    /// One row aggregating a learner's progress, struggles and mastery.
    LearnerContext { learner_id: String },
    /// Content viewed by peers who struggled with the same concepts.
    PeerRecommendations { learner_id: String, limit: usize },
    /// Content teaching concepts of modules that follow the learner's current one.
    Prerequisites { learner_id: String, limit: usize },
    /// Bulk write of logged interactions.
    RecordInteractions { batch: Vec<BatchItem> },
}

impl GraphQuery {
    pub fn kind(&self) -> &'static str {
        match self {
            GraphQuery::LearnerContext { .. } => "learner_context",
            GraphQuery::PeerRecommendations { .. } => "peer_recommendations",
            GraphQuery::Prerequisites { .. } => "prerequisites",
            GraphQuery::RecordInteractions { .. } => "record_interactions",
        }
    }
}

pub type Row = serde_json::Value;

/// An open session against the graph store.
#[async_trait]
pub trait GraphConnection: Send {
    async fn run_query(&mut self, query: &GraphQuery) -> Result<Vec<Row>>;

    async fn close(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn GraphConnection>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub query: String,
    pub response: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    #[serde(default)]
    pub learner_id: Option<String>,
    #[serde(default)]
    pub context: HashMap<String, String>,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionContext>>;

    async fn append_conversation(&self, session_id: &str, query: &str, response: &str)
        -> Result<()>;
}
