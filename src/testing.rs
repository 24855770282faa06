//! In-memory collaborators for unit tests.

use crate::batch::{BatchItem, BatchSink};
use crate::error::{MentorError, Result};
use crate::providers::{CompletionRequest, CompletionResponse, Provider, ProviderInfo};
use crate::stores::{
    ConversationTurn, GraphConnection, GraphQuery, GraphStore, Row, SearchParams, SessionContext,
    SessionStore, SimilarityHit, SimilarityStore,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct GraphState {
    learners: HashMap<String, Row>,
    peers: Vec<Row>,
    prerequisites: Vec<Row>,
    query_counts: HashMap<&'static str, u64>,
    interactions: Vec<BatchItem>,
}

#[derive(Default)]
struct GraphShared {
    state: Mutex<GraphState>,
    connects: AtomicU64,
    closes: AtomicU64,
    failing: AtomicBool,
}

/// Graph store answering from scripted rows and recording every query.
#[derive(Default)]
pub struct RecordingGraph {
    shared: Arc<GraphShared>,
}

impl RecordingGraph {
    pub fn set_learner(&self, learner_id: &str, row: Row) {
        self.state().learners.insert(learner_id.to_string(), row);
    }

    pub fn set_peers(&self, rows: Vec<Row>) {
        self.state().peers = rows;
    }

    pub fn set_prerequisites(&self, rows: Vec<Row>) {
        self.state().prerequisites = rows;
    }

    pub fn fail_queries(&self, fail: bool) {
        self.shared.failing.store(fail, Ordering::SeqCst);
    }

    pub fn connects(&self) -> u64 {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub fn query_count(&self, kind: &str) -> u64 {
        self.state().query_counts.get(kind).copied().unwrap_or(0)
    }

    pub fn recorded_interactions(&self) -> Vec<BatchItem> {
        self.state().interactions.clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, GraphState> {
        self.shared.state.lock().unwrap()
    }
}

#[async_trait]
impl GraphStore for RecordingGraph {
    async fn connect(&self) -> Result<Box<dyn GraphConnection>> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingConnection {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct RecordingConnection {
    shared: Arc<GraphShared>,
}

#[async_trait]
impl GraphConnection for RecordingConnection {
    async fn run_query(&mut self, query: &GraphQuery) -> Result<Vec<Row>> {
        let mut state = self.shared.state.lock().unwrap();
        *state.query_counts.entry(query.kind()).or_default() += 1;

        if self.shared.failing.load(Ordering::SeqCst) {
            return Err(MentorError::GraphStore("scripted failure".to_string()));
        }

        Ok(match query {
            GraphQuery::LearnerContext { learner_id } => {
                state.learners.get(learner_id).cloned().into_iter().collect()
            }
            GraphQuery::PeerRecommendations { limit, .. } => {
                state.peers.iter().take(*limit).cloned().collect()
            }
            GraphQuery::Prerequisites { limit, .. } => {
                state.prerequisites.iter().take(*limit).cloned().collect()
            }
            GraphQuery::RecordInteractions { batch } => {
                state.interactions.extend(batch.iter().cloned());
                Vec::new()
            }
        })
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Batch sink that records what it is handed, optionally after a delay.
#[derive(Default)]
pub struct RecordingSink {
    batches: Mutex<Vec<Vec<BatchItem>>>,
    delay: Option<Duration>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<Vec<BatchItem>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchSink for RecordingSink {
    async fn write_batch(&self, batch: Vec<BatchItem>) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(MentorError::GraphStore("scripted write failure".to_string()));
        }
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }
}

/// Similarity store returning a fixed hit list.
#[derive(Default)]
pub struct ScriptedSimilarity {
    hits: Mutex<Vec<SimilarityHit>>,
    calls: Mutex<Vec<(String, SearchParams)>>,
    failing: AtomicBool,
}

impl ScriptedSimilarity {
    pub fn set_hits(&self, hits: Vec<SimilarityHit>) {
        *self.hits.lock().unwrap() = hits;
    }

    pub fn fail(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn last_call(&self) -> Option<(String, SearchParams)> {
        self.calls.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl SimilarityStore for ScriptedSimilarity {
    async fn search(&self, text: &str, params: &SearchParams) -> Result<Vec<SimilarityHit>> {
        self.calls
            .lock()
            .unwrap()
            .push((text.to_string(), params.clone()));
        if self.failing.load(Ordering::SeqCst) {
            return Err(MentorError::SimilarityStore("scripted failure".to_string()));
        }
        Ok(self.hits.lock().unwrap().clone())
    }
}

/// Session store kept in memory.
#[derive(Default)]
pub struct MemorySessions {
    sessions: Mutex<HashMap<String, SessionContext>>,
    appended: Mutex<Vec<(String, String, String)>>,
    failing: AtomicBool,
    delay: Option<Duration>,
}

impl MemorySessions {
    /// Appends wait `delay` before recording.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    /// `(session_id, query, response)` in append order.
    pub fn appended(&self) -> Vec<(String, String, String)> {
        self.appended.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionStore for MemorySessions {
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionContext>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MentorError::SessionStore("scripted failure".to_string()));
        }
        Ok(self.sessions.lock().unwrap().get(session_id).cloned())
    }

    async fn append_conversation(
        &self,
        session_id: &str,
        query: &str,
        response: &str,
    ) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(MentorError::SessionStore("scripted failure".to_string()));
        }
        self.appended.lock().unwrap().push((
            session_id.to_string(),
            query.to_string(),
            response.to_string(),
        ));
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionContext {
                session_id: session_id.to_string(),
                ..SessionContext::default()
            });
        session.history.push(ConversationTurn {
            query: query.to_string(),
            response: response.to_string(),
            timestamp: chrono::Utc::now(),
        });
        Ok(())
    }
}

enum Behaviour {
    Reply(String),
    Fail,
    Hang,
}

/// Provider with a scripted outcome.
pub struct FakeProvider {
    behaviour: Behaviour,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl FakeProvider {
    fn with(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::with(Behaviour::Reply(text.to_string()))
    }

    pub fn failing() -> Self {
        Self::with(Behaviour::Fail)
    }

    pub fn hanging() -> Self {
        Self::with(Behaviour::Hang)
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "fake".to_string(),
            display_name: "Fake".to_string(),
            default_model: "fake-model".to_string(),
        }
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let model = request.model.clone();
        self.requests.lock().unwrap().push(request);
        match &self.behaviour {
            Behaviour::Reply(text) => Ok(CompletionResponse {
                id: "fake-1".to_string(),
                model,
                content: text.clone(),
                finish_reason: Some("stop".to_string()),
                usage: None,
            }),
            Behaviour::Fail => Err(MentorError::ApiRequest("scripted failure".to_string())),
            Behaviour::Hang => {
                std::future::pending::<()>().await;
                Err(MentorError::ApiRequest("unreachable".to_string()))
            }
        }
    }
}
