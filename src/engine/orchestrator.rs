//! Response orchestrator
//!
//! Single entry point for answering a learner question. The pipeline is:
//! response cache, then retrieval joined with the session lookup, ranking,
//! prompt assembly and one bounded generation call. Post-processing (session
//! history and interaction write-back) goes onto a bounded work queue drained
//! by a background worker, so it never delays the answer. A full queue drops
//! the job and counts it.
//!
//! `answer` never fails: any error in the pipeline becomes a fallback answer.

use crate::batch::{BatchItem, BatchStats, BatchWriter, GraphBatchSink};
use crate::cache::CacheStats;
use crate::config::{GenerationConfig, MentorConfig};
use crate::engine::prompt::build_messages;
use crate::engine::rank::rank;
use crate::engine::retriever::ContextRetriever;
use crate::engine::types::RankedItem;
use crate::engine::{EngineCaches, ResponseKey, truncate_chars};
use crate::error::{MentorError, Result};
use crate::pool::{ConnectionPool, PoolStats};
use crate::providers::{CompletionRequest, Provider};
use crate::stores::{GraphStore, SessionStore, SimilarityStore};
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// External collaborators injected into the engine.
#[derive(Clone)]
pub struct EngineDeps {
    pub similarity: Arc<dyn SimilarityStore>,
    pub graph: Arc<dyn GraphStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub provider: Arc<dyn Provider>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AnswerOptions {
    /// Bypass the response cache lookup (the fresh answer is still cached).
    pub skip_cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Hit,
    Miss,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub context_used: Vec<RankedItem>,
    pub latency_ms: u64,
    pub cache_status: CacheStatus,
    pub fallback: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSnapshot {
    pub caches: Vec<CacheStats>,
    pub pool: PoolStats,
    pub batch: BatchStats,
    pub post_process_failures: u64,
    pub post_process_dropped: u64,
}

struct PostProcessJob {
    learner_id: String,
    session_id: String,
    query: String,
    response: String,
    context_summary: String,
}

pub struct ResponseOrchestrator {
    caches: Arc<EngineCaches>,
    retriever: ContextRetriever,
    pool: Arc<ConnectionPool>,
    batch: BatchWriter,
    sessions: Arc<dyn SessionStore>,
    provider: Arc<dyn Provider>,
    generation: GenerationConfig,
    model: String,
    response_key_chars: usize,
    post_tx: Mutex<Option<mpsc::Sender<PostProcessJob>>>,
    post_worker: Mutex<Option<JoinHandle<()>>>,
    post_failures: Arc<AtomicU64>,
    post_dropped: AtomicU64,
}

impl ResponseOrchestrator {
    /// Build the engine and start its post-processing worker. Must run inside a tokio runtime.
    pub fn new(deps: EngineDeps, config: &MentorConfig) -> Self {
        let caches = Arc::new(EngineCaches::new(&config.cache));
        let pool = ConnectionPool::new(
            deps.graph,
            config.pool.max_pool_size,
            config.pool.acquire_timeout(),
        );
        let batch = BatchWriter::new(
            Arc::new(GraphBatchSink::new(Arc::clone(&pool))),
            config.batch.size_threshold,
            config.batch.flush_interval(),
        );
        let retriever = ContextRetriever::new(
            deps.similarity,
            Arc::clone(&pool),
            Arc::clone(&caches),
            config.retrieval.clone(),
            config.cache.retrieval_key_chars,
        );
        let model = config
            .generation
            .model
            .clone()
            .unwrap_or_else(|| deps.provider.info().default_model);

        let post_failures = Arc::new(AtomicU64::new(0));
        let (post_tx, post_rx) = mpsc::channel(config.batch.queue_capacity.max(1));
        let worker = tokio::spawn(run_post_processing(
            post_rx,
            Arc::clone(&deps.sessions),
            batch.clone(),
            Arc::clone(&post_failures),
        ));

        Self {
            caches,
            retriever,
            pool,
            batch,
            sessions: deps.sessions,
            provider: deps.provider,
            generation: config.generation.clone(),
            model,
            response_key_chars: config.cache.response_key_chars,
            post_tx: Mutex::new(Some(post_tx)),
            post_worker: Mutex::new(Some(worker)),
            post_failures,
            post_dropped: AtomicU64::new(0),
        }
    }

    pub async fn answer(
        &self,
        learner_id: &str,
        session_id: &str,
        query: &str,
        options: AnswerOptions,
    ) -> Answer {
        let started = Instant::now();
        let key = ResponseKey {
            learner_id: learner_id.to_string(),
            query_prefix: truncate_chars(query, self.response_key_chars).to_string(),
        };

        if !options.skip_cache {
            if let Some(mut cached) = self.caches.response.get(&key) {
                cached.cache_status = CacheStatus::Hit;
                cached.latency_ms = elapsed_ms(started);
                debug!(learner = %learner_id, latency_ms = cached.latency_ms, "Response cache hit");
                return cached;
            }
        }

        match self.run_pipeline(learner_id, session_id, query).await {
            Ok((text, context_used)) => {
                let answer = Answer {
                    text,
                    context_used,
                    latency_ms: elapsed_ms(started),
                    cache_status: CacheStatus::Miss,
                    fallback: false,
                };
                self.caches.response.insert(key, answer.clone());
                self.schedule_post_processing(learner_id, session_id, query, &answer);
                info!(learner = %learner_id, latency_ms = answer.latency_ms, context_items = answer.context_used.len(), "Query processed");
                answer
            }
            Err(e) => {
                error!(learner = %learner_id, error = %e, "Answer pipeline failed, using fallback response");
                fallback_answer(query, elapsed_ms(started))
            }
        }
    }

    async fn run_pipeline(
        &self,
        learner_id: &str,
        session_id: &str,
        query: &str,
    ) -> Result<(String, Vec<RankedItem>)> {
        let (retrieval, session) = tokio::join!(
            self.retriever.retrieve(learner_id, query),
            self.sessions.get_session(session_id),
        );

        match session {
            Ok(Some(session)) => {
                debug!(session = %session_id, history_turns = session.history.len(), "Session loaded")
            }
            Ok(None) => debug!(session = %session_id, "No stored session"),
            Err(e) => warn!(session = %session_id, error = %e, "Session lookup failed"),
        }

        let ranked = rank(&retrieval.similarity, &retrieval.graph, &retrieval.learner);
        let messages = build_messages(query, &ranked, &retrieval.learner);

        let request = CompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(self.generation.temperature),
            max_tokens: Some(self.generation.max_tokens),
        };

        let timeout = self.generation.timeout();
        let response = tokio::time::timeout(timeout, self.provider.complete(request))
            .await
            .map_err(|_| MentorError::GenerationTimeout(timeout))??;

        debug!(
            id = %response.id,
            model = %response.model,
            finish_reason = response.finish_reason.as_deref().unwrap_or("unknown"),
            total_tokens = response.usage.as_ref().map(|u| u.total_tokens),
            "Generation complete"
        );

        if response.content.trim().is_empty() {
            return Err(MentorError::ApiRequest(
                "provider returned an empty completion".to_string(),
            ));
        }

        Ok((response.content, ranked))
    }

    fn schedule_post_processing(
        &self,
        learner_id: &str,
        session_id: &str,
        query: &str,
        answer: &Answer,
    ) {
        let job = PostProcessJob {
            learner_id: learner_id.to_string(),
            session_id: session_id.to_string(),
            query: query.to_string(),
            response: answer.text.clone(),
            context_summary: summarize_context(&answer.context_used),
        };

        let sent = match self.lock_sender().as_ref() {
            Some(tx) => tx.try_send(job),
            None => Err(mpsc::error::TrySendError::Closed(job)),
        };
        match sent {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.post_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(learner = %learner_id, "Post-processing queue full, interaction dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.post_failures.fetch_add(1, Ordering::Relaxed);
                warn!(learner = %learner_id, "Post-processing queue closed, interaction not recorded");
            }
        }
    }

    /// Warm the learner-context cache; returns how many learners loaded.
    pub async fn preload(&self, learner_ids: &[String]) -> usize {
        info!(count = learner_ids.len(), "Preloading learner contexts");
        let results = join_all(
            learner_ids
                .iter()
                .map(|id| self.retriever.load_learner_context(id)),
        )
        .await;

        let mut loaded = 0;
        for (id, result) in learner_ids.iter().zip(results) {
            match result {
                Ok(_) => loaded += 1,
                Err(e) => error!(learner = %id, error = %e, "Failed to preload learner context"),
            }
        }
        info!(loaded, "Cache preload complete");
        loaded
    }

    pub fn clear_caches(&self) {
        self.caches.clear();
        info!("All caches cleared");
    }

    /// Eagerly drop expired entries from all caches.
    pub fn purge_expired(&self) -> usize {
        let purged = self.caches.purge_expired();
        debug!(purged, "Purged expired cache entries");
        purged
    }

    pub fn metrics(&self) -> PerformanceSnapshot {
        PerformanceSnapshot {
            caches: self.caches.stats(),
            pool: self.pool.stats(),
            batch: self.batch.stats(),
            post_process_failures: self.post_failures.load(Ordering::Relaxed),
            post_process_dropped: self.post_dropped.load(Ordering::Relaxed),
        }
    }

    /// Drain post-processing, flush pending writes and close pooled connections.
    pub async fn shutdown(&self) {
        self.lock_sender().take();
        let worker = self
            .post_worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "Post-processing worker terminated abnormally");
            }
        }

        let flushed = self.batch.flush().await;
        let closed = self.pool.close_all().await;
        info!(flushed, closed, "Engine shut down");
    }

    fn lock_sender(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<PostProcessJob>>> {
        self.post_tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Runs each job in its own task so a panic is reported here instead of killing the worker.
/// Within a job the session append and the batch enqueue proceed concurrently.
async fn run_post_processing(
    mut rx: mpsc::Receiver<PostProcessJob>,
    sessions: Arc<dyn SessionStore>,
    batch: BatchWriter,
    failures: Arc<AtomicU64>,
) {
    while let Some(job) = rx.recv().await {
        let sessions = Arc::clone(&sessions);
        let batch = batch.clone();
        let learner_id = job.learner_id.clone();

        let outcome = tokio::spawn(async move {
            let item = BatchItem::new(job.learner_id, job.query.clone(), job.context_summary);
            let (session_result, ()) = tokio::join!(
                sessions.append_conversation(&job.session_id, &job.query, &job.response),
                batch.enqueue(item),
            );
            session_result
        })
        .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failures.fetch_add(1, Ordering::Relaxed);
                warn!(learner = %learner_id, error = %e, "Session history update failed");
            }
            Err(e) => {
                failures.fetch_add(1, Ordering::Relaxed);
                error!(learner = %learner_id, error = %e, "Post-processing task panicked");
            }
        }
    }
}

fn summarize_context(items: &[RankedItem]) -> String {
    items
        .iter()
        .map(|r| {
            r.item
                .metadata
                .title
                .clone()
                .unwrap_or_else(|| truncate_chars(&r.item.content, 60).to_string())
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn fallback_answer(query: &str, latency_ms: u64) -> Answer {
    let topic = query.trim();
    let text = if topic.is_empty() {
        "I'll help you with that. Let me provide some general guidance while the course material is unavailable.".to_string()
    } else {
        format!(
            "I'll help you with that. \"{}\" is an important topic in your course. Let me provide some general guidance while the course material is unavailable.",
            topic
        )
    };

    Answer {
        text,
        context_used: Vec::new(),
        latency_ms,
        cache_status: CacheStatus::Error,
        fallback: true,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::{ContentMetadata, SimilarityHit};
    use crate::testing::{FakeProvider, MemorySessions, RecordingGraph, ScriptedSimilarity};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        graph: Arc<RecordingGraph>,
        similarity: Arc<ScriptedSimilarity>,
        sessions: Arc<MemorySessions>,
        provider: Arc<FakeProvider>,
        engine: ResponseOrchestrator,
    }

    fn fixture(provider: FakeProvider, config: MentorConfig) -> Fixture {
        let graph = Arc::new(RecordingGraph::default());
        let similarity = Arc::new(ScriptedSimilarity::default());
        let sessions = Arc::new(MemorySessions::default());
        let provider = Arc::new(provider);
        let engine = ResponseOrchestrator::new(
            EngineDeps {
                similarity: similarity.clone(),
                graph: graph.clone(),
                sessions: sessions.clone(),
                provider: provider.clone(),
            },
            &config,
        );
        Fixture {
            graph,
            similarity,
            sessions,
            provider,
            engine,
        }
    }

    fn seed(f: &Fixture) {
        f.graph.set_learner(
            "learner-1",
            json!({"current_module": "m1", "struggles": ["assessment"]}),
        );
        f.graph.set_peers(vec![json!({"title": "Fair grading workshop", "peer_count": 2})]);
        f.similarity.set_hits(vec![SimilarityHit {
            content: "Consistent assessment criteria help grade fairly.".to_string(),
            metadata: ContentMetadata {
                module: Some("m1".to_string()),
                title: Some("Assessment criteria".to_string()),
                concepts: Vec::new(),
            },
            similarity: 0.7,
        }]);
    }

    #[tokio::test]
    async fn test_miss_then_hit_for_identical_query() {
        let f = fixture(FakeProvider::replying("Use a rubric."), MentorConfig::default());
        seed(&f);

        let first = f
            .engine
            .answer("learner-1", "s1", "How do I grade fairly?", AnswerOptions::default())
            .await;
        assert_eq!(first.cache_status, CacheStatus::Miss);
        assert!(!first.fallback);
        assert_eq!(first.text, "Use a rubric.");
        assert_eq!(first.context_used.len(), 2);

        let second = f
            .engine
            .answer("learner-1", "s1", "How do I grade fairly?", AnswerOptions::default())
            .await;
        assert_eq!(second.cache_status, CacheStatus::Hit);
        assert_eq!(second.text, first.text);
        assert!(second.latency_ms <= 1);
        assert_eq!(f.provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_skip_cache_reruns_pipeline() {
        let f = fixture(FakeProvider::replying("Use a rubric."), MentorConfig::default());
        seed(&f);

        f.engine
            .answer("learner-1", "s1", "How do I grade fairly?", AnswerOptions::default())
            .await;
        let again = f
            .engine
            .answer(
                "learner-1",
                "s1",
                "How do I grade fairly?",
                AnswerOptions { skip_cache: true },
            )
            .await;

        assert_eq!(again.cache_status, CacheStatus::Miss);
        assert_eq!(f.provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_prompt_carries_module_snippets_and_budget() {
        let f = fixture(FakeProvider::replying("ok"), MentorConfig::default());
        seed(&f);

        f.engine
            .answer("learner-1", "s1", "How do I grade fairly?", AnswerOptions::default())
            .await;

        let request = f.provider.last_request().unwrap();
        assert_eq!(request.max_tokens, Some(300));
        assert!(request.messages[0].content.contains("m1"));
        assert!(request.messages[1].content.contains("Consistent assessment criteria"));
        assert!(request.messages[1].content.contains("Question: How do I grade fairly?"));
    }

    #[tokio::test]
    async fn test_failing_provider_returns_fallback() {
        let f = fixture(FakeProvider::failing(), MentorConfig::default());
        seed(&f);

        let answer = f
            .engine
            .answer("learner-1", "s1", "How do I grade fairly?", AnswerOptions::default())
            .await;

        assert!(answer.fallback);
        assert_eq!(answer.cache_status, CacheStatus::Error);
        assert!(answer.text.contains("How do I grade fairly?"));
        assert!(answer.context_used.is_empty());

        // Fallbacks are not cached.
        f.engine
            .answer("learner-1", "s1", "How do I grade fairly?", AnswerOptions::default())
            .await;
        assert_eq!(f.provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_provider_times_out_into_fallback() {
        let mut config = MentorConfig::default();
        config.generation.timeout_ms = 500;
        let f = fixture(FakeProvider::hanging(), config);
        seed(&f);

        let started = Instant::now();
        let answer = f
            .engine
            .answer("learner-1", "s1", "What is moderation?", AnswerOptions::default())
            .await;

        assert!(answer.fallback);
        assert!(!answer.text.is_empty());
        assert!(started.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_total_store_outage_still_answers() {
        let f = fixture(FakeProvider::replying("General advice."), MentorConfig::default());
        f.graph.fail_queries(true);
        f.similarity.fail(true);
        f.sessions.fail(true);

        let answer = f
            .engine
            .answer("learner-1", "s1", "Any tips?", AnswerOptions::default())
            .await;

        assert!(!answer.fallback);
        assert!(answer.context_used.is_empty());
        assert_eq!(answer.text, "General advice.");
    }

    #[tokio::test]
    async fn test_shutdown_drains_post_processing() {
        let f = fixture(FakeProvider::replying("Use a rubric."), MentorConfig::default());
        seed(&f);

        f.engine
            .answer("learner-1", "s1", "How do I grade fairly?", AnswerOptions::default())
            .await;
        f.engine
            .answer("learner-1", "s2", "What is moderation?", AnswerOptions::default())
            .await;
        f.engine.shutdown().await;

        assert_eq!(f.sessions.appended().len(), 2);
        let recorded = f.graph.recorded_interactions();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].learner_id, "learner-1");
        assert_eq!(recorded[0].context_summary, "Assessment criteria; Fair grading workshop");

        let metrics = f.engine.metrics();
        assert_eq!(metrics.batch.flushed_items, 2);
        assert_eq!(metrics.pool.in_use, 0);
        assert_eq!(metrics.pool.idle, 0);
    }

    #[tokio::test]
    async fn test_session_failure_is_counted_not_surfaced() {
        let f = fixture(FakeProvider::replying("ok"), MentorConfig::default());
        seed(&f);
        f.sessions.fail(true);

        let answer = f
            .engine
            .answer("learner-1", "s1", "How do I grade fairly?", AnswerOptions::default())
            .await;
        f.engine.shutdown().await;

        assert!(!answer.fallback);
        assert_eq!(f.engine.metrics().post_process_failures, 1);
        assert_eq!(f.graph.recorded_interactions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_post_queue_drops_and_counts() {
        let mut config = MentorConfig::default();
        config.batch.queue_capacity = 1;
        let sessions = Arc::new(MemorySessions::with_delay(Duration::from_secs(1)));
        let graph = Arc::new(RecordingGraph::default());
        let engine = ResponseOrchestrator::new(
            EngineDeps {
                similarity: Arc::new(ScriptedSimilarity::default()),
                graph: graph.clone(),
                sessions: sessions.clone(),
                provider: Arc::new(FakeProvider::replying("ok")),
            },
            &config,
        );

        for query in ["first question", "second question", "third question"] {
            let answer = engine
                .answer("learner-1", "s1", query, AnswerOptions::default())
                .await;
            assert!(!answer.fallback);
        }
        engine.shutdown().await;

        let metrics = engine.metrics();
        assert!(metrics.post_process_dropped >= 1);
        assert_eq!(
            sessions.appended().len() as u64 + metrics.post_process_dropped,
            3
        );
        assert_eq!(metrics.batch.flushed_items, sessions.appended().len() as u64);
        assert_eq!(metrics.post_process_failures, 0);
    }

    #[tokio::test]
    async fn test_preload_and_clear_caches() {
        let f = fixture(FakeProvider::replying("ok"), MentorConfig::default());
        seed(&f);

        let loaded = f
            .engine
            .preload(&["learner-1".to_string(), "learner-2".to_string()])
            .await;
        assert_eq!(loaded, 2);
        assert_eq!(f.graph.query_count("learner_context"), 2);

        f.engine
            .answer("learner-1", "s1", "How do I grade fairly?", AnswerOptions::default())
            .await;
        assert_eq!(f.graph.query_count("learner_context"), 2);

        f.engine.clear_caches();
        assert!(f.engine.metrics().caches.iter().all(|c| c.entries == 0));
    }
}
