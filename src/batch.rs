//! Batched interaction write-back
//!
//! Interaction logs are buffered in memory and written to the graph store in
//! one bulk operation, either when the buffer reaches `size_threshold` or when
//! the flush timer fires. Each flush swaps the buffer out under the lock, so a
//! batch is written exactly once and concurrent enqueues land in the next one.
//! Writes are best-effort: a failed flush is logged, counted and dropped.

use crate::error::Result;
use crate::pool::ConnectionPool;
use crate::stores::GraphQuery;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// One logged interaction awaiting write-back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    pub learner_id: String,
    pub query: String,
    pub context_summary: String,
    pub enqueued_at: DateTime<Utc>,
}

impl BatchItem {
    pub fn new(
        learner_id: impl Into<String>,
        query: impl Into<String>,
        context_summary: impl Into<String>,
    ) -> Self {
        Self {
            learner_id: learner_id.into(),
            query: query.into(),
            context_summary: context_summary.into(),
            enqueued_at: Utc::now(),
        }
    }
}

/// Destination of flushed batches.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn write_batch(&self, batch: Vec<BatchItem>) -> Result<()>;
}

/// Writes batches to the graph store through the connection pool.
pub struct GraphBatchSink {
    pool: Arc<ConnectionPool>,
}

impl GraphBatchSink {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BatchSink for GraphBatchSink {
    async fn write_batch(&self, batch: Vec<BatchItem>) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        conn.run_query(&GraphQuery::RecordInteractions { batch })
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct BatchStats {
    pub pending: usize,
    pub flushed_batches: u64,
    pub flushed_items: u64,
    pub dropped_batches: u64,
    pub dropped_items: u64,
}

#[derive(Default)]
struct BatchState {
    items: Vec<BatchItem>,
    /// Armed timer that has not fired yet.
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever a timer is armed or cancelled; a timer only swaps while current.
    generation: u64,
    /// Writes started by fired timers. `flush` awaits them.
    in_flight: Vec<JoinHandle<usize>>,
}

impl BatchState {
    fn cancel_timer(&mut self) {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct BatchInner {
    sink: Arc<dyn BatchSink>,
    size_threshold: usize,
    flush_interval: Duration,
    state: Mutex<BatchState>,
    flushed_batches: AtomicU64,
    flushed_items: AtomicU64,
    dropped_batches: AtomicU64,
    dropped_items: AtomicU64,
}

#[derive(Clone)]
pub struct BatchWriter {
    inner: Arc<BatchInner>,
}

impl BatchWriter {
    pub fn new(sink: Arc<dyn BatchSink>, size_threshold: usize, flush_interval: Duration) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                sink,
                size_threshold: size_threshold.max(1),
                flush_interval,
                state: Mutex::new(BatchState::default()),
                flushed_batches: AtomicU64::new(0),
                flushed_items: AtomicU64::new(0),
                dropped_batches: AtomicU64::new(0),
                dropped_items: AtomicU64::new(0),
            }),
        }
    }

    /// Buffer an item. Reaching the size threshold flushes inline; otherwise
    /// the flush timer is armed if it is not already running.
    pub async fn enqueue(&self, item: BatchItem) {
        let ready = {
            let mut state = self.inner.lock();
            state.items.push(item);

            if state.items.len() >= self.inner.size_threshold {
                state.cancel_timer();
                Some(std::mem::take(&mut state.items))
            } else {
                if state.timer.is_none() {
                    state.generation += 1;
                    let generation = state.generation;
                    state.timer = Some(self.arm_timer(generation));
                }
                None
            }
        };

        if let Some(batch) = ready {
            self.inner.write(batch).await;
        }
    }

    /// Flush whatever is buffered now, cancel the pending timer and wait for
    /// writes already started by fired timers. Returns the items written.
    pub async fn flush(&self) -> usize {
        let (batch, in_flight) = {
            let mut state = self.inner.lock();
            state.cancel_timer();
            (
                std::mem::take(&mut state.items),
                std::mem::take(&mut state.in_flight),
            )
        };

        let mut written = self.inner.write(batch).await;
        for handle in in_flight {
            match handle.await {
                Ok(count) => written += count,
                Err(e) => error!(error = %e, "Timed batch write terminated abnormally"),
            }
        }
        written
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            pending: self.inner.lock().items.len(),
            flushed_batches: self.inner.flushed_batches.load(Ordering::Relaxed),
            flushed_items: self.inner.flushed_items.load(Ordering::Relaxed),
            dropped_batches: self.inner.dropped_batches.load(Ordering::Relaxed),
            dropped_items: self.inner.dropped_items.load(Ordering::Relaxed),
        }
    }

    /// The timer hands its batch to a separate write task registered in
    /// `in_flight`, so cancelling a timer can never interrupt a write.
    fn arm_timer(&self, generation: u64) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.flush_interval).await;

            let mut state = inner.lock();
            if state.generation != generation {
                return;
            }
            state.timer = None;
            let batch = std::mem::take(&mut state.items);
            if batch.is_empty() {
                return;
            }
            let writer = Arc::clone(&inner);
            state.in_flight.retain(|handle| !handle.is_finished());
            state
                .in_flight
                .push(tokio::spawn(async move { writer.write(batch).await }));
        })
    }
}

impl BatchInner {
    async fn write(&self, batch: Vec<BatchItem>) -> usize {
        let count = batch.len();
        if count == 0 {
            return 0;
        }

        match self.sink.write_batch(batch).await {
            Ok(()) => {
                self.flushed_batches.fetch_add(1, Ordering::Relaxed);
                self.flushed_items.fetch_add(count as u64, Ordering::Relaxed);
                info!(count, "Batch processed interactions");
                count
            }
            Err(e) => {
                self.dropped_batches.fetch_add(1, Ordering::Relaxed);
                self.dropped_items.fetch_add(count as u64, Ordering::Relaxed);
                error!(count, error = %e, "Dropping interaction batch after failed write");
                0
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
