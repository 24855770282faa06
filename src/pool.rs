//! Graph connection pool
//!
//! At most `max_pool_size` connections exist at once. `acquire` reuses an idle
//! connection, opens a new one while under the cap, and otherwise waits up to
//! `acquire_timeout` for a release. Connections go back to the pool when the
//! `PooledConnection` guard drops; a connection whose query failed is closed
//! instead of being reused.

use crate::error::{MentorError, Result};
use crate::stores::{GraphConnection, GraphQuery, GraphStore, Row};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PoolStats {
    pub max_pool_size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub opened: u64,
    pub reused: u64,
    pub closed: u64,
    pub discarded: u64,
}

pub struct ConnectionPool {
    store: Arc<dyn GraphStore>,
    idle: Mutex<Vec<Box<dyn GraphConnection>>>,
    permits: Arc<Semaphore>,
    max_pool_size: usize,
    acquire_timeout: Duration,
    in_use: AtomicUsize,
    opened: AtomicU64,
    reused: AtomicU64,
    closed: Arc<AtomicU64>,
    discarded: AtomicU64,
}

impl ConnectionPool {
    pub fn new(
        store: Arc<dyn GraphStore>,
        max_pool_size: usize,
        acquire_timeout: Duration,
    ) -> Arc<Self> {
        let max_pool_size = max_pool_size.max(1);
        Arc::new(Self {
            store,
            idle: Mutex::new(Vec::with_capacity(max_pool_size)),
            permits: Arc::new(Semaphore::new(max_pool_size)),
            max_pool_size,
            acquire_timeout,
            in_use: AtomicUsize::new(0),
            opened: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            closed: Arc::new(AtomicU64::new(0)),
            discarded: AtomicU64::new(0),
        })
    }

    /// Take exclusive ownership of a connection until the guard is dropped.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        let permit = tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| MentorError::PoolTimeout(self.acquire_timeout))?
        .map_err(|_| MentorError::GraphStore("connection pool is shut down".to_string()))?;

        let conn = match self.pop_idle() {
            Some(conn) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                debug!("Reusing pooled graph connection");
                conn
            }
            None => {
                // On failure the permit drops here and the slot is freed.
                let conn = self.store.connect().await?;
                self.opened.fetch_add(1, Ordering::Relaxed);
                debug!(opened = self.opened.load(Ordering::Relaxed), "Opened graph connection");
                conn
            }
        };

        self.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            permit: Some(permit),
            broken: false,
        })
    }

    /// Close every idle connection and refuse further acquisitions.
    pub async fn close_all(&self) -> usize {
        self.permits.close();
        let drained: Vec<Box<dyn GraphConnection>> = {
            let mut idle = self.lock_idle();
            idle.drain(..).collect()
        };

        let count = drained.len();
        for conn in drained {
            if let Err(e) = conn.close().await {
                warn!(error = %e, "Failed to close graph connection");
            }
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
        debug!(count, "Closed pooled graph connections");
        count
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_pool_size: self.max_pool_size,
            idle: self.lock_idle().len(),
            in_use: self.in_use.load(Ordering::SeqCst),
            opened: self.opened.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    fn pop_idle(&self) -> Option<Box<dyn GraphConnection>> {
        self.lock_idle().pop()
    }

    fn release(&self, conn: Box<dyn GraphConnection>, broken: bool) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);

        if broken {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            self.close_detached(conn);
            return;
        }

        let overflow = {
            let mut idle = self.lock_idle();
            if idle.len() < self.max_pool_size && !self.permits.is_closed() {
                idle.push(conn);
                None
            } else {
                Some(conn)
            }
        };

        if let Some(conn) = overflow {
            self.close_detached(conn);
        }
    }

    /// Close a connection from a synchronous context (guard drop).
    fn close_detached(&self, conn: Box<dyn GraphConnection>) {
        let closed = Arc::clone(&self.closed);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = conn.close().await {
                        warn!(error = %e, "Failed to close graph connection");
                    }
                    closed.fetch_add(1, Ordering::Relaxed);
                });
            }
            Err(_) => {
                drop(conn);
                closed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<Box<dyn GraphConnection>>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Scoped ownership of one pooled connection.
pub struct PooledConnection {
    conn: Option<Box<dyn GraphConnection>>,
    pool: Arc<ConnectionPool>,
    permit: Option<OwnedSemaphorePermit>,
    broken: bool,
}

impl PooledConnection {
    /// Run a query; a failure marks the connection so it is discarded on release.
    pub async fn run_query(&mut self, query: &GraphQuery) -> Result<Vec<Row>> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| MentorError::GraphStore("connection already released".to_string()))?;

        match conn.run_query(query).await {
            Ok(rows) => Ok(rows),
            Err(e) => {
                self.broken = true;
                Err(e)
            }
        }
    }

    /// Give the connection back to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.broken);
        }
        // Free the slot only after the connection is back in the idle set.
        self.permit.take();
    }
}
