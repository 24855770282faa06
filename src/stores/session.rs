//! Local session store
//!
//! Append-only `sessions.ndjson` log, replayed into memory on open.

use crate::error::{MentorError, Result};
use crate::stores::{ConversationTurn, SessionContext, SessionStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Turns kept in memory per session.
const MAX_HISTORY: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SessionEvent {
    Started {
        session_id: String,
        learner_id: Option<String>,
        #[serde(default)]
        context: HashMap<String, String>,
        timestamp: DateTime<Utc>,
    },
    Conversation {
        session_id: String,
        query: String,
        response: String,
        timestamp: DateTime<Utc>,
    },
}

pub struct LocalSessionStore {
    log_file: PathBuf,
    sessions: Mutex<HashMap<String, SessionContext>>,
}

impl LocalSessionStore {
    pub fn open(storage_path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&storage_path)?;
        let log_file = storage_path.join("sessions.ndjson");

        let mut sessions = HashMap::new();
        let mut events = 0usize;
        if log_file.exists() {
            let reader = BufReader::new(File::open(&log_file)?);
            for (number, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<SessionEvent>(&line) {
                    Ok(event) => {
                        apply(&mut sessions, event);
                        events += 1;
                    }
                    Err(e) => warn!(line = number + 1, error = %e, "Skipping unreadable session event"),
                }
            }
        }
        info!(sessions = sessions.len(), events, "Replayed session log");

        Ok(Self {
            log_file,
            sessions: Mutex::new(sessions),
        })
    }

    /// Record a session's learner; a no-op for sessions already known.
    pub async fn start_session(&self, session_id: &str, learner_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(session_id) {
            return Ok(());
        }

        let event = SessionEvent::Started {
            session_id: session_id.to_string(),
            learner_id: Some(learner_id.to_string()),
            context: HashMap::new(),
            timestamp: Utc::now(),
        };
        self.append(&event).await?;
        apply(&mut sessions, event);
        Ok(())
    }

    async fn append(&self, event: &SessionEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .await
            .map_err(|e| MentorError::SessionStore(format!("cannot open session log: {}", e)))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

fn apply(sessions: &mut HashMap<String, SessionContext>, event: SessionEvent) {
    match event {
        SessionEvent::Started {
            session_id,
            learner_id,
            context,
            ..
        } => {
            let session = sessions
                .entry(session_id.clone())
                .or_insert_with(|| SessionContext {
                    session_id,
                    ..SessionContext::default()
                });
            session.learner_id = learner_id;
            session.context.extend(context);
        }
        SessionEvent::Conversation {
            session_id,
            query,
            response,
            timestamp,
        } => {
            let session = sessions
                .entry(session_id.clone())
                .or_insert_with(|| SessionContext {
                    session_id,
                    ..SessionContext::default()
                });
            session.history.push(ConversationTurn {
                query,
                response,
                timestamp,
            });
            if session.history.len() > MAX_HISTORY {
                let excess = session.history.len() - MAX_HISTORY;
                session.history.drain(..excess);
            }
        }
    }
}

#[async_trait]
impl SessionStore for LocalSessionStore {
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionContext>> {
        Ok(self.sessions.lock().await.get(session_id).cloned())
    }

    async fn append_conversation(
        &self,
        session_id: &str,
        query: &str,
        response: &str,
    ) -> Result<()> {
        let event = SessionEvent::Conversation {
            session_id: session_id.to_string(),
            query: query.to_string(),
            response: response.to_string(),
            timestamp: Utc::now(),
        };

        let mut sessions = self.sessions.lock().await;
        self.append(&event).await?;
        apply(&mut sessions, event);
        Ok(())
    }
}
