//! Registry of live sessions, keyed by conversation id

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{EndReason, Session};
use crate::error::SessionError;
use crate::realtime::Phase;
use crate::types::ConversationId;
use crate::voice::CaptureMode;

/// Public view of a live session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub conversation_id: ConversationId,
    pub owner: String,
    pub mode: CaptureMode,
    pub phase: Phase,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<ConversationId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { sessions: RwLock::new(HashMap::new()) })
    }

    /// Register a session. Any live session under the same conversation id
    /// is shut down and returned; it must have the same owner.
    pub async fn register(&self, session: Arc<Session>) -> Result<Option<Arc<Session>>, SessionError> {
        let id = session.id().to_string();
        let previous = {
            let mut sessions = self.sessions.write().await;
            if let Some(live) = sessions.get(&id) {
                if live.owner() != session.owner() {
                    warn!("{} tried to take over {} from {}", session.owner(), id, live.owner());
                    return Err(SessionError::Forbidden(id));
                }
            }
            sessions.insert(id.clone(), session)
        };
        match &previous {
            Some(old) => {
                info!("Session {} replaced (owner: {})", id, old.owner());
                old.shutdown(EndReason::Replaced);
            }
            None => info!("Session registered: {}", id),
        }
        Ok(previous)
    }

    /// Stop the live session under `conversation_id`. The entry stays until
    /// the runner's teardown removes it with [`remove_instance`](Self::remove_instance).
    ///
    /// Returns the session only to the call that stopped it; unknown ids and
    /// sessions already on their way out give `None`.
    pub async fn unregister(&self, conversation_id: &str) -> Option<Arc<Session>> {
        let session = self.get(conversation_id).await?;
        if !session.shutdown(EndReason::Stopped) {
            return None;
        }
        info!("Session unregistering: {}", conversation_id);
        Some(session)
    }

    /// Remove the entry only if it still belongs to `instance`. A session
    /// ending on its own must not evict the session that replaced it.
    pub async fn remove_instance(&self, conversation_id: &str, instance: uuid::Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.get(conversation_id).map(|s| s.instance()) == Some(instance) {
            sessions.remove(conversation_id);
            debug!("Session {} removed after ending", conversation_id);
            true
        } else {
            false
        }
    }

    pub async fn get(&self, conversation_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(conversation_id).cloned()
    }

    /// Summaries of all live sessions, ordered by conversation id
    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionSummary> = sessions.values().map(|s| s.summary()).collect();
        list.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        list
    }

    pub async fn list_for_owner(&self, owner: &str) -> Vec<SessionSummary> {
        self.list().await.into_iter().filter(|s| s.owner == owner).collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Signal every live session to stop. Each runner removes its own entry.
    pub async fn shutdown_all(&self) -> Vec<Arc<Session>> {
        let live: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        for session in &live {
            session.shutdown(EndReason::Stopped);
        }
        live
    }
}
