//! User identities and their conversation threads.
//!
//! Identities are anonymous: a random [`UserId`] minted on the first request
//! of a UI session and remembered in memory under a [`SessionKey`] the
//! browser holds. Identities do not survive a process restart; thread records
//! on disk do.
//!
//! The session map is bounded: sessions idle for longer than the idle timeout
//! are forgotten, and minting beyond the capacity evicts the least recently
//! seen session. A forgotten key is treated like an unknown one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{ChatMessage, Notice, Resolution, SessionKey, ThreadHandle, ThreadRecord, UserId};
use crate::remote::{MessageOrder, RemoteError, RemoteService};
use crate::state::{Loaded, StateError, StateStore};
use crate::validator::{validate, Liveness, ObjectKind};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    State(#[from] StateError),
}

const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_MAX_SESSIONS: usize = 10_000;

struct SessionEntry {
    user: UserId,
    last_seen: Instant,
}

pub struct SessionManager {
    service: Arc<dyn RemoteService>,
    store: StateStore,
    sessions: Mutex<HashMap<SessionKey, SessionEntry>>,
    idle_timeout: Duration,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(service: Arc<dyn RemoteService>, store: StateStore) -> Self {
        Self {
            service,
            store,
            sessions: Mutex::new(HashMap::new()),
            idle_timeout: DEFAULT_SESSION_IDLE,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }

    pub fn with_limits(mut self, idle_timeout: Duration, max_sessions: usize) -> Self {
        self.idle_timeout = idle_timeout;
        self.max_sessions = max_sessions.max(1);
        self
    }

    /// The identity bound to `key`, minting a new session and identity when
    /// `key` is absent or unknown.
    pub fn ensure_user_identity(&self, key: Option<&str>) -> (SessionKey, UserId) {
        if let Some(key) = key {
            let key = SessionKey::new(key);
            if let Some(user) = self.user_for(&key) {
                return (key, user);
            }
        }

        let key = SessionKey::new(uuid::Uuid::new_v4().simple().to_string());
        let user = UserId::generate();
        let now = Instant::now();

        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let idle_timeout = self.idle_timeout;
        sessions.retain(|_, entry| now.duration_since(entry.last_seen) < idle_timeout);
        while sessions.len() >= self.max_sessions {
            let Some(oldest) = sessions
                .iter()
                .min_by_key(|(_, entry)| entry.last_seen)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            sessions.remove(&oldest);
            debug!("evicted least recently seen session");
        }
        sessions.insert(
            key.clone(),
            SessionEntry {
                user: user.clone(),
                last_seen: now,
            },
        );
        info!(user = %user, sessions = sessions.len(), "new user session");
        (key, user)
    }

    /// The identity bound to `key`, without minting. Refreshes the session's
    /// idle clock; an expired session is dropped and yields `None`.
    pub fn user_for(&self, key: &SessionKey) -> Option<UserId> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = sessions.get_mut(key)?;
        if now.duration_since(entry.last_seen) >= self.idle_timeout {
            sessions.remove(key);
            return None;
        }
        entry.last_seen = now;
        Some(entry.user.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// The user's recorded thread if it still exists, otherwise a new one.
    pub async fn resolve_thread(
        &self,
        user: &UserId,
    ) -> Result<Resolution<ThreadHandle>, SessionError> {
        let mut notices = Vec::new();

        match self.store.load_thread_record(user)? {
            Loaded::Found(record) => {
                match validate(self.service.as_ref(), ObjectKind::Thread, &record.thread_id)
                    .await?
                {
                    Liveness::Valid => {
                        return Ok(Resolution::new(
                            ThreadHandle::new(record.thread_id),
                            notices,
                        ))
                    }
                    Liveness::NotFound => {
                        warn!(user = %user, thread = %record.thread_id, "recorded thread is gone");
                        notices.push(Notice::warning(
                            "The conversation could not be found. Starting a new one...",
                        ));
                        self.store.delete_thread_record(user)?;
                    }
                }
            }
            Loaded::Corrupt(reason) => {
                warn!(user = %user, %reason, "thread record is corrupt");
                notices.push(Notice::warning(
                    "The conversation record was corrupt. Starting a new one...",
                ));
                self.store.delete_thread_record(user)?;
            }
            Loaded::Missing => {}
        }

        let thread = self.service.create_thread().await?;
        self.store.save_thread_record(
            user,
            &ThreadRecord {
                thread_id: thread.id.clone(),
            },
        )?;
        info!(user = %user, thread = %thread.id, "created conversation thread");

        Ok(Resolution::new(ThreadHandle::new(thread.id), notices))
    }

    /// The thread's text messages, oldest first. Messages without any text block are left out.
    pub async fn history(&self, thread: &ThreadHandle) -> Result<Vec<ChatMessage>, RemoteError> {
        let messages = self
            .service
            .list_messages(thread.as_str(), MessageOrder::Oldest)
            .await?;

        Ok(messages
            .into_iter()
            .filter_map(|m| {
                m.text().map(|text| ChatMessage {
                    role: m.role,
                    text,
                })
            })
            .collect())
    }
}
