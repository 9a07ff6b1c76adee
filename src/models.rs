//! Core data models shared by the provisioning, session and turn layers.
//!
//! Handles are thin newtypes over the remote service's opaque ids so that an
//! assistant id can never be passed where a thread id is expected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::fingerprint::Fingerprint;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

handle!(
    /// Remote assistant id (`asst_...`).
    AssistantHandle
);
handle!(
    /// Remote conversation thread id (`thread_...`).
    ThreadHandle
);
handle!(
    /// Opaque key held by the browser for the lifetime of one UI session.
    SessionKey
);

/// Local, anonymous user identity. Also used as the thread record file stem,
/// so only `[A-Za-z0-9_-]` is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw.len() > 128 {
            anyhow::bail!("user id must be between 1 and 128 characters");
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            anyhow::bail!("invalid user id '{}': only letters, digits, '-' and '_' are allowed", raw);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The persisted assistant configuration, once every field is known to be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantRecord {
    pub assistant_id: String,
    pub vector_store_id: String,
    pub file_ids: Vec<String>,
    pub fingerprint: Fingerprint,
    pub provisioned_at: DateTime<Utc>,
}

impl AssistantRecord {
    pub fn handle(&self) -> AssistantHandle {
        AssistantHandle::new(&self.assistant_id)
    }
}

/// Persisted mapping from one user identity to its remote thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub thread_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A text-only view of one thread message, ready for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
}

/// Result of one question/answer exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    Answered { answer: String },
    /// The run ended without an answer; `diagnostic` is safe to show to the user.
    Failed { diagnostic: String },
    /// The assistant asked to call a tool. No tools are implemented, so the run is abandoned.
    ActionRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
}

/// One-line message about a local recovery action, for the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            message: message.into(),
        }
    }
}

/// A resolved value plus whatever the resolver had to repair on the way.
#[derive(Debug, Clone)]
pub struct Resolution<T> {
    pub value: T,
    pub notices: Vec<Notice>,
}

impl<T> Resolution<T> {
    pub fn new(value: T, notices: Vec<Notice>) -> Self {
        Self { value, notices }
    }
}
