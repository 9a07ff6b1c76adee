//! The hosted retrieval/completion service, as seen by this crate.
//!
//! [`RemoteService`] lists the operations the provisioning, session and turn
//! layers need from the OpenAI Assistants API: files, vector stores and their
//! file batches, assistants, threads, messages and runs. Two backends exist:
//!
//! | Backend | Purpose |
//! |---------|---------|
//! | [`openai::OpenAIService`] | HTTP client for the real API |
//! | [`memory::InMemoryService`] | In-process double with scripted job statuses |
//!
//! Every operation reports a missing object as [`RemoteError::NotFound`], kept
//! apart from transport and API failures so callers can tell "the object is
//! gone" from "the service is unreachable".

pub mod memory;
pub mod openai;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::models::Role;

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("remote object not found: {resource}")]
    NotFound { resource: String },

    #[error("remote API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("could not reach the remote service: {0}")]
    Transport(String),

    #[error("unexpected response from the remote service: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound { .. })
    }
}

/// Reference to a remote object that carries nothing but its id
/// (files, vector stores, assistants, threads).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub id: String,
}

impl ObjectRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// A document to upload for retrieval.
#[derive(Debug, Clone, Copy)]
pub struct FileUpload<'a> {
    pub file_name: &'a str,
    pub bytes: &'a [u8],
}

/// What to create when provisioning an assistant.
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantSpec {
    pub name: String,
    pub model: String,
    pub instructions: String,
    pub vector_store_id: String,
}

/// Status of a vector store file batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Other(String),
}

impl BatchStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "in_progress" => BatchStatus::InProgress,
            "completed" => BatchStatus::Completed,
            "failed" => BatchStatus::Failed,
            "cancelled" => BatchStatus::Cancelled,
            other => BatchStatus::Other(other.to_string()),
        }
    }

    /// Everything except `completed`, `failed` and `cancelled` counts as pending.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            BatchStatus::InProgress => "in_progress",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
            BatchStatus::Other(s) => s,
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBatch {
    pub id: String,
    pub vector_store_id: String,
    pub status: BatchStatus,
    pub failed_files: u64,
}

/// Status of an assistant run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Queued,
    InProgress,
    Cancelling,
    RequiresAction,
    Completed,
    Failed,
    Cancelled,
    Expired,
    Incomplete,
    Other(String),
}

impl RunStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "queued" => RunStatus::Queued,
            "in_progress" => RunStatus::InProgress,
            "cancelling" => RunStatus::Cancelling,
            "requires_action" => RunStatus::RequiresAction,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "cancelled" => RunStatus::Cancelled,
            "expired" => RunStatus::Expired,
            "incomplete" => RunStatus::Incomplete,
            other => RunStatus::Other(other.to_string()),
        }
    }

    /// Unrecognized statuses are treated as still pending.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::RequiresAction
                | RunStatus::Completed
                | RunStatus::Failed
                | RunStatus::Cancelled
                | RunStatus::Expired
                | RunStatus::Incomplete
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::Cancelling => "cancelling",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Expired => "expired",
            RunStatus::Incomplete => "incomplete",
            RunStatus::Other(s) => s,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    pub id: String,
    pub thread_id: String,
    pub status: RunStatus,
    /// `last_error.message` for failed runs.
    pub last_error: Option<String>,
}

/// One typed content block of a thread message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    Text(String),
    /// Any non-text block (`image_file`, `image_url`, ...), by type name.
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub run_id: Option<String>,
    pub created_at: i64,
}

impl Message {
    /// Text blocks joined by blank lines; `None` when the message has no text at all.
    pub fn text(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text(text) => Some(text.as_str()),
                ContentBlock::Other(_) => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOrder {
    Oldest,
    Newest,
}

impl MessageOrder {
    pub fn as_query(&self) -> &'static str {
        match self {
            MessageOrder::Oldest => "asc",
            MessageOrder::Newest => "desc",
        }
    }
}

/// Operations consumed from the hosted assistant service.
///
/// `retrieve_*` calls double as existence checks and must return
/// [`RemoteError::NotFound`] for objects that no longer exist.
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn upload_file(&self, upload: FileUpload<'_>) -> Result<ObjectRef, RemoteError>;

    async fn retrieve_file(&self, file_id: &str) -> Result<ObjectRef, RemoteError>;

    async fn create_vector_store(&self, name: &str) -> Result<ObjectRef, RemoteError>;

    async fn retrieve_vector_store(&self, vector_store_id: &str)
        -> Result<ObjectRef, RemoteError>;

    /// Submit `file_ids` to the vector store as one asynchronous batch.
    async fn create_file_batch(
        &self,
        vector_store_id: &str,
        file_ids: &[String],
    ) -> Result<FileBatch, RemoteError>;

    async fn retrieve_file_batch(
        &self,
        vector_store_id: &str,
        batch_id: &str,
    ) -> Result<FileBatch, RemoteError>;

    /// Create an assistant with the `file_search` tool bound to `spec.vector_store_id`.
    async fn create_assistant(&self, spec: &AssistantSpec) -> Result<ObjectRef, RemoteError>;

    async fn retrieve_assistant(&self, assistant_id: &str) -> Result<ObjectRef, RemoteError>;

    async fn create_thread(&self) -> Result<ObjectRef, RemoteError>;

    async fn retrieve_thread(&self, thread_id: &str) -> Result<ObjectRef, RemoteError>;

    /// Append a user message to the thread.
    async fn create_message(&self, thread_id: &str, text: &str) -> Result<Message, RemoteError>;

    /// All messages of the thread in the requested order.
    async fn list_messages(
        &self,
        thread_id: &str,
        order: MessageOrder,
    ) -> Result<Vec<Message>, RemoteError>;

    async fn create_run(&self, thread_id: &str, assistant_id: &str) -> Result<Run, RemoteError>;

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<Run, RemoteError>;
}
