//! In-memory [`RemoteService`] for tests and offline demos.
//!
//! Objects live in `HashMap`s behind a `std::sync::Mutex`. Asynchronous jobs
//! follow scripted status sequences: each `retrieve_*` call pops the next
//! status and the last one sticks. Completed runs append the scripted assistant
//! reply to the thread exactly once.
//!
//! Besides the service itself the double exposes what tests need to observe
//! and perturb it: mutation counters, an ordered event log, deletion of remote
//! objects, per-file upload failures and a global outage switch.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{
    AssistantSpec, BatchStatus, ContentBlock, FileBatch, FileUpload, Message, MessageOrder,
    ObjectRef, RemoteError, RemoteService, Run, RunStatus,
};
use crate::models::Role;

/// How the next created run behaves.
#[derive(Debug, Clone)]
pub struct RunScript {
    pub statuses: Vec<RunStatus>,
    /// Reply appended when the run completes. `None` answers with an echo of the question.
    pub reply: Option<Vec<ContentBlock>>,
    pub last_error: Option<String>,
}

impl RunScript {
    pub fn completes_with(statuses: Vec<RunStatus>, reply: Vec<ContentBlock>) -> Self {
        Self {
            statuses,
            reply: Some(reply),
            last_error: None,
        }
    }

    pub fn fails(message: impl Into<String>) -> Self {
        Self {
            statuses: vec![RunStatus::InProgress, RunStatus::Failed],
            reply: None,
            last_error: Some(message.into()),
        }
    }
}

impl Default for RunScript {
    fn default() -> Self {
        Self {
            statuses: vec![RunStatus::Completed],
            reply: None,
            last_error: None,
        }
    }
}

/// Snapshot of how many objects each mutating operation created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub uploads: usize,
    pub vector_stores: usize,
    pub file_batches: usize,
    pub assistants: usize,
    pub threads: usize,
    pub messages: usize,
    pub runs: usize,
}

impl CallCounts {
    pub fn mutations(&self) -> usize {
        self.uploads
            + self.vector_stores
            + self.file_batches
            + self.assistants
            + self.threads
            + self.messages
            + self.runs
    }
}

struct StoredRun {
    thread_id: String,
    statuses: VecDeque<RunStatus>,
    current: RunStatus,
    reply: Vec<ContentBlock>,
    last_error: Option<String>,
    replied: bool,
}

struct StoredBatch {
    vector_store_id: String,
    statuses: VecDeque<BatchStatus>,
    current: BatchStatus,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    clock: i64,
    files: HashMap<String, String>,
    vector_stores: HashSet<String>,
    batches: HashMap<String, StoredBatch>,
    assistants: HashMap<String, AssistantSpec>,
    threads: HashMap<String, Vec<Message>>,
    runs: HashMap<String, StoredRun>,
    batch_scripts: VecDeque<Vec<BatchStatus>>,
    run_scripts: VecDeque<RunScript>,
    failing_uploads: HashSet<String>,
    unavailable: bool,
    counts: CallCounts,
    events: Vec<String>,
}

impl Inner {
    fn mint(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}_{}", prefix, self.next_id)
    }

    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    fn check_available(&self) -> Result<(), RemoteError> {
        if self.unavailable {
            Err(RemoteError::Transport("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

fn not_found(kind: &str, id: &str) -> RemoteError {
    RemoteError::NotFound {
        resource: format!("{} {}", kind, id),
    }
}

pub struct InMemoryService {
    inner: Mutex<Inner>,
}

impl InMemoryService {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Status sequence for the next created file batch (default: `completed`).
    pub fn script_batch(&self, statuses: Vec<BatchStatus>) {
        self.lock().batch_scripts.push_back(statuses);
    }

    /// Behavior of the next created run (default: [`RunScript::default`]).
    pub fn script_run(&self, script: RunScript) {
        self.lock().run_scripts.push_back(script);
    }

    pub fn fail_uploads_of(&self, file_name: &str) {
        self.lock().failing_uploads.insert(file_name.to_string());
    }

    /// While set, every call fails with [`RemoteError::Transport`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn delete_assistant(&self, id: &str) {
        self.lock().assistants.remove(id);
    }

    pub fn delete_vector_store(&self, id: &str) {
        self.lock().vector_stores.remove(id);
    }

    pub fn delete_file(&self, id: &str) {
        self.lock().files.remove(id);
    }

    pub fn delete_thread(&self, id: &str) {
        self.lock().threads.remove(id);
    }

    pub fn counts(&self) -> CallCounts {
        self.lock().counts
    }

    /// Ordered log of `create_message`, `create_run` and terminal run observations.
    pub fn events(&self) -> Vec<String> {
        self.lock().events.clone()
    }

    pub fn assistant(&self, id: &str) -> Option<AssistantSpec> {
        self.lock().assistants.get(id).cloned()
    }

    /// Push a message straight into a thread, bypassing the counters.
    pub fn seed_message(&self, thread_id: &str, role: Role, content: Vec<ContentBlock>) {
        let mut inner = self.lock();
        let id = inner.mint("msg");
        let created_at = inner.tick();
        if let Some(messages) = inner.threads.get_mut(thread_id) {
            messages.push(Message {
                id,
                role,
                content,
                run_id: None,
                created_at,
            });
        }
    }
}

impl Default for InMemoryService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteService for InMemoryService {
    async fn upload_file(&self, upload: FileUpload<'_>) -> Result<ObjectRef, RemoteError> {
        let mut inner = self.lock();
        inner.check_available()?;
        if inner.failing_uploads.contains(upload.file_name) {
            return Err(RemoteError::Api {
                status: 400,
                message: format!("Invalid file format: {}", upload.file_name),
            });
        }
        let id = inner.mint("file");
        inner.files.insert(id.clone(), upload.file_name.to_string());
        inner.counts.uploads += 1;
        Ok(ObjectRef::new(id))
    }

    async fn retrieve_file(&self, file_id: &str) -> Result<ObjectRef, RemoteError> {
        let inner = self.lock();
        inner.check_available()?;
        if inner.files.contains_key(file_id) {
            Ok(ObjectRef::new(file_id))
        } else {
            Err(not_found("file", file_id))
        }
    }

    async fn create_vector_store(&self, _name: &str) -> Result<ObjectRef, RemoteError> {
        let mut inner = self.lock();
        inner.check_available()?;
        let id = inner.mint("vs");
        inner.vector_stores.insert(id.clone());
        inner.counts.vector_stores += 1;
        Ok(ObjectRef::new(id))
    }

    async fn retrieve_vector_store(
        &self,
        vector_store_id: &str,
    ) -> Result<ObjectRef, RemoteError> {
        let inner = self.lock();
        inner.check_available()?;
        if inner.vector_stores.contains(vector_store_id) {
            Ok(ObjectRef::new(vector_store_id))
        } else {
            Err(not_found("vector store", vector_store_id))
        }
    }

    async fn create_file_batch(
        &self,
        vector_store_id: &str,
        file_ids: &[String],
    ) -> Result<FileBatch, RemoteError> {
        let mut inner = self.lock();
        inner.check_available()?;
        if !inner.vector_stores.contains(vector_store_id) {
            return Err(not_found("vector store", vector_store_id));
        }
        if let Some(missing) = file_ids.iter().find(|id| !inner.files.contains_key(*id)) {
            return Err(not_found("file", missing));
        }
        let statuses: VecDeque<BatchStatus> = inner
            .batch_scripts
            .pop_front()
            .unwrap_or_else(|| vec![BatchStatus::Completed])
            .into();
        let id = inner.mint("vsfb");
        inner.batches.insert(
            id.clone(),
            StoredBatch {
                vector_store_id: vector_store_id.to_string(),
                statuses,
                current: BatchStatus::InProgress,
            },
        );
        inner.counts.file_batches += 1;
        Ok(FileBatch {
            id,
            vector_store_id: vector_store_id.to_string(),
            status: BatchStatus::InProgress,
            failed_files: 0,
        })
    }

    async fn retrieve_file_batch(
        &self,
        vector_store_id: &str,
        batch_id: &str,
    ) -> Result<FileBatch, RemoteError> {
        let mut inner = self.lock();
        inner.check_available()?;
        let batch = inner
            .batches
            .get_mut(batch_id)
            .filter(|b| b.vector_store_id == vector_store_id)
            .ok_or_else(|| not_found("file batch", batch_id))?;
        if let Some(next) = batch.statuses.pop_front() {
            batch.current = next;
        }
        let failed_files = u64::from(batch.current == BatchStatus::Failed);
        Ok(FileBatch {
            id: batch_id.to_string(),
            vector_store_id: vector_store_id.to_string(),
            status: batch.current.clone(),
            failed_files,
        })
    }

    async fn create_assistant(&self, spec: &AssistantSpec) -> Result<ObjectRef, RemoteError> {
        let mut inner = self.lock();
        inner.check_available()?;
        if !inner.vector_stores.contains(&spec.vector_store_id) {
            return Err(not_found("vector store", &spec.vector_store_id));
        }
        let id = inner.mint("asst");
        inner.assistants.insert(id.clone(), spec.clone());
        inner.counts.assistants += 1;
        Ok(ObjectRef::new(id))
    }

    async fn retrieve_assistant(&self, assistant_id: &str) -> Result<ObjectRef, RemoteError> {
        let inner = self.lock();
        inner.check_available()?;
        if inner.assistants.contains_key(assistant_id) {
            Ok(ObjectRef::new(assistant_id))
        } else {
            Err(not_found("assistant", assistant_id))
        }
    }

    async fn create_thread(&self) -> Result<ObjectRef, RemoteError> {
        let mut inner = self.lock();
        inner.check_available()?;
        let id = inner.mint("thread");
        inner.threads.insert(id.clone(), Vec::new());
        inner.counts.threads += 1;
        Ok(ObjectRef::new(id))
    }

    async fn retrieve_thread(&self, thread_id: &str) -> Result<ObjectRef, RemoteError> {
        let inner = self.lock();
        inner.check_available()?;
        if inner.threads.contains_key(thread_id) {
            Ok(ObjectRef::new(thread_id))
        } else {
            Err(not_found("thread", thread_id))
        }
    }

    async fn create_message(&self, thread_id: &str, text: &str) -> Result<Message, RemoteError> {
        let mut inner = self.lock();
        inner.check_available()?;
        if !inner.threads.contains_key(thread_id) {
            return Err(not_found("thread", thread_id));
        }
        let message = Message {
            id: inner.mint("msg"),
            role: Role::User,
            content: vec![ContentBlock::Text(text.to_string())],
            run_id: None,
            created_at: inner.tick(),
        };
        if let Some(messages) = inner.threads.get_mut(thread_id) {
            messages.push(message.clone());
        }
        inner.counts.messages += 1;
        inner.events.push(format!("create_message {}", thread_id));
        Ok(message)
    }

    async fn list_messages(
        &self,
        thread_id: &str,
        order: MessageOrder,
    ) -> Result<Vec<Message>, RemoteError> {
        let inner = self.lock();
        inner.check_available()?;
        let mut messages = inner
            .threads
            .get(thread_id)
            .cloned()
            .ok_or_else(|| not_found("thread", thread_id))?;
        messages.sort_by_key(|m| m.created_at);
        if order == MessageOrder::Newest {
            messages.reverse();
        }
        Ok(messages)
    }

    async fn create_run(&self, thread_id: &str, assistant_id: &str) -> Result<Run, RemoteError> {
        let mut inner = self.lock();
        inner.check_available()?;
        if !inner.assistants.contains_key(assistant_id) {
            return Err(not_found("assistant", assistant_id));
        }
        let question = inner
            .threads
            .get(thread_id)
            .ok_or_else(|| not_found("thread", thread_id))?
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(Message::text)
            .unwrap_or_default();

        let script = inner.run_scripts.pop_front().unwrap_or_default();
        let reply = script
            .reply
            .unwrap_or_else(|| vec![ContentBlock::Text(format!("Resposta: {}", question))]);
        let id = inner.mint("run");
        inner.runs.insert(
            id.clone(),
            StoredRun {
                thread_id: thread_id.to_string(),
                statuses: script.statuses.into(),
                current: RunStatus::Queued,
                reply,
                last_error: script.last_error,
                replied: false,
            },
        );
        inner.counts.runs += 1;
        inner.events.push(format!("create_run {}", thread_id));
        Ok(Run {
            id,
            thread_id: thread_id.to_string(),
            status: RunStatus::Queued,
            last_error: None,
        })
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<Run, RemoteError> {
        let mut inner = self.lock();
        inner.check_available()?;
        let run = inner
            .runs
            .get_mut(run_id)
            .filter(|r| r.thread_id == thread_id)
            .ok_or_else(|| not_found("run", run_id))?;
        if let Some(next) = run.statuses.pop_front() {
            run.current = next;
        }
        let status = run.current.clone();
        let last_error = match status {
            RunStatus::Failed => run.last_error.clone(),
            _ => None,
        };
        let pending_reply = if status == RunStatus::Completed && !run.replied {
            run.replied = true;
            Some(run.reply.clone())
        } else {
            None
        };
        let terminal = status.is_terminal();

        if let Some(content) = pending_reply {
            let message = Message {
                id: inner.mint("msg"),
                role: Role::Assistant,
                content,
                run_id: Some(run_id.to_string()),
                created_at: inner.tick(),
            };
            if let Some(messages) = inner.threads.get_mut(thread_id) {
                messages.push(message);
            }
        }
        if terminal {
            inner
                .events
                .push(format!("run_terminal {} {}", thread_id, status));
        }

        Ok(Run {
            id: run_id.to_string(),
            thread_id: thread_id.to_string(),
            status,
            last_error,
        })
    }
}
