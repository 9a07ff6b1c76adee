//! One question/answer exchange on a conversation thread.
//!
//! ```text
//! create_message ──▶ create_run ──▶ poll run ──▶ completed       → Answered
//!                                             ├─▶ failed          → Failed(last_error)
//!                                             ├─▶ requires_action → ActionRequired
//!                                             └─▶ cancelled | expired | incomplete → Failed(status)
//! ```
//!
//! Exchanges on the same thread are serialized by a per-thread async mutex
//! held from the message append until the outcome is known. The mutex is
//! dropped from the map once no exchange holds or awaits it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

use crate::models::{AssistantHandle, Role, ThreadHandle, TurnOutcome};
use crate::poll::{poll_until, PollError, PollPolicy};
use crate::remote::{MessageOrder, RemoteError, RemoteService, Run, RunStatus};

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("question is empty")]
    EmptyQuestion,

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Poll(#[from] PollError),
}

type ThreadLocks = Mutex<HashMap<ThreadHandle, Arc<tokio::sync::Mutex<()>>>>;

pub struct TurnEngine {
    service: Arc<dyn RemoteService>,
    poll: PollPolicy,
    locks: ThreadLocks,
}

/// Exclusive use of one thread. Releasing it removes the map entry when
/// nobody else is waiting on the same mutex.
struct ThreadLease<'a> {
    locks: &'a ThreadLocks,
    thread: ThreadHandle,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ThreadLease<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let ours = locks
            .get(&self.thread)
            .is_some_and(|lock| Arc::ptr_eq(lock, &self.lock));
        // One reference in the map, one here.
        if ours && Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.thread);
        }
    }
}

impl TurnEngine {
    pub fn new(service: Arc<dyn RemoteService>, poll: PollPolicy) -> Self {
        Self {
            service,
            poll,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn execute_turn(
        &self,
        assistant: &AssistantHandle,
        thread: &ThreadHandle,
        question: &str,
    ) -> Result<TurnOutcome, TurnError> {
        if question.trim().is_empty() {
            return Err(TurnError::EmptyQuestion);
        }

        let _lease = self.lease(thread).await;

        self.service
            .create_message(thread.as_str(), question)
            .await?;
        let created = self
            .service
            .create_run(thread.as_str(), assistant.as_str())
            .await?;
        info!(thread = %thread, run = %created.id, "run started");

        let run = poll_until(
            &self.poll,
            "run",
            || self.service.retrieve_run(thread.as_str(), &created.id),
            |run: &Run| run.status.is_terminal(),
            |run: &Run| run.status.to_string(),
        )
        .await?;

        let outcome = match &run.status {
            RunStatus::Completed => self.answer(thread, &run).await?,
            RunStatus::RequiresAction => {
                warn!(thread = %thread, run = %run.id, "run requires an action, abandoning");
                TurnOutcome::ActionRequired
            }
            RunStatus::Failed => TurnOutcome::Failed {
                diagnostic: run
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            },
            other => TurnOutcome::Failed {
                diagnostic: other.to_string(),
            },
        };

        if let TurnOutcome::Failed { diagnostic } = &outcome {
            warn!(thread = %thread, run = %run.id, %diagnostic, "run did not produce an answer");
        }
        Ok(outcome)
    }

    /// Text of the assistant message produced by `run`, falling back to the
    /// newest assistant message with text.
    async fn answer(&self, thread: &ThreadHandle, run: &Run) -> Result<TurnOutcome, TurnError> {
        let messages = self
            .service
            .list_messages(thread.as_str(), MessageOrder::Newest)
            .await?;

        let mut fallback = None;
        for message in messages.iter().filter(|m| m.role == Role::Assistant) {
            let Some(text) = message.text() else {
                continue;
            };
            if message.run_id.as_deref() == Some(run.id.as_str()) {
                return Ok(TurnOutcome::Answered { answer: text });
            }
            if fallback.is_none() {
                fallback = Some(text);
            }
        }

        Ok(match fallback {
            Some(answer) => TurnOutcome::Answered { answer },
            None => TurnOutcome::Failed {
                diagnostic: "the run completed without a text answer".to_string(),
            },
        })
    }

    async fn lease(&self, thread: &ThreadHandle) -> ThreadLease<'_> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(thread.clone())
            .or_default()
            .clone();
        let mut lease = ThreadLease {
            locks: &self.locks,
            thread: thread.clone(),
            lock,
            guard: None,
        };
        lease.guard = Some(lease.lock.clone().lock_owned().await);
        lease
    }

    #[cfg(test)]
    fn tracked_threads(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
