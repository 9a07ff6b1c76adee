//! Durable local state: the assistant record and one thread record per user.
//!
//! Files are always read whole and replaced whole (write to a sibling
//! temporary file, then rename). Loads distinguish three outcomes:
//!
//! | Outcome | Meaning |
//! |---------|---------|
//! | [`Loaded::Missing`] | no file |
//! | [`Loaded::Corrupt`] | the file exists but is not the expected JSON; safe to discard |
//! | [`Loaded::Found`] | parsed |
//!
//! Any other I/O failure (permissions, a directory in the way, ...) is a
//! [`StateError`] and must not be mistaken for a cache miss.
//!
//! There is no file locking: two processes sharing a state directory race.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::StateConfig;
use crate::fingerprint::Fingerprint;
use crate::models::{AssistantRecord, ThreadRecord, UserId};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to {action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode state record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Loaded<T> {
    Missing,
    Corrupt(String),
    Found(T),
}

/// The assistant record as found on disk. Every field is optional so that
/// incomplete records (including ones written by older versions) parse and
/// can be told apart from corrupt files.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StoredAssistantRecord {
    pub assistant_id: Option<String>,
    pub vector_store_id: Option<String>,
    pub file_ids: Option<Vec<String>>,
    pub fingerprint: Option<Fingerprint>,
    pub provisioned_at: Option<DateTime<Utc>>,
}

impl StoredAssistantRecord {
    /// `None` unless every handle field and the fingerprint are present and non-empty.
    pub fn complete(self) -> Option<AssistantRecord> {
        let assistant_id = self.assistant_id.filter(|s| !s.is_empty())?;
        let vector_store_id = self.vector_store_id.filter(|s| !s.is_empty())?;
        let file_ids = self
            .file_ids
            .filter(|ids| !ids.is_empty() && ids.iter().all(|id| !id.is_empty()))?;
        let fingerprint = self.fingerprint?;
        Some(AssistantRecord {
            assistant_id,
            vector_store_id,
            file_ids,
            fingerprint,
            provisioned_at: self.provisioned_at.unwrap_or_else(Utc::now),
        })
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    assistant_path: PathBuf,
    threads_dir: PathBuf,
}

impl StateStore {
    pub fn new(assistant_path: impl Into<PathBuf>, threads_dir: impl Into<PathBuf>) -> Self {
        Self {
            assistant_path: assistant_path.into(),
            threads_dir: threads_dir.into(),
        }
    }

    pub fn from_config(config: &StateConfig) -> Self {
        Self::new(config.assistant_path(), config.threads_path())
    }

    pub fn assistant_path(&self) -> &Path {
        &self.assistant_path
    }

    pub fn thread_path(&self, user: &UserId) -> PathBuf {
        self.threads_dir.join(format!("{}.json", user.as_str()))
    }

    // ============ Assistant record ============

    pub fn load_assistant_record(&self) -> Result<Loaded<StoredAssistantRecord>, StateError> {
        load_json(&self.assistant_path)
    }

    pub fn save_assistant_record(&self, record: &AssistantRecord) -> Result<(), StateError> {
        write_json(&self.assistant_path, record)
    }

    pub fn delete_assistant_record(&self) -> Result<bool, StateError> {
        remove_file(&self.assistant_path)
    }

    // ============ Thread records ============

    pub fn load_thread_record(&self, user: &UserId) -> Result<Loaded<ThreadRecord>, StateError> {
        load_json(&self.thread_path(user))
    }

    pub fn save_thread_record(
        &self,
        user: &UserId,
        record: &ThreadRecord,
    ) -> Result<(), StateError> {
        write_json(&self.thread_path(user), record)
    }

    pub fn delete_thread_record(&self, user: &UserId) -> Result<bool, StateError> {
        remove_file(&self.thread_path(user))
    }

    /// Delete the assistant record and every thread record.
    ///
    /// Returns how many files were removed.
    pub fn reset(&self) -> Result<usize, StateError> {
        let mut removed = usize::from(self.delete_assistant_record()?);

        let entries = match std::fs::read_dir(&self.threads_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(removed),
            Err(source) => {
                return Err(StateError::Io {
                    action: "list",
                    path: self.threads_dir.clone(),
                    source,
                })
            }
        };
        for entry in entries {
            let entry = entry.map_err(|source| StateError::Io {
                action: "list",
                path: self.threads_dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") && remove_file(&path)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Loaded<T>, StateError> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Loaded::Missing),
        Err(source) => {
            return Err(StateError::Io {
                action: "read",
                path: path.to_path_buf(),
                source,
            })
        }
    };

    match serde_json::from_slice(&content) {
        Ok(value) => Ok(Loaded::Found(value)),
        Err(e) => Ok(Loaded::Corrupt(e.to_string())),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    let io_err = |action: &'static str, path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| StateError::Io {
            action,
            path,
            source,
        }
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err("create", parent))?;
    }

    let body = serde_json::to_vec_pretty(value)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, body).map_err(io_err("write", &tmp))?;
    std::fs::rename(&tmp, path).map_err(io_err("replace", path))?;
    Ok(())
}

fn remove_file(path: &Path) -> Result<bool, StateError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(source) => Err(StateError::Io {
            action: "remove",
            path: path.to_path_buf(),
            source,
        }),
    }
}
