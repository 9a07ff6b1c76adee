//! Assistant provisioning: reuse the recorded assistant or build a new one.
//!
//! [`AssistantProvisioner::resolve_assistant`] first tries the cached path:
//!
//! 1. fingerprint the corpus;
//! 2. load the assistant record (missing or corrupt → miss, corrupt files are deleted);
//! 3. discard it if incomplete or if its fingerprint differs;
//! 4. confirm the assistant, the vector store and every file still exist.
//!    One missing object discards the whole record. Service errors propagate
//!    with the record left in place.
//!
//! On a miss it runs the provisioning protocol:
//!
//! ```text
//! upload documents ──▶ create vector store ──▶ file batch ──▶ poll batch
//!                                                              │
//!                          persist record ◀── create assistant ◀┘ (completed)
//! ```
//!
//! Objects created before a failure are not rolled back.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{AssistantConfig, CorpusConfig};
use crate::fingerprint::{scan_corpus, CorpusScan, Fingerprint};
use crate::models::{AssistantHandle, AssistantRecord, Notice, Resolution};
use crate::poll::{poll_until, PollError, PollPolicy};
use crate::remote::{
    AssistantSpec, BatchStatus, FileBatch, FileUpload, RemoteError, RemoteService,
};
use crate::state::{Loaded, StateError, StateStore};
use crate::validator::{first_missing, ObjectKind};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to scan the corpus: {0:#}")]
    Corpus(anyhow::Error),

    #[error("no document could be uploaded ({attempted} attempted, {unreadable} unreadable)")]
    NothingUploaded { attempted: usize, unreadable: usize },

    #[error("indexing of vector store {vector_store_id} ended with status '{status}'")]
    Indexing {
        vector_store_id: String,
        status: BatchStatus,
    },

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error(transparent)]
    State(#[from] StateError),
}

pub struct AssistantProvisioner {
    service: Arc<dyn RemoteService>,
    store: StateStore,
    corpus: CorpusConfig,
    assistant: AssistantConfig,
    poll: PollPolicy,
}

impl AssistantProvisioner {
    pub fn new(
        service: Arc<dyn RemoteService>,
        store: StateStore,
        corpus: CorpusConfig,
        assistant: AssistantConfig,
        poll: PollPolicy,
    ) -> Self {
        Self {
            service,
            store,
            corpus,
            assistant,
            poll,
        }
    }

    /// Return a usable assistant, provisioning a fresh one only when the
    /// recorded one is missing, stale or gone.
    pub async fn resolve_assistant(&self) -> Result<Resolution<AssistantHandle>, ProvisionError> {
        let scan = scan_corpus(&self.corpus).map_err(ProvisionError::Corpus)?;
        let fingerprint = scan.fingerprint();
        let mut notices = Vec::new();

        for skipped in &scan.skipped {
            notices.push(Notice::warning(format!(
                "Document '{}' could not be read and was skipped: {}",
                skipped.id, skipped.reason
            )));
        }

        if let Some(handle) = self.cached_assistant(&fingerprint, &mut notices).await? {
            info!(assistant = %handle, "reusing provisioned assistant");
            return Ok(Resolution::new(handle, notices));
        }

        notices.push(Notice::info(
            "Setting up the assistant for the current documents. This may take a few seconds.",
        ));
        let record = self.provision(&scan, fingerprint, &mut notices).await?;
        self.store.save_assistant_record(&record)?;
        info!(
            assistant = %record.assistant_id,
            vector_store = %record.vector_store_id,
            files = record.file_ids.len(),
            "provisioned new assistant"
        );

        Ok(Resolution::new(record.handle(), notices))
    }

    /// The recorded assistant if it is complete, current and still exists remotely.
    async fn cached_assistant(
        &self,
        fingerprint: &Fingerprint,
        notices: &mut Vec<Notice>,
    ) -> Result<Option<AssistantHandle>, ProvisionError> {
        let stored = match self.store.load_assistant_record()? {
            Loaded::Missing => return Ok(None),
            Loaded::Corrupt(reason) => {
                warn!(%reason, "assistant configuration is corrupt, discarding");
                notices.push(Notice::warning(
                    "The assistant configuration file was corrupt. Recreating...",
                ));
                self.store.delete_assistant_record()?;
                return Ok(None);
            }
            Loaded::Found(stored) => stored,
        };

        let record = match stored.complete() {
            Some(record) if record.fingerprint == *fingerprint => record,
            Some(_) => {
                info!("corpus changed since the assistant was provisioned");
                notices.push(Notice::warning(
                    "The documents changed since the assistant was configured. Recreating...",
                ));
                self.store.delete_assistant_record()?;
                return Ok(None);
            }
            None => {
                warn!("assistant configuration is incomplete, discarding");
                notices.push(Notice::warning(
                    "The assistant configuration was incomplete. Recreating...",
                ));
                self.store.delete_assistant_record()?;
                return Ok(None);
            }
        };

        let mut objects = vec![
            (ObjectKind::Assistant, record.assistant_id.clone()),
            (ObjectKind::VectorStore, record.vector_store_id.clone()),
        ];
        objects.extend(
            record
                .file_ids
                .iter()
                .map(|id| (ObjectKind::File, id.clone())),
        );

        if let Some((kind, id)) = first_missing(self.service.as_ref(), &objects).await? {
            warn!(%kind, id = %id, "recorded remote object no longer exists");
            notices.push(Notice::warning(format!(
                "The {} '{}' no longer exists on the service. Recreating...",
                kind, id
            )));
            self.store.delete_assistant_record()?;
            return Ok(None);
        }

        Ok(Some(record.handle()))
    }

    async fn provision(
        &self,
        scan: &CorpusScan,
        fingerprint: Fingerprint,
        notices: &mut Vec<Notice>,
    ) -> Result<AssistantRecord, ProvisionError> {
        let file_ids = self.upload_documents(scan, notices).await?;

        let vector_store = self
            .service
            .create_vector_store(&self.assistant.vector_store_name)
            .await?;
        let batch = self
            .service
            .create_file_batch(&vector_store.id, &file_ids)
            .await?;
        info!(vector_store = %vector_store.id, batch = %batch.id, "indexing documents");

        let service = self.service.as_ref();
        let vs_id = vector_store.id.as_str();
        let batch_id = batch.id.as_str();
        let batch = poll_until(
            &self.poll,
            "vector store indexing",
            || service.retrieve_file_batch(vs_id, batch_id),
            |b: &FileBatch| b.status.is_terminal(),
            |b: &FileBatch| b.status.to_string(),
        )
        .await?;

        if batch.status != BatchStatus::Completed {
            return Err(ProvisionError::Indexing {
                vector_store_id: vector_store.id,
                status: batch.status,
            });
        }
        if batch.failed_files > 0 {
            notices.push(Notice::warning(format!(
                "{} document(s) could not be indexed.",
                batch.failed_files
            )));
        }

        let assistant = self
            .service
            .create_assistant(&AssistantSpec {
                name: self.assistant.name.clone(),
                model: self.assistant.model.clone(),
                instructions: self.assistant.instructions.clone(),
                vector_store_id: vector_store.id.clone(),
            })
            .await?;

        Ok(AssistantRecord {
            assistant_id: assistant.id,
            vector_store_id: vector_store.id,
            file_ids,
            fingerprint,
            provisioned_at: Utc::now(),
        })
    }

    /// Upload every readable document. Documents the service rejects are
    /// reported and skipped; transport failures abort.
    async fn upload_documents(
        &self,
        scan: &CorpusScan,
        notices: &mut Vec<Notice>,
    ) -> Result<Vec<String>, ProvisionError> {
        let mut file_ids = Vec::with_capacity(scan.documents.len());

        for doc in &scan.documents {
            let upload = FileUpload {
                file_name: doc.file_name(),
                bytes: &doc.bytes,
            };
            match self.service.upload_file(upload).await {
                Ok(file) => {
                    info!(document = %doc.id, file = %file.id, "uploaded document");
                    file_ids.push(file.id);
                }
                Err(e @ RemoteError::Api { .. }) => {
                    warn!(document = %doc.id, error = %e, "upload rejected");
                    notices.push(Notice::warning(format!(
                        "Document '{}' could not be uploaded: {}",
                        doc.id, e
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }

        if file_ids.is_empty() {
            return Err(ProvisionError::NothingUploaded {
                attempted: scan.documents.len(),
                unreadable: scan.skipped.len(),
            });
        }
        Ok(file_ids)
    }
}
