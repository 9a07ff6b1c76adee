//! The application context shared by the CLI and the HTTP server.
//!
//! Everything a request needs (configuration, the remote service, the state
//! store and the three managers) is built once here and passed explicitly.
//! The last resolved assistant handle is cached so that asking a question
//! does not re-validate the assistant on every turn.
//!
//! Resolution and reset are single-flight: a caller arriving while another
//! one provisions waits, then finds the fresh record and reuses it.

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::config::Config;
use crate::models::{AssistantHandle, Resolution};
use crate::provision::{AssistantProvisioner, ProvisionError};
use crate::remote::openai::OpenAIService;
use crate::remote::RemoteService;
use crate::session::SessionManager;
use crate::state::{StateError, StateStore};
use crate::turn::TurnEngine;

pub struct AppContext {
    pub config: Arc<Config>,
    pub store: StateStore,
    pub provisioner: AssistantProvisioner,
    pub sessions: SessionManager,
    pub turns: TurnEngine,
    assistant: RwLock<Option<AssistantHandle>>,
    provisioning: Mutex<()>,
}

impl AppContext {
    pub fn new(config: Config, service: Arc<dyn RemoteService>) -> Self {
        let store = StateStore::from_config(&config.state);
        let poll = config.polling.policy();

        Self {
            provisioner: AssistantProvisioner::new(
                service.clone(),
                store.clone(),
                config.corpus.clone(),
                config.assistant.clone(),
                poll.clone(),
            ),
            sessions: SessionManager::new(service.clone(), store.clone())
                .with_limits(config.server.session_idle(), config.server.max_sessions),
            turns: TurnEngine::new(service, poll),
            store,
            config: Arc::new(config),
            assistant: RwLock::new(None),
            provisioning: Mutex::new(()),
        }
    }

    /// Build a context talking to the real OpenAI API.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let service = OpenAIService::new(&config.openai)?;
        Ok(Self::new(config, Arc::new(service)))
    }

    /// Resolve the assistant (validating it remotely) and remember the handle.
    pub async fn resolve_assistant(&self) -> Result<Resolution<AssistantHandle>, ProvisionError> {
        let _flight = self.provisioning.lock().await;
        let resolved = self.provisioner.resolve_assistant().await?;
        *self.assistant.write().await = Some(resolved.value.clone());
        Ok(resolved)
    }

    /// The remembered assistant handle, resolving one if none is cached.
    pub async fn assistant(&self) -> Result<Resolution<AssistantHandle>, ProvisionError> {
        if let Some(handle) = self.assistant.read().await.clone() {
            return Ok(Resolution::new(handle, Vec::new()));
        }
        self.resolve_assistant().await
    }

    /// Delete all durable state and forget the cached assistant handle.
    pub async fn reset(&self) -> Result<usize, StateError> {
        let _flight = self.provisioning.lock().await;
        let mut cached = self.assistant.write().await;
        let removed = self.store.reset()?;
        *cached = None;
        info!(removed, "local state reset");
        Ok(removed)
    }
}
