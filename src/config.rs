//! TOML configuration parsing and validation.
//!
//! Only `[corpus]` is mandatory; every other section falls back to the
//! defaults below. The OpenAI API key is never read from this file, see
//! [`OpenAIConfig::api_key`].

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::poll::PollPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub openai: OpenAIConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    /// A directory to walk, or a single document.
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.pdf".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_assistant_file")]
    pub assistant_file: String,
    #[serde(default = "default_threads_dir")]
    pub threads_dir: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
            assistant_file: default_assistant_file(),
            threads_dir: default_threads_dir(),
        }
    }
}

impl StateConfig {
    pub fn assistant_path(&self) -> PathBuf {
        self.dir.join(&self.assistant_file)
    }

    pub fn threads_path(&self) -> PathBuf {
        self.dir.join(&self.threads_dir)
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_assistant_file() -> String {
    "assistant_config.json".to_string()
}
fn default_threads_dir() -> String {
    "threads".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssistantConfig {
    #[serde(default = "default_assistant_name")]
    pub name: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_instructions")]
    pub instructions: String,
    #[serde(default = "default_vector_store_name")]
    pub vector_store_name: String,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            name: default_assistant_name(),
            model: default_model(),
            instructions: default_instructions(),
            vector_store_name: default_vector_store_name(),
        }
    }
}

fn default_assistant_name() -> String {
    "Assistente do PPA".to_string()
}
fn default_model() -> String {
    "gpt-4-1106-preview".to_string()
}
fn default_instructions() -> String {
    "Você responde perguntas com base no Programa Plurianual (PPA) do governo. \
     Se a informação não estiver no documento, diga que não pode ajudar com base nos seus dados."
        .to_string()
}
fn default_vector_store_name() -> String {
    "VectorStore-PPA".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenAIConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl OpenAIConfig {
    /// Reads `OPENAI_API_KEY` from the environment.
    pub fn api_key(&self) -> Result<String> {
        std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Defaults to `interval_ms` (fixed interval).
    #[serde(default)]
    pub max_interval_ms: Option<u64>,
    #[serde(default = "default_backoff")]
    pub backoff: f64,
    /// No deadline when unset.
    #[serde(default)]
    pub max_wait_secs: Option<u64>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_interval_ms: None,
            backoff: default_backoff(),
            max_wait_secs: None,
        }
    }
}

impl PollingConfig {
    pub fn policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms.unwrap_or(self.interval_ms)),
            backoff: self.backoff,
            deadline: self.max_wait_secs.map(Duration::from_secs),
        }
    }
}

fn default_interval_ms() -> u64 {
    1000
}
fn default_backoff() -> f64 {
    1.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Browser sessions unused for this long are forgotten.
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            session_idle_secs: default_session_idle_secs(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl ServerConfig {
    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }
}

fn default_bind() -> String {
    "127.0.0.1:8501".to_string()
}

fn default_session_idle_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_sessions() -> usize {
    10_000
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate corpus
    if config.corpus.include_globs.is_empty() {
        anyhow::bail!("corpus.include_globs must not be empty");
    }

    // Validate assistant
    if config.assistant.model.trim().is_empty() {
        anyhow::bail!("assistant.model must not be empty");
    }
    if config.assistant.instructions.trim().is_empty() {
        anyhow::bail!("assistant.instructions must not be empty");
    }

    // Validate state
    if config.state.assistant_file.trim().is_empty() || config.state.threads_dir.trim().is_empty()
    {
        anyhow::bail!("state.assistant_file and state.threads_dir must not be empty");
    }

    // Validate polling
    let polling = &config.polling;
    if polling.interval_ms == 0 {
        anyhow::bail!("polling.interval_ms must be > 0");
    }
    if polling.max_interval_ms.is_some_and(|max| max < polling.interval_ms) {
        anyhow::bail!("polling.max_interval_ms must be >= polling.interval_ms");
    }
    if !polling.backoff.is_finite() || polling.backoff < 1.0 {
        anyhow::bail!("polling.backoff must be a finite number >= 1.0");
    }
    if polling.max_wait_secs == Some(0) {
        anyhow::bail!("polling.max_wait_secs must be > 0 when set");
    }

    if config.server.session_idle_secs == 0 || config.server.max_sessions == 0 {
        anyhow::bail!("server.session_idle_secs and server.max_sessions must be > 0");
    }

    if config.openai.timeout_secs == 0 {
        anyhow::bail!("openai.timeout_secs must be > 0");
    }

    Ok(())
}
