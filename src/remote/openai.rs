//! [`RemoteService`] backed by the OpenAI Assistants API (v2).
//!
//! # Retry Strategy
//!
//! Every call is retried with exponential backoff on transient failures:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - Network errors → retry
//! - HTTP 404 → [`RemoteError::NotFound`], never retried
//! - Other 4xx → fail immediately
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Retries live here and nowhere else: the validator and the pollers treat a
//! returned error as final.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    AssistantSpec, BatchStatus, ContentBlock, FileBatch, FileUpload, Message, MessageOrder,
    ObjectRef, RemoteError, RemoteService, Run, RunStatus,
};
use crate::config::OpenAIConfig;
use crate::models::Role;

const PAGE_SIZE: u32 = 100;

pub struct OpenAIService {
    client: Client,
    base_url: String,
    api_key: String,
    max_retries: u32,
}

impl OpenAIService {
    /// Build a client from configuration, reading `OPENAI_API_KEY` from the environment.
    pub fn new(config: &OpenAIConfig) -> anyhow::Result<Self> {
        let api_key = config.api_key()?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &OpenAIConfig, api_key: String) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.base_url, path))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("OpenAI-Beta", "assistants=v2")
    }

    /// Send the request produced by `build` with retry/backoff and decode the JSON body.
    async fn call<T, F>(&self, resource: &str, build: F) -> Result<T, RemoteError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let response = match build().send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!(resource, attempt, error = %e, "request failed, retrying");
                    last_err = Some(RemoteError::Transport(e.to_string()));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return response
                    .json::<T>()
                    .await
                    .map_err(|e| RemoteError::Decode(format!("{}: {}", resource, e)));
            }

            let body = response.text().await.unwrap_or_default();

            if status == StatusCode::NOT_FOUND {
                return Err(RemoteError::NotFound {
                    resource: resource.to_string(),
                });
            }

            let err = RemoteError::Api {
                status: status.as_u16(),
                message: api_error_message(&body),
            };

            // Rate limited or server error: retry
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                tracing::debug!(resource, attempt, status = status.as_u16(), "retryable API error");
                last_err = Some(err);
                continue;
            }

            // Client error (not 429): fail fast
            return Err(err);
        }

        Err(last_err.unwrap_or_else(|| {
            RemoteError::Transport(format!("{}: request failed after retries", resource))
        }))
    }

    async fn get_object(&self, resource: &str, path: &str) -> Result<ObjectRef, RemoteError> {
        let obj: IdResponse = self.call(resource, || self.request(Method::GET, path)).await?;
        Ok(ObjectRef::new(obj.id))
    }

    async fn post_object(
        &self,
        resource: &str,
        path: &str,
        body: Value,
    ) -> Result<ObjectRef, RemoteError> {
        let obj: IdResponse = self
            .call(resource, || self.request(Method::POST, path).json(&body))
            .await?;
        Ok(ObjectRef::new(obj.id))
    }
}

/// Pull `error.message` out of an OpenAI error body, falling back to the raw text.
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}

#[derive(Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Deserialize)]
struct BatchResponse {
    id: String,
    vector_store_id: String,
    status: String,
    #[serde(default)]
    file_counts: Option<FileCounts>,
}

#[derive(Deserialize)]
struct FileCounts {
    #[serde(default)]
    failed: u64,
}

impl From<BatchResponse> for FileBatch {
    fn from(b: BatchResponse) -> Self {
        FileBatch {
            id: b.id,
            vector_store_id: b.vector_store_id,
            status: BatchStatus::parse(&b.status),
            failed_files: b.file_counts.map(|c| c.failed).unwrap_or(0),
        }
    }
}

#[derive(Deserialize)]
struct RunResponse {
    id: String,
    thread_id: String,
    status: String,
    #[serde(default)]
    last_error: Option<LastError>,
}

#[derive(Deserialize)]
struct LastError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl From<RunResponse> for Run {
    fn from(r: RunResponse) -> Self {
        let last_error = r.last_error.and_then(|e| match (e.message, e.code) {
            (Some(message), _) if !message.is_empty() => Some(message),
            (_, Some(code)) => Some(code),
            _ => None,
        });
        Run {
            id: r.id,
            thread_id: r.thread_id,
            status: RunStatus::parse(&r.status),
            last_error,
        }
    }
}

#[derive(Deserialize)]
struct MessageList {
    data: Vec<MessageResponse>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: Option<String>,
}

#[derive(Deserialize)]
struct MessageResponse {
    id: String,
    role: String,
    #[serde(default)]
    content: Vec<Value>,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    created_at: i64,
}

impl TryFrom<MessageResponse> for Message {
    type Error = RemoteError;

    fn try_from(m: MessageResponse) -> Result<Self, Self::Error> {
        let role = match m.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => {
                return Err(RemoteError::Decode(format!(
                    "message {} has unknown role '{}'",
                    m.id, other
                )))
            }
        };
        Ok(Message {
            content: m.content.iter().map(parse_content_block).collect(),
            id: m.id,
            role,
            run_id: m.run_id,
            created_at: m.created_at,
        })
    }
}

/// `{"type": "text", "text": {"value": ...}}` becomes [`ContentBlock::Text`];
/// everything else is kept only by its type name.
fn parse_content_block(block: &Value) -> ContentBlock {
    let kind = block
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("unknown");
    if kind == "text" {
        if let Some(value) = block
            .get("text")
            .and_then(|t| t.get("value"))
            .and_then(|v| v.as_str())
        {
            return ContentBlock::Text(value.to_string());
        }
    }
    ContentBlock::Other(kind.to_string())
}

#[async_trait]
impl RemoteService for OpenAIService {
    async fn upload_file(&self, upload: FileUpload<'_>) -> Result<ObjectRef, RemoteError> {
        let mime = mime_guess::from_path(upload.file_name).first_or_octet_stream();
        let obj: IdResponse = self
            .call("file upload", || {
                let part = reqwest::multipart::Part::bytes(upload.bytes.to_vec())
                    .file_name(upload.file_name.to_string());
                // An unparsable mime only loses the content-type hint
                let part = match part.mime_str(mime.essence_str()) {
                    Ok(part) => part,
                    Err(_) => reqwest::multipart::Part::bytes(upload.bytes.to_vec())
                        .file_name(upload.file_name.to_string()),
                };
                let form = reqwest::multipart::Form::new()
                    .text("purpose", "assistants")
                    .part("file", part);
                // Content-Type is set by reqwest for multipart bodies
                self.request(Method::POST, "files").multipart(form)
            })
            .await?;
        Ok(ObjectRef::new(obj.id))
    }

    async fn retrieve_file(&self, file_id: &str) -> Result<ObjectRef, RemoteError> {
        self.get_object(&format!("file {}", file_id), &format!("files/{}", file_id))
            .await
    }

    async fn create_vector_store(&self, name: &str) -> Result<ObjectRef, RemoteError> {
        self.post_object("vector store", "vector_stores", json!({ "name": name }))
            .await
    }

    async fn retrieve_vector_store(
        &self,
        vector_store_id: &str,
    ) -> Result<ObjectRef, RemoteError> {
        self.get_object(
            &format!("vector store {}", vector_store_id),
            &format!("vector_stores/{}", vector_store_id),
        )
        .await
    }

    async fn create_file_batch(
        &self,
        vector_store_id: &str,
        file_ids: &[String],
    ) -> Result<FileBatch, RemoteError> {
        let path = format!("vector_stores/{}/file_batches", vector_store_id);
        let body = json!({ "file_ids": file_ids });
        let batch: BatchResponse = self
            .call("file batch", || self.request(Method::POST, &path).json(&body))
            .await?;
        Ok(batch.into())
    }

    async fn retrieve_file_batch(
        &self,
        vector_store_id: &str,
        batch_id: &str,
    ) -> Result<FileBatch, RemoteError> {
        let path = format!("vector_stores/{}/file_batches/{}", vector_store_id, batch_id);
        let batch: BatchResponse = self
            .call(&format!("file batch {}", batch_id), || {
                self.request(Method::GET, &path)
            })
            .await?;
        Ok(batch.into())
    }

    async fn create_assistant(&self, spec: &AssistantSpec) -> Result<ObjectRef, RemoteError> {
        let body = json!({
            "name": spec.name,
            "model": spec.model,
            "instructions": spec.instructions,
            "tools": [{ "type": "file_search" }],
            "tool_resources": {
                "file_search": { "vector_store_ids": [spec.vector_store_id] }
            },
        });
        self.post_object("assistant", "assistants", body).await
    }

    async fn retrieve_assistant(&self, assistant_id: &str) -> Result<ObjectRef, RemoteError> {
        self.get_object(
            &format!("assistant {}", assistant_id),
            &format!("assistants/{}", assistant_id),
        )
        .await
    }

    async fn create_thread(&self) -> Result<ObjectRef, RemoteError> {
        self.post_object("thread", "threads", json!({})).await
    }

    async fn retrieve_thread(&self, thread_id: &str) -> Result<ObjectRef, RemoteError> {
        self.get_object(
            &format!("thread {}", thread_id),
            &format!("threads/{}", thread_id),
        )
        .await
    }

    async fn create_message(&self, thread_id: &str, text: &str) -> Result<Message, RemoteError> {
        let path = format!("threads/{}/messages", thread_id);
        let body = json!({ "role": "user", "content": text });
        let msg: MessageResponse = self
            .call(&format!("thread {}", thread_id), || {
                self.request(Method::POST, &path).json(&body)
            })
            .await?;
        msg.try_into()
    }

    async fn list_messages(
        &self,
        thread_id: &str,
        order: MessageOrder,
    ) -> Result<Vec<Message>, RemoteError> {
        let path = format!("threads/{}/messages", thread_id);
        let resource = format!("thread {}", thread_id);
        let mut messages = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let page: MessageList = self
                .call(&resource, || {
                    let mut req = self.request(Method::GET, &path).query(&[
                        ("order", order.as_query().to_string()),
                        ("limit", PAGE_SIZE.to_string()),
                    ]);
                    if let Some(cursor) = &after {
                        req = req.query(&[("after", cursor)]);
                    }
                    req
                })
                .await?;

            for msg in page.data {
                messages.push(Message::try_from(msg)?);
            }

            match (page.has_more, page.last_id) {
                (true, Some(last)) => after = Some(last),
                _ => break,
            }
        }

        Ok(messages)
    }

    async fn create_run(&self, thread_id: &str, assistant_id: &str) -> Result<Run, RemoteError> {
        let path = format!("threads/{}/runs", thread_id);
        let body = json!({ "assistant_id": assistant_id });
        let run: RunResponse = self
            .call(&format!("thread {}", thread_id), || {
                self.request(Method::POST, &path).json(&body)
            })
            .await?;
        Ok(run.into())
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<Run, RemoteError> {
        let path = format!("threads/{}/runs/{}", thread_id, run_id);
        let run: RunResponse = self
            .call(&format!("run {}", run_id), || self.request(Method::GET, &path))
            .await?;
        Ok(run.into())
    }
}
