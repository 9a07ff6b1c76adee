//! End-to-end provisioning, session and turn scenarios against the in-memory service.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use ppa_assistant::config::{Config, CorpusConfig, PollingConfig, StateConfig};
use ppa_assistant::context::AppContext;
use ppa_assistant::models::{Role, TurnOutcome, UserId};
use ppa_assistant::remote::memory::{InMemoryService, RunScript};
use ppa_assistant::remote::{BatchStatus, ContentBlock, RunStatus};
use tempfile::TempDir;

struct Harness {
    tmp: TempDir,
    service: Arc<InMemoryService>,
    ctx: AppContext,
}

impl Harness {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("PDF")).unwrap();
        fs::write(tmp.path().join("PDF/documento_ppa.pdf"), b"PPA 2024-2027").unwrap();

        let service = Arc::new(InMemoryService::new());
        let ctx = AppContext::new(config(&tmp), service.clone());
        Self { tmp, service, ctx }
    }

    /// A second context over the same state directory and remote service,
    /// as after a process restart.
    fn restart(&self) -> AppContext {
        AppContext::new(config(&self.tmp), self.service.clone())
    }

    fn assistant_config(&self) -> PathBuf {
        self.tmp.path().join("data/assistant_config.json")
    }

    fn record(&self) -> serde_json::Value {
        serde_json::from_slice(&fs::read(self.assistant_config()).unwrap()).unwrap()
    }
}

fn config(tmp: &TempDir) -> Config {
    Config {
        corpus: CorpusConfig {
            root: tmp.path().join("PDF"),
            include_globs: vec!["**/*.pdf".to_string()],
            exclude_globs: vec![],
            follow_symlinks: false,
        },
        state: StateConfig {
            dir: tmp.path().join("data"),
            ..StateConfig::default()
        },
        assistant: Default::default(),
        openai: Default::default(),
        polling: PollingConfig {
            interval_ms: 1,
            ..PollingConfig::default()
        },
        server: Default::default(),
    }
}

#[tokio::test]
async fn test_fresh_provisioning_persists_record() {
    let h = Harness::new();

    let resolved = h.ctx.resolve_assistant().await.unwrap();

    let record = h.record();
    assert_eq!(record["assistant_id"], resolved.value.as_str());
    assert!(record["vector_store_id"].as_str().unwrap().starts_with("vs_"));
    assert_eq!(record["file_ids"].as_array().unwrap().len(), 1);
    assert!(record["fingerprint"]["documento_ppa.pdf"].is_string());

    let counts = h.service.counts();
    assert_eq!(counts.uploads, 1);
    assert_eq!(counts.vector_stores, 1);
    assert_eq!(counts.file_batches, 1);
    assert_eq!(counts.assistants, 1);
}

#[tokio::test]
async fn test_second_resolution_makes_no_mutations() {
    let h = Harness::new();
    let first = h.ctx.resolve_assistant().await.unwrap();
    let before = h.service.counts();

    let again = h.restart().resolve_assistant().await.unwrap();

    assert_eq!(first.value, again.value);
    assert!(again.notices.is_empty());
    assert_eq!(h.service.counts().mutations(), before.mutations());
}

#[tokio::test]
async fn test_concurrent_resolutions_provision_once() {
    let h = Harness::new();
    h.service
        .script_batch(vec![BatchStatus::InProgress, BatchStatus::Completed]);
    h.service
        .script_batch(vec![BatchStatus::InProgress, BatchStatus::Completed]);

    let (a, b) = tokio::join!(h.ctx.resolve_assistant(), h.ctx.resolve_assistant());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.value, b.value);
    assert_eq!(h.record()["assistant_id"], a.value.as_str());
    let counts = h.service.counts();
    assert_eq!(counts.uploads, 1);
    assert_eq!(counts.vector_stores, 1);
    assert_eq!(counts.file_batches, 1);
    assert_eq!(counts.assistants, 1);
}

#[tokio::test]
async fn test_content_change_reprovisions() {
    let h = Harness::new();
    let first = h.ctx.resolve_assistant().await.unwrap();
    let old_digest = h.record()["fingerprint"]["documento_ppa.pdf"].clone();

    fs::write(h.tmp.path().join("PDF/documento_ppa.pdf"), b"PPA revisado").unwrap();
    let second = h.restart().resolve_assistant().await.unwrap();

    assert_ne!(first.value, second.value);
    assert_ne!(h.record()["fingerprint"]["documento_ppa.pdf"], old_digest);
    assert_eq!(h.service.counts().assistants, 2);
}

#[tokio::test]
async fn test_added_document_reprovisions() {
    let h = Harness::new();
    h.ctx.resolve_assistant().await.unwrap();

    fs::write(h.tmp.path().join("PDF/anexo.pdf"), b"anexo").unwrap();
    h.restart().resolve_assistant().await.unwrap();

    assert_eq!(h.record()["file_ids"].as_array().unwrap().len(), 2);
    assert_eq!(h.service.counts().assistants, 2);
}

#[tokio::test]
async fn test_corrupt_record_is_replaced() {
    let h = Harness::new();
    fs::create_dir_all(h.tmp.path().join("data")).unwrap();
    fs::write(h.assistant_config(), "{ this is not json").unwrap();

    let resolved = h.ctx.resolve_assistant().await.unwrap();

    assert!(resolved
        .notices
        .iter()
        .any(|n| n.message.contains("corrupt")));
    assert_eq!(h.record()["assistant_id"], resolved.value.as_str());
}

#[tokio::test]
async fn test_missing_vector_store_cascades() {
    let h = Harness::new();
    let first = h.ctx.resolve_assistant().await.unwrap();
    let vector_store = h.record()["vector_store_id"].as_str().unwrap().to_string();

    h.service.delete_vector_store(&vector_store);
    let second = h.restart().resolve_assistant().await.unwrap();

    assert_ne!(first.value, second.value);
    assert_ne!(h.record()["vector_store_id"], vector_store.as_str());
    let counts = h.service.counts();
    assert_eq!(counts.uploads, 2);
    assert_eq!(counts.vector_stores, 2);
    assert_eq!(counts.assistants, 2);
}

#[tokio::test]
async fn test_missing_assistant_cascades() {
    let h = Harness::new();
    let first = h.ctx.resolve_assistant().await.unwrap();

    h.service.delete_assistant(first.value.as_str());
    let second = h.restart().resolve_assistant().await.unwrap();

    assert_ne!(first.value, second.value);
    assert_eq!(h.service.counts().vector_stores, 2);
}

#[tokio::test]
async fn test_thread_survives_restart() {
    let h = Harness::new();
    let user = UserId::generate();
    let first = h.ctx.sessions.resolve_thread(&user).await.unwrap();

    let restarted = h.restart();
    let second = restarted.sessions.resolve_thread(&user).await.unwrap();

    assert_eq!(first.value, second.value);
    assert_eq!(h.service.counts().threads, 1);
}

#[tokio::test]
async fn test_users_get_separate_threads() {
    let h = Harness::new();
    let (_, alice) = h.ctx.sessions.ensure_user_identity(None);
    let (_, bob) = h.ctx.sessions.ensure_user_identity(None);

    let a = h.ctx.sessions.resolve_thread(&alice).await.unwrap();
    let b = h.ctx.sessions.resolve_thread(&bob).await.unwrap();

    assert_ne!(a.value, b.value);
    assert!(h
        .tmp
        .path()
        .join(format!("data/threads/{}.json", alice))
        .exists());
}

#[tokio::test]
async fn test_pending_runs_end_with_latest_text() {
    let h = Harness::new();
    h.service.script_run(RunScript::completes_with(
        vec![RunStatus::InProgress, RunStatus::InProgress, RunStatus::Completed],
        vec![
            ContentBlock::Other("image_file".to_string()),
            ContentBlock::Text("O PPA tem 88 programas finalísticos.".to_string()),
        ],
    ));

    let assistant = h.ctx.resolve_assistant().await.unwrap().value;
    let thread = h
        .ctx
        .sessions
        .resolve_thread(&UserId::generate())
        .await
        .unwrap()
        .value;
    let outcome = h
        .ctx
        .turns
        .execute_turn(&assistant, &thread, "Quantos programas?")
        .await
        .unwrap();

    assert_eq!(
        outcome,
        TurnOutcome::Answered {
            answer: "O PPA tem 88 programas finalísticos.".to_string()
        }
    );
    let history = h.ctx.sessions.history(&thread).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].role, Role::Assistant);
}

#[tokio::test]
async fn test_failed_run_leaves_only_the_question() {
    let h = Harness::new();
    h.service.script_run(RunScript::fails("server_error"));

    let assistant = h.ctx.resolve_assistant().await.unwrap().value;
    let thread = h
        .ctx
        .sessions
        .resolve_thread(&UserId::generate())
        .await
        .unwrap()
        .value;
    let outcome = h
        .ctx
        .turns
        .execute_turn(&assistant, &thread, "Quantos programas?")
        .await
        .unwrap();

    assert_eq!(
        outcome,
        TurnOutcome::Failed {
            diagnostic: "server_error".to_string()
        }
    );
    let history = h.ctx.sessions.history(&thread).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].text, "Quantos programas?");
}

#[tokio::test]
async fn test_reset_forgets_everything() {
    let h = Harness::new();
    let user = UserId::generate();
    let first = h.ctx.resolve_assistant().await.unwrap();
    let thread = h.ctx.sessions.resolve_thread(&user).await.unwrap();

    assert_eq!(h.ctx.reset().await.unwrap(), 2);

    let assistant = h.ctx.assistant().await.unwrap();
    let new_thread = h.ctx.sessions.resolve_thread(&user).await.unwrap();
    assert_ne!(first.value, assistant.value);
    assert_ne!(thread.value, new_thread.value);
}
