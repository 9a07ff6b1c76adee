//! # PPA assistant CLI (`ppa`)
//!
//! ## Usage
//!
//! ```bash
//! ppa --config ./config/ppa.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ppa serve` | Start the chat server |
//! | `ppa provision` | Resolve (and if needed provision) the assistant |
//! | `ppa ask "<question>"` | Ask one question from the terminal |
//! | `ppa history --user <id>` | Print a user's conversation |
//! | `ppa fingerprint` | Print the corpus fingerprint (no network) |
//! | `ppa reset` | Delete all local state |
//!
//! `OPENAI_API_KEY` must be set for every command that talks to the service.
//! Log verbosity follows `RUST_LOG` (default `info`).

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use ppa_assistant::config::{self, Config};
use ppa_assistant::context::AppContext;
use ppa_assistant::fingerprint::scan_corpus;
use ppa_assistant::models::{Notice, NoticeLevel, Role, TurnOutcome, UserId};
use ppa_assistant::server;
use ppa_assistant::state::StateStore;

/// Question-and-answer assistant over the government's multi-year plan (PPA).
#[derive(Parser)]
#[command(name = "ppa", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ppa.toml")]
    config: PathBuf,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the chat server on `[server].bind`.
    Serve,

    /// Resolve the assistant, provisioning a new one if the documents changed
    /// or the recorded objects are gone.
    Provision,

    /// Ask one question and print the answer.
    Ask {
        question: String,

        /// Reuse this user's conversation thread. A new identity is minted otherwise.
        #[arg(long)]
        user: Option<String>,
    },

    /// Print the text messages of a user's conversation, oldest first.
    History {
        #[arg(long)]
        user: String,
    },

    /// Print the per-document digests of the corpus.
    Fingerprint,

    /// Delete the assistant record and every thread record.
    Reset,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Fingerprint => run_fingerprint(&cfg)?,
        Commands::Reset => {
            let removed = StateStore::from_config(&cfg.state).reset()?;
            println!("Removed {} state file(s).", removed);
        }
        Commands::Serve => {
            let ctx = Arc::new(AppContext::from_config(cfg)?);
            server::run_server(ctx).await?;
        }
        Commands::Provision => {
            let ctx = AppContext::from_config(cfg)?;
            let resolved = ctx.resolve_assistant().await?;
            print_notices(&resolved.notices);
            println!("Assistant: {}", resolved.value);
        }
        Commands::Ask { question, user } => {
            let user = match user {
                Some(raw) => UserId::parse(&raw)?,
                None => UserId::generate(),
            };
            let ctx = AppContext::from_config(cfg)?;
            run_ask(&ctx, &question, user).await?;
        }
        Commands::History { user } => {
            let user = UserId::parse(&user)?;
            let ctx = AppContext::from_config(cfg)?;
            let thread = ctx.sessions.resolve_thread(&user).await?;
            print_notices(&thread.notices);
            for message in ctx.sessions.history(&thread.value).await? {
                let who = match message.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                println!("[{}] {}\n", who, message.text);
            }
        }
    }

    Ok(())
}

fn run_fingerprint(cfg: &Config) -> anyhow::Result<()> {
    let scan = scan_corpus(&cfg.corpus)?;
    for (id, digest) in scan.fingerprint().iter() {
        println!("{}  {}", digest, id);
    }
    for skipped in &scan.skipped {
        eprintln!("skipped {}: {}", skipped.id, skipped.reason);
    }
    Ok(())
}

async fn run_ask(ctx: &AppContext, question: &str, user: UserId) -> anyhow::Result<()> {
    let assistant = ctx.resolve_assistant().await?;
    print_notices(&assistant.notices);
    let thread = ctx.sessions.resolve_thread(&user).await?;
    print_notices(&thread.notices);

    let outcome = ctx
        .turns
        .execute_turn(&assistant.value, &thread.value, question)
        .await
        .context("Failed to ask the assistant")?;

    match outcome {
        TurnOutcome::Answered { answer } => println!("{}", answer),
        TurnOutcome::Failed { diagnostic } => {
            anyhow::bail!("Failed to generate an answer: {}", diagnostic)
        }
        TurnOutcome::ActionRequired => {
            anyhow::bail!("The assistant requires an action; tool calls are not supported")
        }
    }
    eprintln!("(user: {})", user);
    Ok(())
}

fn print_notices(notices: &[Notice]) {
    for notice in notices {
        let tag = match notice.level {
            NoticeLevel::Info => "info",
            NoticeLevel::Warning => "warning",
        };
        eprintln!("[{}] {}", tag, notice.message);
    }
}
