//! # PPA Assistant
//!
//! A question-and-answer chat front-end over a hosted assistant service that
//! answers questions about the government's multi-year plan (PPA) using
//! retrieval over a corpus of PDF documents.
//!
//! The crate keeps the remote objects it creates (uploaded files, a vector
//! store, an assistant, one conversation thread per user) alive across
//! restarts and re-provisions them only when the documents change or the
//! objects disappear.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌───────────────┐
//! │  Corpus    │──▶│ Provisioner  │──▶│ RemoteService │
//! │ (PDF dir)  │   │ + Validator  │   │ (OpenAI API)  │
//! └────────────┘   └──────┬───────┘   └──────▲────────┘
//!                         │                  │
//!                  ┌──────▼───────┐   ┌──────┴────────┐
//!                  │ StateStore   │◀──│ Sessions +    │
//!                  │ (JSON files) │   │ TurnEngine    │
//!                  └──────────────┘   └──────▲────────┘
//!                                            │
//!                                 ┌──────────┴─────────┐
//!                                 │  CLI / HTTP server │
//!                                 └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Handles, records and outcomes |
//! | [`fingerprint`] | Corpus scanning and per-document digests |
//! | [`remote`] | Remote service trait, OpenAI client, in-memory double |
//! | [`validator`] | Liveness checks for remote objects |
//! | [`poll`] | Polling with interval, backoff and deadline |
//! | [`state`] | Durable local records |
//! | [`provision`] | Assistant resolution and provisioning |
//! | [`session`] | User identities and conversation threads |
//! | [`turn`] | Question/answer exchanges |
//! | [`context`] | Shared application context |
//! | [`server`] | HTTP chat server |

pub mod config;
pub mod context;
pub mod fingerprint;
pub mod models;
pub mod poll;
pub mod provision;
pub mod remote;
pub mod server;
pub mod session;
pub mod state;
pub mod turn;
pub mod validator;
