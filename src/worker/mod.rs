//! Worker process communication.
//!
//! The AI agent runs outside this process. Requests reach it one of two ways:
//!
//! - **Persistent**: one long-lived process started by [`WorkerSupervisor`],
//!   with concurrent calls multiplexed over its stdin/stdout by
//!   [`WorkerClient`] using NDJSON envelopes tagged with request IDs.
//! - **One-shot**: a fresh process per call, run by [`FallbackSpawner`] when
//!   the persistent path is disabled or broken.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       askbridge (Rust + Tokio)                  │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                 WorkerSupervisor / WorkerClient           │  │
//! │  │  - Single-flight start over candidate executables         │  │
//! │  │  - NDJSON protocol over stdin/stdout                      │  │
//! │  │  - Request IDs for concurrent request correlation         │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              │                                   │
//! │               stdin (NDJSON) │ stdout (NDJSON)                  │
//! │                              ▼                                   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              AI agent worker (long-running child process)       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod client;
pub mod codec;
pub mod command;
mod error;
mod fallback;
pub mod normalize;
pub mod protocol;
mod supervisor;

pub use client::{PendingCalls, RequestIdGenerator, WorkerClient, WorkerExit, WorkerInfo};
pub use command::{LaunchSpec, SourceSnapshot};
pub use error::{
    BridgeError, BridgeResult, ErrorKind, FALLBACK_CALL, QUEUE_WAIT, WORKER_CALL,
};
pub use fallback::FallbackSpawner;
pub use protocol::{
    Action, AskRequest, BridgeRequest, DetailMode, HistoryTurn, TrainRewriteRequest,
};
pub use supervisor::WorkerSupervisor;
