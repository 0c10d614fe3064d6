//! # askbridge
//!
//! Out-of-process bridge to an AI agent worker.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Bridge::call (host code)                │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [ask only]
//! ┌─────────────────────────────────────────────────────────┐
//! │      ResponseCache (TTL)  →  AdmissionQueue (FIFO)       │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [dispatch]
//! ┌─────────────────────────────────────────────────────────┐
//! │   WorkerSupervisor → WorkerClient (NDJSON multiplexer)   │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [worker path broken]
//! ┌─────────────────────────────────────────────────────────┐
//! │          FallbackSpawner (one process per call)          │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Every path updates [`metrics::BridgeStats`] and records latency samples.

pub mod bridge;
pub mod cache;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod worker;

pub use bridge::{Bridge, BridgeHealth, QueueHealth, RequestExecutor};
pub use config::Settings;
pub use worker::{
    AskRequest, BridgeError, BridgeRequest, BridgeResult, DetailMode, HistoryTurn,
    TrainRewriteRequest,
};
