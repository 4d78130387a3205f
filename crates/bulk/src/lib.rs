//! Bulk operation coordinator for the Verity fabric controller.
//!
//! Callers submit per-resource writes through a [`Coordinator`]. Writes are
//! queued per [`ResourceKind`], folded when they target the same resource,
//! and flushed after a quiet period as one HTTP batch per kind and operation
//! type. Each caller gets an [`OpId`] it can wait on for its own item's result.

/// Single-flight response cache for collection reads.
pub mod cache;
/// HTTP adapter: transport, session-token authentication and batch calls.
pub mod client;
pub mod config;
pub mod coordinator;
mod error;
/// Batch executor draining the queues.
pub mod executor;
/// Resource kinds, operation types and the endpoint registry.
pub mod kind;
/// Per-kind operation queues and folding rules.
pub mod queue;
pub mod reader;
pub mod recent;
/// Operation ids and their completion futures.
pub mod registry;
pub mod responses;

pub use self::client::{ApiClient, BatchApi, Credentials, ItemResults, ReqwestTransport, Transport};
pub use self::config::Config;
pub use self::coordinator::Coordinator;
pub use self::error::{ConfigError, Error, Result};
pub use self::executor::FlushReport;
pub use self::kind::{KindRegistry, KindSpec, OpSet, OpType, ResourceKind};
pub use self::reader::ReadOutcome;
pub use self::registry::{OpId, OpState};
