use std::path::PathBuf;

use crate::kind::{OpType, ResourceKind};
use crate::registry::OpId;

/// A convenient type alias for `Result` with `E` = [`enum@crate::Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors delivered to operation callers.
///
/// Cloneable because a single batch-level failure resolves every future in
/// that batch with the same value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// Authentication failed or the controller returned no token.
	#[error("authentication failed: {0}")]
	Auth(String),
	/// Non-per-item HTTP failure; applies to every item of the batch.
	#[error("HTTP {status}: {body}")]
	Http { status: u16, body: String },
	/// The request never produced an HTTP response.
	#[error("transport error: {0}")]
	Transport(String),
	/// Item-specific failure reported by the controller.
	#[error("item rejected with status {status}: {message}")]
	PerItem { status: u16, message: String },
	/// HTTP or wait deadline exceeded.
	#[error("timed out")]
	Timeout,
	/// Superseded by a later submission, or the coordinator shut down.
	#[error("operation cancelled")]
	Cancelled,
	/// Submission after a pending delete of the same resource.
	#[error("{kind} {name:?} already has a pending delete")]
	ConflictDeleted { kind: ResourceKind, name: String },
	/// Unknown or expired operation id.
	#[error("operation {0} not found")]
	NotFound(OpId),
	/// The kind's queue reached its slot limit.
	#[error("{kind} queue is full ({limit} pending resources)")]
	QueueFull { kind: ResourceKind, limit: usize },
	/// The kind does not accept this operation type.
	#[error("{op} is not supported for {kind}")]
	Unsupported { kind: ResourceKind, op: OpType },
	/// The kind is not present in the coordinator's registry.
	#[error("{0} is not registered")]
	UnknownKind(ResourceKind),
	/// The controller replied with an undecodable body.
	#[error("decode failed: {0}")]
	Decode(String),
	/// The coordinator no longer accepts work.
	#[error("coordinator is shut down")]
	ShutDown,
}

impl Error {
	/// Returns the HTTP status carried by this error, if any.
	pub fn status(&self) -> Option<u16> {
		match self {
			Self::Http { status, .. } | Self::PerItem { status, .. } => Some(*status),
			_ => None,
		}
	}
}

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to read {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("invalid config: {0}")]
	Parse(#[from] toml::de::Error),
	#[error("base_uri {0:?} must start with http:// or https://")]
	InvalidUri(String),
	#[error("{0} is required")]
	Missing(&'static str),
	#[error("{field} must be greater than zero")]
	Zero { field: &'static str },
}
