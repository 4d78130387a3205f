//! Operation registry: id → completion signal, with bounded retention after
//! resolution so late waiters still observe the result.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::kind::{OpType, ResourceKind};
use crate::{Error, Result};

/// Caller-visible operation id, rendered as `{kind}-{name}-{op}-{uuid}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(Arc<str>);

impl OpId {
	pub(crate) fn generate(kind: ResourceKind, name: &str, op: OpType) -> Self {
		Self(format!("{kind}-{name}-{op}-{}", Uuid::new_v4()).into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for OpId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for OpId {
	fn from(value: &str) -> Self {
		Self(value.into())
	}
}

/// Lifecycle of one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpState {
	Pending,
	Executing,
	Succeeded,
	Failed(Error),
	/// Superseded by folding or discarded at shutdown.
	Cancelled,
}

impl OpState {
	pub fn is_terminal(&self) -> bool {
		matches!(self, Self::Succeeded | Self::Failed(_) | Self::Cancelled)
	}

	fn outcome(&self) -> Option<Result<()>> {
		match self {
			Self::Pending | Self::Executing => None,
			Self::Succeeded => Some(Ok(())),
			Self::Failed(err) => Some(Err(err.clone())),
			Self::Cancelled => Some(Err(Error::Cancelled)),
		}
	}

	fn from_outcome(outcome: Result<()>) -> Self {
		match outcome {
			Ok(()) => Self::Succeeded,
			Err(Error::Cancelled) => Self::Cancelled,
			Err(err) => Self::Failed(err),
		}
	}
}

struct Entry {
	kind: ResourceKind,
	op: OpType,
	name: String,
	created_at: Instant,
	resolved_at: Option<Instant>,
	state: watch::Sender<OpState>,
}

impl Entry {
	fn expired(&self, now: Instant, retention: Duration) -> bool {
		self.resolved_at.is_some_and(|at| now.saturating_duration_since(at) > retention)
	}
}

/// Concurrent map of live and recently resolved operations.
///
/// Expired entries are invisible immediately and swept from `register` at
/// most once per half retention period.
pub struct OperationRegistry {
	entries: RwLock<HashMap<OpId, Entry>>,
	retention: Duration,
	pruned_at: Mutex<Instant>,
}

impl OperationRegistry {
	pub fn new(retention: Duration) -> Self {
		Self {
			entries: RwLock::new(HashMap::new()),
			retention,
			pruned_at: Mutex::new(Instant::now()),
		}
	}

	pub fn register(&self, id: OpId, kind: ResourceKind, op: OpType, name: &str) {
		let now = Instant::now();
		let prune = {
			let mut pruned_at = self.pruned_at.lock();
			let due = now.saturating_duration_since(*pruned_at) >= self.retention / 2;
			if due {
				*pruned_at = now;
			}
			due
		};

		let mut entries = self.entries.write();
		if prune {
			let before = entries.len();
			entries.retain(|_, entry| !entry.expired(now, self.retention));
			tracing::trace!(removed = before - entries.len(), "bulk.registry.prune");
		}
		let (state, _) = watch::channel(OpState::Pending);
		entries.insert(
			id,
			Entry {
				kind,
				op,
				name: name.to_string(),
				created_at: now,
				resolved_at: None,
				state,
			},
		);
	}

	/// Drops an entry that never reached a queue.
	pub(crate) fn forget(&self, id: &OpId) {
		self.entries.write().remove(id);
	}

	pub(crate) fn mark(&self, ids: &[OpId], to: OpState) {
		debug_assert!(!to.is_terminal());
		let entries = self.entries.read();
		for id in ids {
			if let Some(entry) = entries.get(id) {
				entry.state.send_if_modified(|state| {
					if state.is_terminal() || *state == to {
						return false;
					}
					*state = to.clone();
					true
				});
			}
		}
	}

	/// Resolves an operation. Returns false if it was unknown or already terminal.
	pub fn resolve(&self, id: &OpId, outcome: Result<()>) -> bool {
		let mut entries = self.entries.write();
		let Some(entry) = entries.get_mut(id) else {
			tracing::warn!(op_id = %id, "bulk.registry.resolve_unknown");
			return false;
		};
		if entry.state.borrow().is_terminal() {
			tracing::warn!(op_id = %id, "bulk.registry.double_resolve");
			return false;
		}
		let state = OpState::from_outcome(outcome);
		tracing::trace!(op_id = %id, kind = %entry.kind, op = %entry.op, name = %entry.name, ?state, "bulk.registry.resolve");
		entry.resolved_at = Some(Instant::now());
		entry.state.send_replace(state);
		true
	}

	pub fn state(&self, id: &OpId) -> Option<OpState> {
		let entries = self.entries.read();
		let entry = entries.get(id).filter(|e| !e.expired(Instant::now(), self.retention))?;
		Some(entry.state.borrow().clone())
	}

	/// Waits for the operation to reach a terminal state.
	pub async fn wait_for(&self, id: &OpId, timeout: Duration, cancel: &CancellationToken) -> Result<()> {
		let mut rx = {
			let entries = self.entries.read();
			entries
				.get(id)
				.filter(|e| !e.expired(Instant::now(), self.retention))
				.map(|e| e.state.subscribe())
				.ok_or_else(|| Error::NotFound(id.clone()))?
		};

		let wait = async move {
			loop {
				let outcome = rx.borrow_and_update().outcome();
				if let Some(outcome) = outcome {
					return outcome;
				}
				if rx.changed().await.is_err() {
					return Err(Error::Cancelled);
				}
			}
		};

		tokio::select! {
			outcome = tokio::time::timeout(timeout, wait) => outcome.unwrap_or(Err(Error::Timeout)),
			_ = cancel.cancelled() => Err(Error::Cancelled),
		}
	}

	/// Ids of every operation that has not reached a terminal state.
	pub(crate) fn unresolved(&self) -> Vec<OpId> {
		self.entries
			.read()
			.iter()
			.filter(|(_, e)| !e.state.borrow().is_terminal())
			.map(|(id, _)| id.clone())
			.collect()
	}

	/// Age of an entry since registration.
	pub fn age(&self, id: &OpId) -> Option<Duration> {
		self.entries.read().get(id).map(|e| e.created_at.elapsed())
	}

	pub fn len(&self) -> usize {
		self.entries.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.read().is_empty()
	}
}
