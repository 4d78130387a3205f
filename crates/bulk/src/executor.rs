//! Batch executor: drains the queues and turns them into per-kind HTTP batches.

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::{BatchApi, ItemResults};
use crate::config::Config;
use crate::kind::{KindRegistry, KindSpec, OpType, ResourceKind};
use crate::queue::{KindQueue, Queues, Slot};
use crate::recent::{Execution, RecentLog};
use crate::registry::{OpState, OperationRegistry};
use crate::responses::ResponseStore;
use crate::{Error, Result};

/// Invalidation hook run with a kind's cache key after each successful batch.
pub type Invalidate = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
	pub max_batch_size: usize,
	pub max_delete_batch_size: usize,
	/// Delay before reading back auto-generated fields.
	pub auto_gen_settle: Duration,
}

impl Default for BatchLimits {
	fn default() -> Self {
		Self::from_config(&Config::default())
	}
}

impl BatchLimits {
	pub fn from_config(config: &Config) -> Self {
		Self {
			max_batch_size: config.max_batch_size,
			max_delete_batch_size: config.max_delete_batch_size,
			auto_gen_settle: config.auto_gen_settle(),
		}
	}

	fn for_op(&self, op: OpType) -> usize {
		match op {
			OpType::Delete => self.max_delete_batch_size,
			OpType::Put | OpType::Patch => self.max_batch_size,
		}
		.max(1)
	}
}

/// State the executor mutates, shared with the coordinator.
pub struct Shared {
	pub kinds: Arc<KindRegistry>,
	pub queues: Arc<Queues>,
	pub registry: Arc<OperationRegistry>,
	pub recent: Arc<RecentLog>,
	pub responses: Arc<ResponseStore>,
}

/// Summary of one flush.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
	/// HTTP batch calls issued.
	pub batches: usize,
	/// Resources whose batch result was success.
	pub succeeded: usize,
	pub failed: usize,
	/// Operation ids returned to the queue by cancellation.
	pub restored: usize,
	/// Kinds drained, in processing order.
	pub kinds: Vec<ResourceKind>,
	pub cancelled: bool,
}

pub struct BatchExecutor {
	api: Arc<dyn BatchApi>,
	shared: Arc<Shared>,
	invalidate: Invalidate,
	limits: BatchLimits,
	flush_lock: tokio::sync::Mutex<()>,
	executing: parking_lot::Mutex<HashSet<ResourceKind>>,
}

impl BatchExecutor {
	pub fn new(api: Arc<dyn BatchApi>, shared: Arc<Shared>, invalidate: Invalidate, limits: BatchLimits) -> Self {
		Self {
			api,
			shared,
			invalidate,
			limits,
			flush_lock: tokio::sync::Mutex::new(()),
			executing: parking_lot::Mutex::new(HashSet::new()),
		}
	}

	/// True while a flush holds drained work for `kind`.
	pub fn is_executing(&self, kind: ResourceKind) -> bool {
		self.executing.lock().contains(&kind)
	}

	/// Waits for any running flush to finish.
	pub async fn quiesce(&self) {
		drop(self.flush_lock.lock().await);
	}

	/// Drains every queue and sends its batches.
	///
	/// Flushes are serialized. Cancellation before a batch is sent returns it
	/// (and everything after it) to the queue; cancellation while a batch is in
	/// flight lets the request finish, discards its result and requeues it.
	pub async fn flush(&self, cancel: &CancellationToken) -> FlushReport {
		let _flush = self.flush_lock.lock().await;
		let mut report = FlushReport::default();
		if cancel.is_cancelled() {
			report.cancelled = true;
			return report;
		}

		let snapshot = self.shared.queues.take_all();
		if snapshot.is_empty() {
			return report;
		}
		for (kind, pending) in &snapshot {
			self.shared.registry.mark(&pending.ids(), OpState::Executing);
			self.executing.lock().insert(*kind);
		}
		tracing::debug!(kinds = snapshot.len(), "bulk.flush.start");

		for (kind, pending) in snapshot {
			let leftover = if report.cancelled {
				pending
			} else {
				report.kinds.push(kind);
				self.flush_kind(kind, pending, cancel, &mut report).await
			};
			self.restore(kind, leftover, &mut report);
			self.executing.lock().remove(&kind);
		}

		tracing::debug!(
			batches = report.batches,
			succeeded = report.succeeded,
			failed = report.failed,
			restored = report.restored,
			cancelled = report.cancelled,
			"bulk.flush.done"
		);
		report
	}

	async fn flush_kind(&self, kind: ResourceKind, mut pending: KindQueue, cancel: &CancellationToken, report: &mut FlushReport) -> KindQueue {
		let spec = match self.shared.kinds.get(kind) {
			Ok(spec) => spec.clone(),
			Err(err) => {
				for id in pending.ids() {
					self.shared.registry.resolve(&id, Err(err.clone()));
				}
				return KindQueue::default();
			}
		};

		let mut leftover = KindQueue::default();
		for op in OpType::DRAIN_ORDER {
			let section = pending.take(op);
			if section.is_empty() {
				continue;
			}
			for chunk in chunks(section, self.limits.for_op(op)) {
				if report.cancelled || cancel.is_cancelled() {
					report.cancelled = true;
					leftover.extend_section(op, chunk);
					continue;
				}

				report.batches += 1;
				let outcome = self.dispatch(&spec, op, &chunk).await;
				if cancel.is_cancelled() {
					tracing::debug!(kind = %kind, op = %op, count = chunk.len(), "bulk.batch.discarded");
					report.cancelled = true;
					leftover.extend_section(op, chunk);
					continue;
				}
				self.apply(&spec, op, chunk, outcome, cancel, report).await;
			}
		}
		leftover
	}

	async fn dispatch(&self, spec: &KindSpec, op: OpType, chunk: &IndexMap<String, Slot>) -> Result<ItemResults> {
		tracing::debug!(kind = %spec.kind, op = %op, count = chunk.len(), "bulk.batch.dispatch");
		match op {
			OpType::Delete => {
				let names: Vec<String> = chunk.keys().cloned().collect();
				self.api.delete_batch(spec, &names).await
			}
			OpType::Put => self.api.put_batch(spec, &payloads(chunk)).await,
			OpType::Patch => self.api.patch_batch(spec, &payloads(chunk)).await,
		}
	}

	/// Records, invalidates and only then releases the batch's futures.
	async fn apply(&self, spec: &KindSpec, op: OpType, chunk: IndexMap<String, Slot>, outcome: Result<ItemResults>, cancel: &CancellationToken, report: &mut FlushReport) {
		let kind = spec.kind;
		let results: Vec<(String, Slot, Result<()>)> = match outcome {
			Err(err) => {
				tracing::warn!(kind = %kind, op = %op, count = chunk.len(), error = %err, "bulk.batch.failed");
				chunk.into_iter().map(|(name, slot)| (name, slot, Err(err.clone()))).collect()
			}
			Ok(mut items) => chunk
				.into_iter()
				.map(|(name, slot)| {
					let outcome = items.shift_remove(&name).unwrap_or_else(|| Err(Error::Decode(format!("no result for {name:?}"))));
					if let Err(err) = &outcome {
						tracing::warn!(kind = %kind, op = %op, name = %name, error = %err, "bulk.item.failed");
					}
					(name, slot, outcome)
				})
				.collect(),
		};

		let succeeded = results.iter().filter(|(_, _, r)| r.is_ok()).count();
		let failed = results.len() - succeeded;
		report.succeeded += succeeded;
		report.failed += failed;
		self.shared.recent.record(
			kind,
			Execution {
				at: Instant::now(),
				op,
				succeeded,
				failed,
			},
		);

		if succeeded > 0 {
			(self.invalidate)(&spec.cache_key);
			match op {
				OpType::Delete => {
					for (name, _, _) in results.iter().filter(|(_, _, r)| r.is_ok()) {
						self.shared.responses.remove(kind, name);
					}
				}
				OpType::Put | OpType::Patch if spec.auto_generated => self.capture_generated(spec, cancel).await,
				OpType::Put | OpType::Patch => {}
			}
		}

		for (_, slot, outcome) in results {
			for id in &slot.ids {
				self.shared.registry.resolve(id, outcome.clone());
			}
		}
	}

	/// Reads the kind back so fields the controller assigned become visible
	/// through [`ResponseStore`]. Failures are logged only.
	async fn capture_generated(&self, spec: &KindSpec, cancel: &CancellationToken) {
		if !self.limits.auto_gen_settle.is_zero() {
			tokio::select! {
				_ = tokio::time::sleep(self.limits.auto_gen_settle) => {}
				_ = cancel.cancelled() => return,
			}
		}
		match self.api.get(spec).await {
			Ok(body) => {
				let stored = self.shared.responses.store_collection(spec.kind, body.get(&spec.read_field).unwrap_or(&Value::Null));
				tracing::debug!(kind = %spec.kind, stored, "bulk.autogen.captured");
			}
			Err(err) => tracing::warn!(kind = %spec.kind, error = %err, "bulk.autogen.refresh_failed"),
		}
	}

	fn restore(&self, kind: ResourceKind, leftover: KindQueue, report: &mut FlushReport) {
		if leftover.is_empty() {
			return;
		}
		let ids = leftover.ids();
		report.restored += ids.len();
		self.shared.registry.mark(&ids, OpState::Pending);
		for (id, err) in self.shared.queues.restore(kind, leftover) {
			self.shared.registry.resolve(&id, Err(err));
		}
		tracing::debug!(kind = %kind, restored = ids.len(), "bulk.flush.restored");
	}
}

fn payloads(chunk: &IndexMap<String, Slot>) -> IndexMap<String, Value> {
	chunk.iter().map(|(name, slot)| (name.clone(), slot.payload.clone())).collect()
}

/// Splits a section into insertion-ordered chunks of at most `size` slots.
fn chunks(section: IndexMap<String, Slot>, size: usize) -> Vec<IndexMap<String, Slot>> {
	let mut chunks = Vec::with_capacity(section.len().div_ceil(size));
	let mut current = IndexMap::with_capacity(size.min(section.len()));
	for (name, slot) in section {
		current.insert(name, slot);
		if current.len() == size {
			chunks.push(mem::take(&mut current));
		}
	}
	if !current.is_empty() {
		chunks.push(current);
	}
	chunks
}
