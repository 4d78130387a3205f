//! Per-kind pending-operation queues with submission-time folding.


use std::mem;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::kind::{OpType, ResourceKind};
use crate::registry::OpId;
use crate::{Error, Result};

/// Pending work for one resource name in one op-type queue.
///
/// Folded submissions share a slot; every id in `ids` resolves with the
/// slot's batch result.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
	pub ids: Vec<OpId>,
	/// Request payload. `Null` for deletes.
	pub payload: Value,
}

impl Slot {
	fn new(id: OpId, payload: Value) -> Self {
		Self { ids: vec![id], payload }
	}
}

/// Shallow JSON merge: top-level fields of `later` overwrite `base`. Non-object
/// payloads are replaced wholesale.
pub fn merge_patch(base: &mut Value, later: Value) {
	match (base, later) {
		(Value::Object(base), Value::Object(later)) => {
			for (key, value) in later {
				base.insert(key, value);
			}
		}
		(base, later) => *base = later,
	}
}

/// Queued slots of one kind, one insertion-ordered map per op type.
///
/// A name has at most one slot per op type, and a name with a pending delete
/// has no put or patch slot.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct KindQueue {
	deletes: IndexMap<String, Slot>,
	puts: IndexMap<String, Slot>,
	patches: IndexMap<String, Slot>,
}

impl KindQueue {
	pub fn section(&self, op: OpType) -> &IndexMap<String, Slot> {
		match op {
			OpType::Delete => &self.deletes,
			OpType::Put => &self.puts,
			OpType::Patch => &self.patches,
		}
	}

	fn section_mut(&mut self, op: OpType) -> &mut IndexMap<String, Slot> {
		match op {
			OpType::Delete => &mut self.deletes,
			OpType::Put => &mut self.puts,
			OpType::Patch => &mut self.patches,
		}
	}

	pub fn slot(&self, op: OpType, name: &str) -> Option<&Slot> {
		self.section(op).get(name)
	}

	/// Number of distinct slots.
	pub fn len(&self) -> usize {
		self.deletes.len() + self.puts.len() + self.patches.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Number of operation ids waiting in this queue.
	pub fn op_count(&self) -> usize {
		OpType::DRAIN_ORDER.iter().flat_map(|op| self.section(*op).values()).map(|s| s.ids.len()).sum()
	}

	pub fn ids(&self) -> Vec<OpId> {
		OpType::DRAIN_ORDER
			.iter()
			.flat_map(|op| self.section(*op).values())
			.flat_map(|s| s.ids.iter().cloned())
			.collect()
	}

	/// Applies one submission. Returns the ids it superseded, which the
	/// caller resolves as cancelled.
	pub fn push(&mut self, kind: ResourceKind, op: OpType, name: &str, id: OpId, payload: Value, limit: usize) -> Result<Vec<OpId>> {
		if self.deletes.contains_key(name) {
			return Err(Error::ConflictDeleted { kind, name: name.to_string() });
		}

		let folds = match op {
			OpType::Delete => self.puts.contains_key(name) || self.patches.contains_key(name),
			OpType::Put | OpType::Patch => self.section(op).contains_key(name),
		};
		if !folds && self.len() >= limit {
			return Err(Error::QueueFull { kind, limit });
		}

		let mut superseded = Vec::new();
		match op {
			OpType::Delete => {
				for slot in [self.puts.shift_remove(name), self.patches.shift_remove(name)].into_iter().flatten() {
					superseded.extend(slot.ids);
				}
				self.deletes.insert(name.to_string(), Slot::new(id, Value::Null));
			}
			OpType::Put => match self.puts.get_mut(name) {
				Some(slot) => {
					slot.payload = payload;
					slot.ids.push(id);
				}
				None => {
					self.puts.insert(name.to_string(), Slot::new(id, payload));
				}
			},
			OpType::Patch => match self.patches.get_mut(name) {
				Some(slot) => {
					merge_patch(&mut slot.payload, payload);
					slot.ids.push(id);
				}
				None => {
					self.patches.insert(name.to_string(), Slot::new(id, payload));
				}
			},
		}
		Ok(superseded)
	}

	/// Removes and returns one op-type section.
	pub fn take(&mut self, op: OpType) -> IndexMap<String, Slot> {
		mem::take(self.section_mut(op))
	}

	/// Appends slots to a section, keeping the existing ones first.
	pub(crate) fn extend_section(&mut self, op: OpType, slots: IndexMap<String, Slot>) {
		self.section_mut(op).extend(slots);
	}

	/// Folds `later` into `self`, treating everything already in `self` as the
	/// earlier submission. Returns ids that can no longer run and the error to
	/// resolve them with.
	pub(crate) fn absorb(&mut self, kind: ResourceKind, later: KindQueue) -> Vec<(OpId, Error)> {
		let mut resolutions = Vec::new();
		let conflict = |name: &str| Error::ConflictDeleted { kind, name: name.to_string() };

		for (name, slot) in later.deletes {
			if self.deletes.contains_key(&name) {
				resolutions.extend(slot.ids.into_iter().map(|id| (id, conflict(&name))));
				continue;
			}
			for cancelled in [self.puts.shift_remove(&name), self.patches.shift_remove(&name)].into_iter().flatten() {
				resolutions.extend(cancelled.ids.into_iter().map(|id| (id, Error::Cancelled)));
			}
			self.deletes.insert(name, slot);
		}

		for (op, section) in [(OpType::Put, later.puts), (OpType::Patch, later.patches)] {
			for (name, slot) in section {
				if self.deletes.contains_key(&name) {
					resolutions.extend(slot.ids.into_iter().map(|id| (id, conflict(&name))));
					continue;
				}
				match self.section_mut(op).get_mut(&name) {
					Some(existing) => {
						match op {
							OpType::Patch => merge_patch(&mut existing.payload, slot.payload),
							_ => existing.payload = slot.payload,
						}
						existing.ids.extend(slot.ids);
					}
					None => {
						self.section_mut(op).insert(name, slot);
					}
				}
			}
		}
		resolutions
	}
}

/// The coordinator's queues, one lock per kind so submissions to different
/// kinds never contend.
pub struct Queues {
	by_kind: IndexMap<ResourceKind, Mutex<KindQueue>>,
	limit: usize,
}

impl Queues {
	pub fn new(kinds: impl IntoIterator<Item = ResourceKind>, limit: usize) -> Self {
		Self {
			by_kind: kinds.into_iter().map(|k| (k, Mutex::new(KindQueue::default()))).collect(),
			limit,
		}
	}

	fn queue(&self, kind: ResourceKind) -> Result<&Mutex<KindQueue>> {
		self.by_kind.get(&kind).ok_or(Error::UnknownKind(kind))
	}

	pub fn push(&self, kind: ResourceKind, op: OpType, name: &str, id: OpId, payload: Value) -> Result<Vec<OpId>> {
		let mut queue = self.queue(kind)?.lock();
		let superseded = queue.push(kind, op, name, id, payload, self.limit)?;
		tracing::debug!(kind = %kind, op = %op, name, slots = queue.len(), superseded = superseded.len(), "bulk.queue.push");
		Ok(superseded)
	}

	/// Swaps out every non-empty queue, leaving them empty.
	pub fn take_all(&self) -> Vec<(ResourceKind, KindQueue)> {
		self.by_kind
			.iter()
			.filter_map(|(kind, queue)| {
				let mut queue = queue.lock();
				(!queue.is_empty()).then(|| (*kind, mem::take(&mut *queue)))
			})
			.collect()
	}

	/// Puts unexecuted work back ahead of anything submitted since it was taken.
	pub fn restore(&self, kind: ResourceKind, earlier: KindQueue) -> Vec<(OpId, Error)> {
		let Ok(queue) = self.queue(kind) else {
			return earlier.ids().into_iter().map(|id| (id, Error::UnknownKind(kind))).collect();
		};
		let mut queue = queue.lock();
		let later = mem::replace(&mut *queue, earlier);
		queue.absorb(kind, later)
	}

	pub fn pending(&self, kind: ResourceKind) -> usize {
		self.by_kind.get(&kind).map_or(0, |q| q.lock().op_count())
	}

	pub fn has_pending(&self, kind: ResourceKind) -> bool {
		self.by_kind.get(&kind).is_some_and(|q| !q.lock().is_empty())
	}

	pub fn snapshot(&self, kind: ResourceKind) -> Option<KindQueue> {
		self.by_kind.get(&kind).map(|q| q.lock().clone())
	}
}
