use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::kind::{OpType, ResourceKind};

/// Executions remembered per kind.
pub const RECENT_CAPACITY: usize = 16;

/// One batch sent for a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Execution {
	pub at: Instant,
	pub op: OpType,
	pub succeeded: usize,
	pub failed: usize,
}

/// Per-kind ring of recent batch executions.
pub struct RecentLog {
	rings: Mutex<HashMap<ResourceKind, VecDeque<Execution>>>,
	window: Duration,
	overrides: HashMap<ResourceKind, Duration>,
}

impl RecentLog {
	pub fn new(window: Duration) -> Self {
		Self {
			rings: Mutex::new(HashMap::new()),
			window,
			overrides: HashMap::new(),
		}
	}

	#[must_use]
	pub fn with_override(mut self, kind: ResourceKind, window: Duration) -> Self {
		self.overrides.insert(kind, window);
		self
	}

	pub fn window(&self, kind: ResourceKind) -> Duration {
		self.overrides.get(&kind).copied().unwrap_or(self.window)
	}

	pub fn record(&self, kind: ResourceKind, execution: Execution) {
		let mut rings = self.rings.lock();
		let ring = rings.entry(kind).or_insert_with(|| VecDeque::with_capacity(RECENT_CAPACITY));
		if ring.len() == RECENT_CAPACITY {
			ring.pop_front();
		}
		ring.push_back(execution);
	}

	/// True if a batch with at least one successful item ran within the kind's window.
	pub fn has_recent(&self, kind: ResourceKind) -> bool {
		let window = self.window(kind);
		let now = Instant::now();
		self.rings
			.lock()
			.get(&kind)
			.is_some_and(|ring| ring.iter().rev().any(|e| e.succeeded > 0 && now.saturating_duration_since(e.at) <= window))
	}

	pub fn executions(&self, kind: ResourceKind) -> Vec<Execution> {
		self.rings.lock().get(&kind).map(|ring| ring.iter().copied().collect()).unwrap_or_default()
	}
}
