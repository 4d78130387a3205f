use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;

use super::*;
use crate::kind::KindSpec;
use crate::registry::OpId;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Call {
	kind: ResourceKind,
	op: &'static str,
	names: Vec<String>,
}

#[derive(Default)]
struct FakeApi {
	calls: Mutex<Vec<Call>>,
	item_errors: Mutex<HashMap<String, Error>>,
	batch_error: Mutex<Option<Error>>,
	collection: Mutex<Value>,
	cancel_during_call: Mutex<Option<CancellationToken>>,
	/// `{cache_key}:{unresolved ops}` captured at each invalidation.
	seen_at_invalidate: Mutex<Vec<String>>,
}

impl FakeApi {
	fn record(&self, spec: &KindSpec, op: &'static str, names: Vec<String>) -> Result<ItemResults> {
		if let Some(cancel) = self.cancel_during_call.lock().take() {
			cancel.cancel();
		}
		self.calls.lock().push(Call {
			kind: spec.kind,
			op,
			names: names.clone(),
		});
		if let Some(err) = self.batch_error.lock().clone() {
			return Err(err);
		}
		let errors = self.item_errors.lock();
		Ok(names
			.into_iter()
			.map(|n| {
				let outcome = errors.get(&n).cloned().map_or(Ok(()), Err);
				(n, outcome)
			})
			.collect())
	}

	fn calls(&self) -> Vec<Call> {
		self.calls.lock().clone()
	}
}

#[async_trait]
impl BatchApi for FakeApi {
	async fn put_batch(&self, spec: &KindSpec, items: &IndexMap<String, Value>) -> Result<ItemResults> {
		self.record(spec, "PUT", items.keys().cloned().collect())
	}

	async fn patch_batch(&self, spec: &KindSpec, items: &IndexMap<String, Value>) -> Result<ItemResults> {
		self.record(spec, "PATCH", items.keys().cloned().collect())
	}

	async fn delete_batch(&self, spec: &KindSpec, names: &[String]) -> Result<ItemResults> {
		self.record(spec, "DELETE", names.to_vec())
	}

	async fn get(&self, spec: &KindSpec) -> Result<Value> {
		self.calls.lock().push(Call {
			kind: spec.kind,
			op: "GET",
			names: Vec::new(),
		});
		Ok(self.collection.lock().clone())
	}
}

struct Harness {
	api: Arc<FakeApi>,
	shared: Arc<Shared>,
	executor: BatchExecutor,
	invalidated: Arc<Mutex<Vec<String>>>,
}

fn harness(limits: BatchLimits) -> Harness {
	let kinds = Arc::new(KindRegistry::builtin());
	let shared = Arc::new(Shared {
		queues: Arc::new(Queues::new(kinds.kinds(), 1000)),
		kinds,
		registry: Arc::new(OperationRegistry::new(Duration::from_secs(60))),
		recent: Arc::new(RecentLog::new(Duration::from_secs(60))),
		responses: Arc::new(ResponseStore::default()),
	});
	let api = Arc::new(FakeApi::default());
	let invalidated = Arc::new(Mutex::new(Vec::new()));

	let invalidate: Invalidate = {
		let invalidated = Arc::clone(&invalidated);
		let api = Arc::clone(&api);
		let registry = Arc::clone(&shared.registry);
		Arc::new(move |key: &str| {
			invalidated.lock().push(key.to_string());
			let executing = registry.unresolved().len();
			api.seen_at_invalidate.lock().push(format!("{key}:{executing}"));
		})
	};
	let executor = BatchExecutor::new(Arc::clone(&api) as Arc<dyn BatchApi>, Arc::clone(&shared), invalidate, limits);
	Harness {
		api,
		shared,
		executor,
		invalidated,
	}
}

impl Harness {
	fn submit(&self, kind: ResourceKind, op: OpType, name: &str, payload: Value) -> OpId {
		let id = OpId::generate(kind, name, op);
		self.shared.registry.register(id.clone(), kind, op, name);
		for superseded in self.shared.queues.push(kind, op, name, id.clone(), payload).unwrap() {
			self.shared.registry.resolve(&superseded, Err(Error::Cancelled));
		}
		id
	}

	fn state(&self, id: &OpId) -> Option<OpState> {
		self.shared.registry.state(id)
	}
}

fn no_settle() -> BatchLimits {
	BatchLimits {
		auto_gen_settle: Duration::ZERO,
		..BatchLimits::default()
	}
}

#[tokio::test]
async fn drains_delete_then_put_then_patch_per_kind() {
	let h = harness(no_settle());
	h.submit(ResourceKind::Gateway, OpType::Patch, "g3", json!({"a": 1}));
	h.submit(ResourceKind::Gateway, OpType::Put, "g2", json!({}));
	h.submit(ResourceKind::Gateway, OpType::Delete, "g1", Value::Null);

	let report = h.executor.flush(&CancellationToken::new()).await;
	let ops: Vec<_> = h.api.calls().into_iter().map(|c| c.op).collect();
	assert_eq!(ops, ["DELETE", "PUT", "PATCH"]);
	assert_eq!(report.batches, 3);
	assert_eq!(report.succeeded, 3);
	assert_eq!(report.kinds, vec![ResourceKind::Gateway]);
}

#[tokio::test]
async fn one_call_per_kind_and_op_type() {
	let h = harness(no_settle());
	let mut ids = Vec::new();
	for n in 0..5 {
		ids.push(h.submit(ResourceKind::Pod, OpType::Put, &format!("p{n}"), json!({})));
		ids.push(h.submit(ResourceKind::Lag, OpType::Patch, &format!("l{n}"), json!({})));
	}

	h.executor.flush(&CancellationToken::new()).await;
	let calls = h.api.calls();
	assert_eq!(calls.len(), 2);
	assert_eq!(calls[0].names, ["p0", "p1", "p2", "p3", "p4"]);
	for id in &ids {
		assert_eq!(h.state(id), Some(OpState::Succeeded));
	}
}

#[tokio::test]
async fn large_sections_are_chunked_in_order() {
	let h = harness(BatchLimits {
		max_batch_size: 2,
		max_delete_batch_size: 1,
		auto_gen_settle: Duration::ZERO,
	});
	for name in ["a", "b", "c", "d", "e"] {
		h.submit(ResourceKind::Pod, OpType::Put, name, json!({}));
	}
	for name in ["x", "y"] {
		h.submit(ResourceKind::Pod, OpType::Delete, name, Value::Null);
	}

	let report = h.executor.flush(&CancellationToken::new()).await;
	let batches: Vec<_> = h.api.calls().into_iter().map(|c| (c.op, c.names)).collect();
	assert_eq!(
		batches,
		vec![
			("DELETE", vec!["x".to_string()]),
			("DELETE", vec!["y".to_string()]),
			("PUT", vec!["a".to_string(), "b".to_string()]),
			("PUT", vec!["c".to_string(), "d".to_string()]),
			("PUT", vec!["e".to_string()]),
		]
	);
	assert_eq!(report.batches, 5);
}

#[tokio::test]
async fn batch_failure_resolves_every_item() {
	let h = harness(no_settle());
	let a = h.submit(ResourceKind::Pod, OpType::Put, "a", json!({}));
	let b = h.submit(ResourceKind::Pod, OpType::Put, "b", json!({}));
	let err = Error::Http {
		status: 500,
		body: "down".into(),
	};
	*h.api.batch_error.lock() = Some(err.clone());

	let report = h.executor.flush(&CancellationToken::new()).await;
	assert_eq!(h.state(&a), Some(OpState::Failed(err.clone())));
	assert_eq!(h.state(&b), Some(OpState::Failed(err)));
	assert_eq!(report.failed, 2);
	assert!(h.invalidated.lock().is_empty());
	assert!(!h.shared.recent.has_recent(ResourceKind::Pod));
}

#[tokio::test]
async fn per_item_failures_only_touch_their_items() {
	let h = harness(no_settle());
	let ok = h.submit(ResourceKind::Pod, OpType::Put, "p1", json!({}));
	let bad = h.submit(ResourceKind::Pod, OpType::Put, "p2", json!({}));
	let err = Error::PerItem {
		status: 400,
		message: "bad".into(),
	};
	h.api.item_errors.lock().insert("p2".into(), err.clone());

	h.executor.flush(&CancellationToken::new()).await;
	assert_eq!(h.state(&ok), Some(OpState::Succeeded));
	assert_eq!(h.state(&bad), Some(OpState::Failed(err)));
	assert!(h.shared.recent.has_recent(ResourceKind::Pod));
}

#[tokio::test]
async fn invalidation_happens_before_release() {
	let h = harness(no_settle());
	h.submit(ResourceKind::Gateway, OpType::Put, "g1", json!({}));
	h.submit(ResourceKind::Gateway, OpType::Put, "g2", json!({}));

	h.executor.flush(&CancellationToken::new()).await;
	assert_eq!(*h.invalidated.lock(), vec!["gateways".to_string()]);
	// Both operations were still unresolved when the cache key was cleared.
	assert_eq!(*h.api.seen_at_invalidate.lock(), vec!["gateways:2".to_string()]);
}

#[tokio::test]
async fn cancelled_before_flush_leaves_queue_untouched() {
	let h = harness(no_settle());
	let id = h.submit(ResourceKind::Pod, OpType::Put, "p1", json!({}));
	let cancel = CancellationToken::new();
	cancel.cancel();

	let report = h.executor.flush(&cancel).await;
	assert!(report.cancelled);
	assert!(h.api.calls().is_empty());
	assert_eq!(h.shared.queues.pending(ResourceKind::Pod), 1);
	assert_eq!(h.state(&id), Some(OpState::Pending));
}

#[tokio::test]
async fn cancelled_during_call_requeues_with_same_ids() {
	let h = harness(no_settle());
	let deleted = h.submit(ResourceKind::Pod, OpType::Delete, "old", Value::Null);
	let put = h.submit(ResourceKind::Pod, OpType::Put, "p1", json!({"v": 1}));
	let other_kind = h.submit(ResourceKind::Lag, OpType::Put, "l1", json!({}));

	let cancel = CancellationToken::new();
	*h.api.cancel_during_call.lock() = Some(cancel.clone());

	let report = h.executor.flush(&cancel).await;
	assert!(report.cancelled);
	assert_eq!(report.batches, 1);
	assert_eq!(report.restored, 3);
	assert_eq!(h.api.calls().len(), 1);

	for id in [&deleted, &put, &other_kind] {
		assert_eq!(h.state(id), Some(OpState::Pending));
	}
	let queue = h.shared.queues.snapshot(ResourceKind::Pod).unwrap();
	assert_eq!(queue.slot(OpType::Delete, "old").unwrap().ids, vec![deleted.clone()]);
	assert_eq!(queue.slot(OpType::Put, "p1").unwrap().ids, vec![put.clone()]);
	assert!(h.invalidated.lock().is_empty());

	let report = h.executor.flush(&CancellationToken::new()).await;
	assert!(!report.cancelled);
	assert_eq!(h.state(&deleted), Some(OpState::Succeeded));
	assert_eq!(h.state(&put), Some(OpState::Succeeded));
	assert_eq!(h.state(&other_kind), Some(OpState::Succeeded));
}

#[tokio::test]
async fn restored_items_fold_with_newer_submissions() {
	let h = harness(no_settle());
	let first = h.submit(ResourceKind::Pod, OpType::Put, "p1", json!({"v": 1}));

	let cancel = CancellationToken::new();
	*h.api.cancel_during_call.lock() = Some(cancel.clone());
	h.executor.flush(&cancel).await;

	let second = h.submit(ResourceKind::Pod, OpType::Put, "p1", json!({"v": 2}));
	let slot = h.shared.queues.snapshot(ResourceKind::Pod).unwrap().slot(OpType::Put, "p1").cloned().unwrap();
	assert_eq!(slot.ids, vec![first, second]);
	assert_eq!(slot.payload, json!({"v": 2}));
}

#[tokio::test(start_paused = true)]
async fn auto_generated_kinds_are_read_back_before_release() {
	let h = harness(BatchLimits {
		auto_gen_settle: Duration::from_secs(2),
		..BatchLimits::default()
	});
	*h.api.collection.lock() = json!({"tenant": {"t1": {"name": "t1", "vrf_name": "vrf-7"}}});
	let id = h.submit(ResourceKind::Tenant, OpType::Put, "t1", json!({"enable": true}));

	let started = Instant::now();
	h.executor.flush(&CancellationToken::new()).await;
	assert!(started.elapsed() >= Duration::from_secs(2));

	let ops: Vec<_> = h.api.calls().into_iter().map(|c| c.op).collect();
	assert_eq!(ops, ["PUT", "GET"]);
	assert_eq!(h.shared.responses.get(ResourceKind::Tenant, "t1").unwrap()["vrf_name"], "vrf-7");
	assert_eq!(h.state(&id), Some(OpState::Succeeded));
}

#[tokio::test]
async fn plain_kinds_skip_read_back() {
	let h = harness(no_settle());
	h.submit(ResourceKind::Pod, OpType::Put, "p1", json!({}));
	h.executor.flush(&CancellationToken::new()).await;
	assert!(h.api.calls().iter().all(|c| c.op != "GET"));
}

#[tokio::test]
async fn empty_flush_is_a_no_op() {
	let h = harness(no_settle());
	let report = h.executor.flush(&CancellationToken::new()).await;
	assert_eq!(report, FlushReport::default());
	assert!(!h.executor.is_executing(ResourceKind::Pod));
}

#[test]
fn chunks_respect_size() {
	let section: IndexMap<String, Slot> = (0..5)
		.map(|n| {
			(
				format!("r{n}"),
				Slot {
					ids: vec![OpId::from(format!("id-{n}").as_str())],
					payload: Value::Null,
				},
			)
		})
		.collect();
	let sizes: Vec<_> = chunks(section, 2).iter().map(IndexMap::len).collect();
	assert_eq!(sizes, [2, 2, 1]);
}
