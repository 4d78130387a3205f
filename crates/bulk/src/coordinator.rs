//! The coordinator facade: one value per controller, owning the queues,
//! debouncer, executor, registry and recent-operation log.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use verity_worker::{DebounceSpec, Debouncer, GenerationToken, TaskClass};

use crate::cache::ResponseCache;
use crate::client::{ApiClient, BatchApi};
use crate::config::Config;
use crate::executor::{BatchExecutor, BatchLimits, FlushReport, Invalidate, Shared};
use crate::kind::{KindRegistry, OpType, ResourceKind};
use crate::queue::Queues;
use crate::reader::{self, READ_ATTEMPTS, READ_BACKOFF, ReadOutcome};
use crate::recent::RecentLog;
use crate::registry::{OpId, OpState, OperationRegistry};
use crate::responses::ResponseStore;
use crate::{Error, Result};

/// Accepts write operations from any number of tasks and applies them to the
/// controller in debounced, per-kind batches.
///
/// ```no_run
/// # async fn demo() -> verity_bulk::Result<()> {
/// use serde_json::json;
/// use verity_bulk::{Config, Coordinator, ResourceKind};
///
/// let mut config = Config::new("https://verity.example", "admin", "secret");
/// config.validate().expect("valid config");
/// let coordinator = Coordinator::connect(&config)?;
///
/// let id = coordinator.put(ResourceKind::Pod, "p1", json!({"enable": true})).await?;
/// coordinator.wait_for(&id, config.operation_timeout()).await?;
/// coordinator.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Coordinator {
	config: Config,
	shared: Arc<Shared>,
	api: Arc<dyn BatchApi>,
	cache: Arc<ResponseCache<Arc<Value>>>,
	executor: Arc<BatchExecutor>,
	debouncer: Debouncer,
	shut_down: AtomicBool,
}

impl Coordinator {
	/// Builds a coordinator talking to the controller over HTTP. `config`
	/// should already be validated.
	pub fn connect(config: &Config) -> Result<Self> {
		let api = ApiClient::from_config(config)?;
		Ok(Self::new(config, Arc::new(api)))
	}

	pub fn new(config: &Config, api: Arc<dyn BatchApi>) -> Self {
		Self::with_kinds(config, api, KindRegistry::builtin())
	}

	pub fn with_kinds(config: &Config, api: Arc<dyn BatchApi>, kinds: KindRegistry) -> Self {
		let kinds = Arc::new(kinds);

		let mut recent = RecentLog::new(config.recent_window());
		let mut retention = config.recent_window();
		for (kind, secs) in &config.recent_window_overrides {
			let window = Duration::from_secs(*secs);
			retention = retention.max(window);
			recent = recent.with_override(*kind, window);
		}

		let shared = Arc::new(Shared {
			queues: Arc::new(Queues::new(kinds.kinds(), config.max_pending_per_kind)),
			kinds,
			registry: Arc::new(OperationRegistry::new(retention)),
			recent: Arc::new(recent),
			responses: Arc::new(ResponseStore::default()),
		});

		let cache = Arc::new(ResponseCache::new());
		let invalidate: Invalidate = {
			let cache = Arc::clone(&cache);
			Arc::new(move |key: &str| cache.clear(key))
		};
		let executor = Arc::new(BatchExecutor::new(Arc::clone(&api), Arc::clone(&shared), invalidate, BatchLimits::from_config(config)));

		let debouncer = {
			let executor = Arc::clone(&executor);
			Debouncer::spawn(DebounceSpec::new("bulk-flush", config.debounce()).class(TaskClass::Io), move |token: GenerationToken| {
				let executor = Arc::clone(&executor);
				async move {
					let report = executor.flush(token.cancellation()).await;
					tracing::debug!(generation = token.generation(), batches = report.batches, restored = report.restored, "bulk.flush.debounced");
				}
			})
		};

		Self {
			config: config.clone(),
			shared,
			api,
			cache,
			executor,
			debouncer,
			shut_down: AtomicBool::new(false),
		}
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn kinds(&self) -> &KindRegistry {
		&self.shared.kinds
	}

	/// Queues one operation and restarts the debounce timer.
	///
	/// `payload` is ignored for deletes. The returned id resolves once the
	/// batch carrying it completes, or with [`Error::Cancelled`] if a later
	/// submission supersedes it.
	pub async fn submit(&self, kind: ResourceKind, op: OpType, name: impl Into<String>, payload: Value) -> Result<OpId> {
		if self.shut_down.load(Ordering::Acquire) {
			return Err(Error::ShutDown);
		}
		let name = name.into();
		let spec = self.shared.kinds.get(kind)?;
		if !spec.supports(op) {
			return Err(Error::Unsupported { kind, op });
		}
		let payload = if op == OpType::Delete { Value::Null } else { payload };

		let id = OpId::generate(kind, &name, op);
		self.shared.registry.register(id.clone(), kind, op, &name);
		let superseded = match self.shared.queues.push(kind, op, &name, id.clone(), payload) {
			Ok(superseded) => superseded,
			Err(err) => {
				self.shared.registry.forget(&id);
				return Err(err);
			}
		};
		for old in superseded {
			tracing::debug!(op_id = %old, superseded_by = %id, "bulk.op.superseded");
			self.shared.registry.resolve(&old, Err(Error::Cancelled));
		}

		if self.debouncer.poke().await.is_err() {
			// Raced with shutdown after the queue accepted the op.
			self.fail_all_pending(Error::Cancelled);
			return Err(Error::ShutDown);
		}
		Ok(id)
	}

	pub async fn put(&self, kind: ResourceKind, name: impl Into<String>, payload: Value) -> Result<OpId> {
		self.submit(kind, OpType::Put, name, payload).await
	}

	pub async fn patch(&self, kind: ResourceKind, name: impl Into<String>, payload: Value) -> Result<OpId> {
		self.submit(kind, OpType::Patch, name, payload).await
	}

	pub async fn delete(&self, kind: ResourceKind, name: impl Into<String>) -> Result<OpId> {
		self.submit(kind, OpType::Delete, name, Value::Null).await
	}

	/// Submits and waits with the configured operation timeout.
	pub async fn execute(&self, kind: ResourceKind, op: OpType, name: impl Into<String>, payload: Value) -> Result<()> {
		let id = self.submit(kind, op, name, payload).await?;
		self.wait_for(&id, self.config.operation_timeout()).await
	}

	pub async fn wait_for(&self, id: &OpId, timeout: Duration) -> Result<()> {
		self.shared.registry.wait_for(id, timeout, &CancellationToken::new()).await
	}

	pub async fn wait_for_cancellable(&self, id: &OpId, timeout: Duration, cancel: &CancellationToken) -> Result<()> {
		self.shared.registry.wait_for(id, timeout, cancel).await
	}

	/// Flushes now instead of waiting for the debounce timer.
	pub async fn flush(&self, cancel: &CancellationToken) -> FlushReport {
		let report = self.executor.flush(cancel).await;
		if report.restored > 0 && !self.shut_down.load(Ordering::Acquire) {
			let _ = self.debouncer.poke().await;
		}
		report
	}

	/// True if `kind` has queued or in-flight work, or a successful write
	/// within its recent window.
	pub fn has_pending_or_recent(&self, kind: ResourceKind) -> bool {
		self.shared.queues.has_pending(kind) || self.executor.is_executing(kind) || self.shared.recent.has_recent(kind)
	}

	/// Reads one resource, trusting recent writes instead of re-reading.
	pub async fn read(&self, kind: ResourceKind, name: &str, cancel: &CancellationToken) -> Result<ReadOutcome> {
		let spec = self.shared.kinds.get(kind)?;
		if self.has_pending_or_recent(kind) {
			tracing::debug!(kind = %kind, name, "bulk.read.trusted");
			return Ok(ReadOutcome::TrustedRecentWrite);
		}

		let mut last_err = Error::Timeout;
		for attempt in 0..READ_ATTEMPTS {
			if attempt > 0 {
				tokio::select! {
					_ = tokio::time::sleep(READ_BACKOFF * attempt) => {}
					_ = cancel.cancelled() => return Err(Error::Cancelled),
				}
			}
			let fetched = tokio::select! {
				fetched = self.collection(kind, false) => fetched,
				_ = cancel.cancelled() => return Err(Error::Cancelled),
			};
			match fetched {
				Ok(body) => {
					return Ok(match reader::find(spec, &body, name) {
						Some((api_name, value)) => ReadOutcome::Found { api_name, value },
						None => ReadOutcome::Missing,
					});
				}
				Err(err) => {
					tracing::warn!(kind = %kind, name, attempt, error = %err, "bulk.read.fetch_failed");
					last_err = err;
				}
			}
		}
		Err(last_err)
	}

	/// Raw collection response for `kind`, through the response cache.
	pub async fn collection(&self, kind: ResourceKind, force_refresh: bool) -> Result<Arc<Value>> {
		let spec = self.shared.kinds.get(kind)?;
		self.cache.get_or_load(&spec.cache_key, force_refresh, || async { self.api.get(spec).await.map(Arc::new) }).await
	}

	/// Invalidates one cache key, or all of them for `""`.
	pub fn clear_cache(&self, key: &str) {
		self.cache.clear(key);
	}

	/// Object read back after the last successful write to an auto-generated kind.
	pub fn resource_response(&self, kind: ResourceKind, name: &str) -> Option<Value> {
		self.shared.responses.get(kind, name)
	}

	/// Resolves every queued or in-flight operation with `err` and empties the
	/// queues. Returns the number of operations failed.
	pub fn fail_all_pending(&self, err: Error) -> usize {
		let mut failed = 0;
		for (_, queue) in self.shared.queues.take_all() {
			for id in queue.ids() {
				failed += usize::from(self.shared.registry.resolve(&id, Err(err.clone())));
			}
		}
		for id in self.shared.registry.unresolved() {
			failed += usize::from(self.shared.registry.resolve(&id, Err(err.clone())));
		}
		if failed > 0 {
			tracing::warn!(failed, error = %err, "bulk.fail_all");
		}
		failed
	}

	pub fn operation_state(&self, id: &OpId) -> Option<OpState> {
		self.shared.registry.state(id)
	}

	/// Operations queued for `kind` and not yet drained.
	pub fn pending_count(&self, kind: ResourceKind) -> usize {
		self.shared.queues.pending(kind)
	}

	pub fn is_shut_down(&self) -> bool {
		self.shut_down.load(Ordering::Acquire)
	}

	/// Stops the debouncer, waits for any flush in progress and cancels what
	/// is still pending. Later submissions fail with [`Error::ShutDown`].
	pub async fn shutdown(&self) {
		self.shut_down.store(true, Ordering::Release);
		self.debouncer.shutdown().await;
		self.executor.quiesce().await;
		let cancelled = self.fail_all_pending(Error::Cancelled);
		tracing::info!(cancelled, "bulk.shutdown");
	}
}
