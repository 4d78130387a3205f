//! Keyed response cache with single-flight loads and explicit invalidation.
//!
//! A cold key is filled by exactly one loader at a time: the first caller
//! installs a `Loading` slot carrying a watch receiver, later callers attach to
//! it and receive the same result. Loader errors are handed to the attached
//! waiters but never stored.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use verity_worker::GenerationClock;

use crate::Result;

enum Slot<V> {
	Ready { value: V, loaded_at: Instant },
	Loading { generation: u64, done: watch::Receiver<Option<Result<V>>> },
}

pub struct ResponseCache<V> {
	slots: Mutex<HashMap<String, Slot<V>>>,
	loads: GenerationClock,
}

impl<V> Default for ResponseCache<V> {
	fn default() -> Self {
		Self {
			slots: Mutex::new(HashMap::new()),
			loads: GenerationClock::new(),
		}
	}
}

enum Role<V> {
	Leader(watch::Sender<Option<Result<V>>>, u64),
	Waiter(watch::Receiver<Option<Result<V>>>),
}

/// Removes this load's `Loading` slot if the leader is dropped mid-load, so
/// waiters retry instead of hanging.
struct LoadGuard<'a, V> {
	slots: &'a Mutex<HashMap<String, Slot<V>>>,
	key: &'a str,
	generation: u64,
	armed: bool,
}

impl<V> Drop for LoadGuard<'_, V> {
	fn drop(&mut self) {
		if self.armed {
			let mut slots = self.slots.lock();
			if matches!(slots.get(self.key), Some(Slot::Loading { generation, .. }) if *generation == self.generation) {
				slots.remove(self.key);
			}
		}
	}
}

impl<V: Clone + Send + Sync> ResponseCache<V> {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the cached value for `key`, loading it if cold or if
	/// `force_refresh` is set.
	///
	/// A refresh requested while a load is already in flight joins that load.
	pub async fn get_or_load<F, Fut>(&self, key: &str, force_refresh: bool, loader: F) -> Result<V>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<V>>,
	{
		let mut loader = Some(loader);
		let mut force_refresh = force_refresh;
		loop {
			let role = {
				let mut slots = self.slots.lock();
				match slots.get(key) {
					Some(Slot::Ready { value, .. }) if !force_refresh => return Ok(value.clone()),
					Some(Slot::Loading { done, .. }) => Role::Waiter(done.clone()),
					_ => {
						let (tx, rx) = watch::channel(None);
						let generation = self.loads.next();
						slots.insert(key.to_string(), Slot::Loading { generation, done: rx });
						Role::Leader(tx, generation)
					}
				}
			};

			match role {
				Role::Leader(tx, generation) => {
					let mut guard = LoadGuard {
						slots: &self.slots,
						key,
						generation,
						armed: true,
					};
					let Some(loader) = loader.take() else {
						return Err(crate::Error::Cancelled);
					};
					tracing::debug!(key, generation, "bulk.cache.load");
					let result = loader().await;
					guard.armed = false;

					{
						let mut slots = self.slots.lock();
						// A clear() during the load removed our slot; keep the result out of the cache.
						if matches!(slots.get(key), Some(Slot::Loading { generation: g, .. }) if *g == generation) {
							match &result {
								Ok(value) => {
									slots.insert(
										key.to_string(),
										Slot::Ready {
											value: value.clone(),
											loaded_at: Instant::now(),
										},
									);
								}
								Err(err) => {
									tracing::debug!(key, error = %err, "bulk.cache.load_failed");
									slots.remove(key);
								}
							}
						}
					}
					tx.send_replace(Some(result.clone()));
					return result;
				}
				Role::Waiter(mut done) => {
					loop {
						let current = done.borrow_and_update().clone();
						if let Some(result) = current {
							return result;
						}
						if done.changed().await.is_err() {
							break;
						}
					}
					// Leader vanished without a result; take over.
					force_refresh = false;
				}
			}
		}
	}

	/// Invalidates one key, or every key when `key` is empty.
	pub fn clear(&self, key: &str) {
		let mut slots = self.slots.lock();
		if key.is_empty() {
			slots.clear();
		} else {
			slots.remove(key);
		}
		tracing::debug!(key, remaining = slots.len(), "bulk.cache.clear");
	}

	/// Cached value without loading.
	pub fn peek(&self, key: &str) -> Option<V> {
		match self.slots.lock().get(key) {
			Some(Slot::Ready { value, .. }) => Some(value.clone()),
			_ => None,
		}
	}

	pub fn loaded_at(&self, key: &str) -> Option<Instant> {
		match self.slots.lock().get(key) {
			Some(Slot::Ready { loaded_at, .. }) => Some(*loaded_at),
			_ => None,
		}
	}

	pub fn is_loading(&self, key: &str) -> bool {
		matches!(self.slots.lock().get(key), Some(Slot::Loading { .. }))
	}
}
