use std::future::Future;
use std::sync::OnceLock;

use tokio::task::JoinHandle;

use crate::TaskClass;

/// Returns the ambient tokio handle, or a lazily built fallback runtime when
/// called from outside any runtime (hosts that embed the coordinator from
/// synchronous code).
pub(crate) fn runtime_handle() -> tokio::runtime::Handle {
	if let Ok(handle) = tokio::runtime::Handle::try_current() {
		return handle;
	}

	static GLOBAL_RT: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
	let runtime = GLOBAL_RT.get_or_init(|| {
		tokio::runtime::Builder::new_multi_thread()
			.enable_all()
			.worker_threads(2)
			.thread_name("verity-worker-global")
			.build()
			.expect("failed to build verity-worker global tokio runtime")
	});
	runtime.handle().clone()
}

/// Spawns an async task tagged with a task class.
pub fn spawn<F>(class: TaskClass, fut: F) -> JoinHandle<F::Output>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	tracing::trace!(worker_class = class.as_str(), "worker.spawn");
	runtime_handle().spawn(fut)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn spawn_runs_on_current_runtime() {
		let handle = spawn(TaskClass::Background, async { 41 + 1 });
		assert_eq!(handle.await.ok(), Some(42));
	}

	#[test]
	fn spawn_outside_runtime_uses_fallback() {
		let handle = spawn(TaskClass::Background, async { "done" });
		let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
		assert_eq!(rt.block_on(handle).ok(), Some("done"));
	}
}
