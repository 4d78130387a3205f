use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

/// Join coordination for the debounce task.
///
/// Only one shutdown caller becomes the leader that awaits the join handle;
/// the others wait on the notify until the leader transitions to `Done`.
enum JoinState {
	Handle(JoinHandle<()>),
	Joining,
	Done,
}

pub(super) struct DebounceJoinCtrl {
	state: Mutex<JoinState>,
	done: Notify,
}

impl DebounceJoinCtrl {
	pub(super) fn new(handle: JoinHandle<()>) -> Self {
		Self {
			state: Mutex::new(JoinState::Handle(handle)),
			done: Notify::new(),
		}
	}

	/// Joins the debounce task. Multiple callers are safe.
	pub(super) async fn join(&self) {
		loop {
			let handle = {
				let mut st = self.state.lock().await;
				match std::mem::replace(&mut *st, JoinState::Joining) {
					JoinState::Done => {
						*st = JoinState::Done;
						return;
					}
					JoinState::Joining => {
						// Notified is created under the lock so the leader's
						// notify_waiters cannot slip in before we await.
						let notified = self.done.notified();
						drop(st);
						notified.await;
						continue;
					}
					JoinState::Handle(h) => h,
				}
			};
			if let Err(err) = handle.await {
				tracing::warn!(error = %err, "worker.debounce.join_failed");
			}
			*self.state.lock().await = JoinState::Done;
			self.done.notify_waiters();
			return;
		}
	}

	pub(super) async fn is_done(&self) -> bool {
		matches!(*self.state.lock().await, JoinState::Done)
	}
}
