//! Quiet-period scheduler: every poke restarts the timer and the callback fires
//! once the pokes stop for the configured interval.

mod join_ctrl;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use self::join_ctrl::DebounceJoinCtrl;
use crate::mailbox::{Mailbox, MailboxReceiver, MailboxSendError, MailboxSendOutcome, MailboxSender};
use crate::token::{GenerationClock, GenerationToken};
use crate::{TaskClass, spawn};

/// Debouncer configuration.
#[derive(Debug, Clone)]
pub struct DebounceSpec {
	pub(crate) name: String,
	pub(crate) quiet: Duration,
	pub(crate) class: TaskClass,
}

impl DebounceSpec {
	/// Creates a spec with the given trace name and quiet period.
	pub fn new(name: impl Into<String>, quiet: Duration) -> Self {
		Self {
			name: name.into(),
			quiet,
			class: TaskClass::Scheduler,
		}
	}

	/// Sets the task class used for the scheduler task.
	#[must_use]
	pub fn class(mut self, class: TaskClass) -> Self {
		self.class = class;
		self
	}

	/// Returns the quiet period.
	pub fn quiet(&self) -> Duration {
		self.quiet
	}
}

/// Handle to a running debounce task.
///
/// The callback runs on the scheduler task itself, so at most one callback is
/// in flight and pokes that arrive meanwhile schedule the next one. Once
/// [`Debouncer::shutdown`] returns, no callback is running and none will start.
pub struct Debouncer {
	name: String,
	pokes: MailboxSender<Instant>,
	cancel: CancellationToken,
	clock: GenerationClock,
	join: Arc<DebounceJoinCtrl>,
}

impl Debouncer {
	/// Spawns the scheduler task.
	pub fn spawn<F, Fut>(spec: DebounceSpec, on_fire: F) -> Self
	where
		F: Fn(GenerationToken) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		// Only the most recent poke instant matters for the deadline.
		let mailbox = Mailbox::new();
		let cancel = CancellationToken::new();
		let clock = GenerationClock::new();

		let task = run_scheduler(spec.clone(), mailbox.receiver(), cancel.clone(), clock.clone(), on_fire);
		let handle = spawn(spec.class, task);

		Self {
			name: spec.name,
			pokes: mailbox.sender(),
			cancel,
			clock,
			join: Arc::new(DebounceJoinCtrl::new(handle)),
		}
	}

	/// Restarts the quiet period from now.
	pub async fn poke(&self) -> Result<MailboxSendOutcome, MailboxSendError> {
		if self.cancel.is_cancelled() {
			return Err(MailboxSendError::Closed);
		}
		let outcome = self.pokes.send(Instant::now()).await?;
		tracing::trace!(debouncer = %self.name, ?outcome, "worker.debounce.poke");
		Ok(outcome)
	}

	/// Number of callbacks fired so far.
	pub fn fired(&self) -> u64 {
		self.clock.current()
	}

	/// Returns true once shutdown has been requested.
	pub fn is_shut_down(&self) -> bool {
		self.cancel.is_cancelled()
	}

	/// Cancels the timer and waits for the scheduler task to exit.
	///
	/// A callback that is already running observes cancellation through its
	/// [`GenerationToken`] and is awaited before this returns.
	pub async fn shutdown(&self) {
		self.cancel.cancel();
		self.pokes.close_now();
		self.join.join().await;
		tracing::debug!(debouncer = %self.name, fired = self.clock.current(), "worker.debounce.shutdown");
	}

	/// Returns true once the scheduler task has been joined.
	pub async fn is_joined(&self) -> bool {
		self.join.is_done().await
	}
}

impl Drop for Debouncer {
	fn drop(&mut self) {
		self.cancel.cancel();
		self.pokes.close_now();
	}
}

async fn run_scheduler<F, Fut>(spec: DebounceSpec, pokes: MailboxReceiver<Instant>, cancel: CancellationToken, clock: GenerationClock, on_fire: F)
where
	F: Fn(GenerationToken) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = ()> + Send + 'static,
{
	let mut deadline: Option<Instant> = None;
	loop {
		tokio::select! {
			biased;
			_ = cancel.cancelled() => break,
			poke = pokes.recv() => match poke {
				Some(at) => deadline = Some(at + spec.quiet),
				None => break,
			},
			_ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
				deadline = None;
				let token = GenerationToken::new(clock.next(), cancel.child_token());
				tracing::debug!(debouncer = %spec.name, generation = token.generation(), "worker.debounce.fire");
				on_fire(token).await;
			}
		}
	}
	tracing::trace!(debouncer = %spec.name, pending = deadline.is_some(), "worker.debounce.exit");
}
