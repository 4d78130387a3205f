//! Single-slot, latest-wins mailbox used to carry debounce pokes.

use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

/// Outcome from enqueueing a mailbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxSendOutcome {
	/// Message was enqueued into an empty slot.
	Enqueued,
	/// An unread message was replaced by this one.
	Coalesced,
}

/// Mailbox send error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxSendError {
	/// Mailbox is closed.
	Closed,
}

impl std::fmt::Display for MailboxSendError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Closed => f.write_str("mailbox closed"),
		}
	}
}

impl std::error::Error for MailboxSendError {}

struct MailboxState<T> {
	slot: Option<T>,
	closed: bool,
}

struct MailboxInner<T> {
	state: Mutex<MailboxState<T>>,
	notify_recv: Notify,
}

/// Multi-producer mailbox sender.
pub struct MailboxSender<T> {
	inner: Arc<MailboxInner<T>>,
}

/// Mailbox receiver.
pub struct MailboxReceiver<T> {
	inner: Arc<MailboxInner<T>>,
}

/// Mailbox holding at most one message; a send replaces any unread one.
///
/// Senders never wait on the receiver, which only cares about the most
/// recent message.
pub struct Mailbox<T> {
	inner: Arc<MailboxInner<T>>,
}

impl<T> Clone for MailboxSender<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T> Default for Mailbox<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> Mailbox<T> {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(MailboxInner {
				state: Mutex::new(MailboxState { slot: None, closed: false }),
				notify_recv: Notify::new(),
			}),
		}
	}

	/// Returns a sender handle.
	pub fn sender(&self) -> MailboxSender<T> {
		MailboxSender {
			inner: Arc::clone(&self.inner),
		}
	}

	/// Returns a receiver handle.
	pub fn receiver(&self) -> MailboxReceiver<T> {
		MailboxReceiver {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T> MailboxSender<T> {
	/// Attempts to close mailbox without waiting for a lock.
	pub fn close_now(&self) {
		if let Ok(mut state) = self.inner.state.try_lock() {
			state.closed = true;
			drop(state);
			self.inner.notify_recv.notify_waiters();
		}
	}

	/// Stores `msg`, replacing any unread message.
	pub async fn send(&self, msg: T) -> Result<MailboxSendOutcome, MailboxSendError> {
		let mut state = self.inner.state.lock().await;
		if state.closed {
			return Err(MailboxSendError::Closed);
		}
		let outcome = match state.slot.replace(msg) {
			Some(_) => MailboxSendOutcome::Coalesced,
			None => MailboxSendOutcome::Enqueued,
		};
		drop(state);
		self.inner.notify_recv.notify_one();
		Ok(outcome)
	}
}

impl<T> MailboxReceiver<T> {
	/// Receives one message. Returns `None` once mailbox is closed and drained.
	pub async fn recv(&self) -> Option<T> {
		loop {
			// Register before inspecting state so a send between unlock and
			// await is not lost.
			let notified = self.inner.notify_recv.notified();
			let mut state = self.inner.state.lock().await;
			if let Some(msg) = state.slot.take() {
				return Some(msg);
			}
			if state.closed {
				return None;
			}
			drop(state);
			notified.await;
		}
	}
}
