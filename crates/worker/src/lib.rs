//! Runtime primitives for debounced background work: classified task spawning,
//! a never-blocking mailbox, generation tokens and the quiet-period scheduler.

mod class;
/// Quiet-period scheduler.
pub mod debounce;
/// Latest-wins mailbox for timer pokes.
pub mod mailbox;
mod spawn;
/// Generation counters and cancellation tokens.
pub mod token;

pub use class::TaskClass;
pub use debounce::{DebounceSpec, Debouncer};
pub use mailbox::{Mailbox, MailboxReceiver, MailboxSendError, MailboxSendOutcome, MailboxSender};
pub use spawn::spawn;
pub use token::{GenerationClock, GenerationToken};
