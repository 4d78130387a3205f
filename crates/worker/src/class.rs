/// Execution classes used to tag spawned work in traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskClass {
	/// Timers and schedulers that only wait and signal.
	Scheduler,
	/// Work dominated by network I/O (batch flushes, fetches).
	Io,
	/// Everything else that may be delayed without affecting callers.
	Background,
}

impl TaskClass {
	pub(crate) const fn as_str(self) -> &'static str {
		match self {
			Self::Scheduler => "scheduler",
			Self::Io => "io",
			Self::Background => "background",
		}
	}
}

impl std::fmt::Display for TaskClass {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}
