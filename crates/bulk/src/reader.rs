use std::time::Duration;

use serde_json::Value;

use crate::kind::KindSpec;

/// Collection fetches attempted before a read gives up.
pub const READ_ATTEMPTS: u32 = 3;
/// Back-off unit between read attempts; the n-th retry waits n units.
pub const READ_BACKOFF: Duration = Duration::from_millis(100);

/// Result of reading one resource.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
	/// The kind was written (or has writes queued) within its recent window;
	/// the caller should keep its own state instead of re-reading.
	TrustedRecentWrite,
	/// `api_name` is the key the controller stores the object under, which
	/// may differ from the requested name.
	Found { api_name: String, value: Value },
	Missing,
}

/// Looks `name` up in a raw collection response, first by key and then by the
/// objects' `name` field.
pub fn find(spec: &KindSpec, body: &Value, name: &str) -> Option<(String, Value)> {
	let items = body.get(&spec.read_field)?.as_object()?;
	if let Some(value) = items.get(name) {
		return Some((name.to_string(), value.clone()));
	}
	items
		.iter()
		.find(|(_, value)| value.get("name").and_then(Value::as_str) == Some(name))
		.map(|(key, value)| (key.clone(), value.clone()))
}
