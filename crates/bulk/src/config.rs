use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::kind::ResourceKind;

pub const ENV_URI: &str = "VERITY_URI";
pub const ENV_USERNAME: &str = "VERITY_USERNAME";
pub const ENV_PASSWORD: &str = "VERITY_PASSWORD";

/// Process-wide coordinator settings.
///
/// Every field has a default so a TOML file only needs the values it changes.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
	pub base_uri: String,
	pub username: String,
	pub password: String,
	/// Quiet period before a flush.
	pub debounce_ms: u64,
	/// How long a successful write keeps a kind "recent" and how long resolved
	/// operations stay queryable.
	pub recent_window_s: u64,
	pub recent_window_overrides: HashMap<ResourceKind, u64>,
	/// Default `wait_for` timeout.
	pub operation_timeout_s: u64,
	/// Per-request HTTP timeout.
	pub request_timeout_s: u64,
	/// Distinct queued resources per kind before submissions are refused.
	pub max_pending_per_kind: usize,
	pub max_batch_size: usize,
	pub max_delete_batch_size: usize,
	/// Delay before reading back kinds whose fields the controller fills in.
	pub auto_gen_settle_ms: u64,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			base_uri: String::new(),
			username: String::new(),
			password: String::new(),
			debounce_ms: 3000,
			recent_window_s: 60,
			recent_window_overrides: HashMap::new(),
			operation_timeout_s: 300,
			request_timeout_s: 300,
			max_pending_per_kind: 10_000,
			max_batch_size: 1000,
			max_delete_batch_size: 100,
			auto_gen_settle_ms: 2000,
		}
	}
}

impl std::fmt::Debug for Config {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Config")
			.field("base_uri", &self.base_uri)
			.field("username", &self.username)
			.field("password", &if self.password.is_empty() { "" } else { "<redacted>" })
			.field("debounce_ms", &self.debounce_ms)
			.field("recent_window_s", &self.recent_window_s)
			.field("recent_window_overrides", &self.recent_window_overrides)
			.field("operation_timeout_s", &self.operation_timeout_s)
			.field("request_timeout_s", &self.request_timeout_s)
			.field("max_pending_per_kind", &self.max_pending_per_kind)
			.field("max_batch_size", &self.max_batch_size)
			.field("max_delete_batch_size", &self.max_delete_batch_size)
			.field("auto_gen_settle_ms", &self.auto_gen_settle_ms)
			.finish()
	}
}

impl Config {
	pub fn new(base_uri: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
		Self {
			base_uri: base_uri.into(),
			username: username.into(),
			password: password.into(),
			..Self::default()
		}
	}

	pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
		Ok(toml::from_str(src)?)
	}

	/// Reads a TOML file and overlays environment credentials.
	pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
			path: path.to_path_buf(),
			source,
		})?;
		let mut config = Self::from_toml_str(&src)?;
		config.apply_env();
		Ok(config)
	}

	/// Fills empty connection fields from `VERITY_URI`, `VERITY_USERNAME` and
	/// `VERITY_PASSWORD`.
	pub fn apply_env(&mut self) {
		self.apply_env_from(|key| std::env::var(key).ok());
	}

	pub(crate) fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
		for (field, key) in [(&mut self.base_uri, ENV_URI), (&mut self.username, ENV_USERNAME), (&mut self.password, ENV_PASSWORD)] {
			if field.is_empty()
				&& let Some(value) = lookup(key).filter(|v| !v.is_empty())
			{
				*field = value;
			}
		}
	}

	/// Checks required fields and normalizes `base_uri` (trailing `/` removed).
	pub fn validate(&mut self) -> Result<(), ConfigError> {
		let uri = self.base_uri.trim().trim_end_matches('/');
		if uri.is_empty() {
			return Err(ConfigError::Missing("base_uri"));
		}
		if !(uri.starts_with("http://") || uri.starts_with("https://")) {
			return Err(ConfigError::InvalidUri(self.base_uri.clone()));
		}
		self.base_uri = uri.to_string();

		if self.username.is_empty() {
			return Err(ConfigError::Missing("username"));
		}
		if self.password.is_empty() {
			return Err(ConfigError::Missing("password"));
		}

		for (field, value) in [
			("max_pending_per_kind", self.max_pending_per_kind),
			("max_batch_size", self.max_batch_size),
			("max_delete_batch_size", self.max_delete_batch_size),
		] {
			if value == 0 {
				return Err(ConfigError::Zero { field });
			}
		}
		Ok(())
	}

	pub fn debounce(&self) -> Duration {
		Duration::from_millis(self.debounce_ms)
	}

	pub fn recent_window(&self) -> Duration {
		Duration::from_secs(self.recent_window_s)
	}

	pub fn recent_window_for(&self, kind: ResourceKind) -> Duration {
		self.recent_window_overrides.get(&kind).map_or_else(|| self.recent_window(), |s| Duration::from_secs(*s))
	}

	pub fn operation_timeout(&self) -> Duration {
		Duration::from_secs(self.operation_timeout_s)
	}

	pub fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_s)
	}

	pub fn auto_gen_settle(&self) -> Duration {
		Duration::from_millis(self.auto_gen_settle_ms)
	}
}
