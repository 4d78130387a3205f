//! Session authentication against `/api/auth`.

use std::fmt;
use std::time::Duration;

use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::transport::{ApiRequest, Transport};
use crate::{Error, Result};

pub const AUTH_PATH: &str = "/api/auth";
/// Cookie carrying the session token.
pub const SESSION_COOKIE: &str = "ivn_api";
/// Controller tokens are presumed valid for a day.
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
	pub username: String,
	pub password: String,
}

impl Credentials {
	pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
		Self {
			username: username.into(),
			password: password.into(),
		}
	}
}

impl fmt::Debug for Credentials {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credentials").field("username", &self.username).field("password", &"<redacted>").finish()
	}
}

#[derive(Deserialize)]
struct AuthResponse {
	#[serde(default)]
	token: Option<String>,
}

#[derive(Debug, Default)]
struct TokenManager {
	token: Option<String>,
	expires_at: Option<Instant>,
}

impl TokenManager {
	fn needs_refresh(&self, now: Instant) -> bool {
		match (&self.token, self.expires_at) {
			(Some(_), Some(at)) => now >= at,
			_ => true,
		}
	}

	fn store(&mut self, token: String, lifetime: Duration) {
		self.token = Some(token);
		self.expires_at = Some(Instant::now() + lifetime);
	}
}

/// Obtains and refreshes the session token.
///
/// The token lock is held across the auth request so concurrent callers that
/// all see an expired token trigger a single login.
pub struct Authenticator {
	credentials: Credentials,
	lifetime: Duration,
	tokens: Mutex<TokenManager>,
}

impl Authenticator {
	pub fn new(credentials: Credentials) -> Self {
		Self {
			credentials,
			lifetime: TOKEN_LIFETIME,
			tokens: Mutex::new(TokenManager::default()),
		}
	}

	#[must_use]
	pub fn lifetime(mut self, lifetime: Duration) -> Self {
		self.lifetime = lifetime;
		self
	}

	pub async fn token(&self) -> Option<String> {
		self.tokens.lock().await.token.clone()
	}

	/// Logs in if there is no token or it has expired.
	pub async fn ensure(&self, transport: &dyn Transport) -> Result<()> {
		let mut tokens = self.tokens.lock().await;
		if !tokens.needs_refresh(Instant::now()) {
			return Ok(());
		}
		let token = self.login(transport).await?;
		tokens.store(token, self.lifetime);
		Ok(())
	}

	/// Forces a new login after `rejected` was refused, unless another caller
	/// already replaced it.
	pub async fn refresh(&self, transport: &dyn Transport, rejected: Option<&str>) -> Result<()> {
		let mut tokens = self.tokens.lock().await;
		if tokens.token.is_some() && tokens.token.as_deref() != rejected && !tokens.needs_refresh(Instant::now()) {
			return Ok(());
		}
		*tokens = TokenManager::default();
		let token = self.login(transport).await?;
		tokens.store(token, self.lifetime);
		Ok(())
	}

	async fn login(&self, transport: &dyn Transport) -> Result<String> {
		let body = json!({
			"auth": {
				"username": self.credentials.username,
				"password": self.credentials.password,
			}
		});
		let response = transport
			.send(ApiRequest::new(Method::POST, AUTH_PATH).json(body))
			.await
			.map_err(|e| match e {
				Error::Timeout => Error::Timeout,
				other => Error::Auth(other.to_string()),
			})?;

		if !response.is_success() {
			return Err(Error::Auth(format!("status {}: {}", response.status, response.body)));
		}

		let parsed: AuthResponse = serde_json::from_str(&response.body).map_err(|e| Error::Auth(format!("invalid response: {e}")))?;
		let token = parsed.token.filter(|t| !t.is_empty()).ok_or_else(|| Error::Auth("no token in response".into()))?;

		transport.set_cookie(SESSION_COOKIE, &token);
		tracing::info!(username = %self.credentials.username, "bulk.auth.login");
		Ok(token)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use async_trait::async_trait;
	use parking_lot::Mutex as SyncMutex;

	use super::*;
	use crate::client::ApiResponse;

	#[derive(Default)]
	struct LoginServer {
		logins: AtomicUsize,
		fail_with: Option<u16>,
		cookie: SyncMutex<Option<String>>,
		bodies: SyncMutex<Vec<serde_json::Value>>,
	}

	#[async_trait]
	impl Transport for LoginServer {
		async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
			assert_eq!(request.path, AUTH_PATH);
			self.bodies.lock().extend(request.body);
			let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
			Ok(match self.fail_with {
				Some(status) => ApiResponse {
					status,
					body: "denied".into(),
				},
				None => ApiResponse {
					status: 200,
					body: format!(r#"{{"token":"tok-{n}"}}"#),
				},
			})
		}

		fn set_cookie(&self, name: &str, value: &str) {
			assert_eq!(name, SESSION_COOKIE);
			*self.cookie.lock() = Some(value.to_string());
		}

		fn cookie(&self, _name: &str) -> Option<String> {
			self.cookie.lock().clone()
		}
	}

	fn authenticator() -> Authenticator {
		Authenticator::new(Credentials::new("admin", "secret"))
	}

	#[tokio::test(start_paused = true)]
	async fn ensure_logs_in_once_until_expiry() {
		let server = LoginServer::default();
		let auth = authenticator().lifetime(Duration::from_secs(60));

		auth.ensure(&server).await.unwrap();
		auth.ensure(&server).await.unwrap();
		assert_eq!(server.logins.load(Ordering::SeqCst), 1);
		assert_eq!(server.cookie(SESSION_COOKIE).as_deref(), Some("tok-1"));
		assert_eq!(
			server.bodies.lock()[0],
			serde_json::json!({"auth": {"username": "admin", "password": "secret"}})
		);

		tokio::time::advance(Duration::from_secs(61)).await;
		auth.ensure(&server).await.unwrap();
		assert_eq!(server.logins.load(Ordering::SeqCst), 2);
		assert_eq!(auth.token().await.as_deref(), Some("tok-2"));
	}

	#[tokio::test]
	async fn refresh_skips_when_token_already_replaced() {
		let server = LoginServer::default();
		let auth = authenticator();

		auth.ensure(&server).await.unwrap();
		auth.refresh(&server, Some("tok-1")).await.unwrap();
		assert_eq!(auth.token().await.as_deref(), Some("tok-2"));

		// A second caller that also saw tok-1 rejected must not log in again.
		auth.refresh(&server, Some("tok-1")).await.unwrap();
		assert_eq!(server.logins.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn concurrent_ensure_logs_in_once() {
		let server = Arc::new(LoginServer::default());
		let auth = Arc::new(authenticator());

		let mut handles = Vec::new();
		for _ in 0..4 {
			let (server, auth) = (Arc::clone(&server), Arc::clone(&auth));
			handles.push(tokio::spawn(async move { auth.ensure(&*server).await }));
		}
		for handle in handles {
			handle.await.unwrap().unwrap();
		}
		assert_eq!(server.logins.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn rejected_login_is_auth_error() {
		let server = LoginServer {
			fail_with: Some(403),
			..LoginServer::default()
		};
		let err = authenticator().ensure(&server).await.unwrap_err();
		assert!(matches!(err, Error::Auth(msg) if msg.contains("403")));
		assert_eq!(server.cookie(SESSION_COOKIE), None);
	}

	#[test]
	fn credentials_debug_hides_password() {
		assert!(!format!("{:?}", Credentials::new("u", "hunter2")).contains("hunter2"));
	}
}
