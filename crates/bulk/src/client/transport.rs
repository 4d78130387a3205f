use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use reqwest::cookie::{CookieStore, Jar};
use serde_json::Value;
use url::Url;

use crate::{Error, Result};

/// One controller request, relative to the base URI.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
	pub method: Method,
	/// Absolute path, e.g. `/api/pods`.
	pub path: String,
	pub query: Vec<(String, String)>,
	pub body: Option<Value>,
}

impl ApiRequest {
	pub fn new(method: Method, path: impl Into<String>) -> Self {
		Self {
			method,
			path: path.into(),
			query: Vec::new(),
			body: None,
		}
	}

	#[must_use]
	pub fn query(mut self, query: &[(String, String)]) -> Self {
		self.query.extend_from_slice(query);
		self
	}

	#[must_use]
	pub fn json(mut self, body: Value) -> Self {
		self.body = Some(body);
		self
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
	pub status: u16,
	pub body: String,
}

impl ApiResponse {
	pub fn is_success(&self) -> bool {
		(200..300).contains(&self.status)
	}
}

/// Sends requests and owns the session cookie jar.
#[async_trait]
pub trait Transport: Send + Sync {
	async fn send(&self, request: ApiRequest) -> Result<ApiResponse>;

	/// Stores a cookie for the base URI.
	fn set_cookie(&self, name: &str, value: &str);

	fn cookie(&self, name: &str) -> Option<String>;
}

/// [`Transport`] backed by a shared `reqwest` client and cookie jar.
pub struct ReqwestTransport {
	client: reqwest::Client,
	base: Url,
	jar: Arc<Jar>,
}

impl ReqwestTransport {
	pub fn new(base_uri: &str, timeout: Duration) -> Result<Self> {
		let base = Url::parse(base_uri).map_err(|e| Error::Transport(format!("invalid base uri {base_uri:?}: {e}")))?;
		let jar = Arc::new(Jar::default());
		let client = reqwest::Client::builder()
			.cookie_provider(Arc::clone(&jar))
			.timeout(timeout)
			.build()
			.map_err(|e| Error::Transport(e.to_string()))?;
		Ok(Self { client, base, jar })
	}

	fn url(&self, path: &str) -> Result<Url> {
		self.base.join(path).map_err(|e| Error::Transport(format!("invalid path {path:?}: {e}")))
	}
}

fn transport_error(err: reqwest::Error) -> Error {
	if err.is_timeout() { Error::Timeout } else { Error::Transport(err.to_string()) }
}

#[async_trait]
impl Transport for ReqwestTransport {
	async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
		let url = self.url(&request.path)?;
		let mut builder = self.client.request(request.method.clone(), url).query(&request.query);
		if let Some(body) = &request.body {
			builder = builder.json(body);
		}

		let response = builder.send().await.map_err(transport_error)?;
		let status = response.status().as_u16();
		let body = response.text().await.map_err(transport_error)?;
		tracing::debug!(method = %request.method, path = %request.path, status, bytes = body.len(), "bulk.http.response");
		Ok(ApiResponse { status, body })
	}

	fn set_cookie(&self, name: &str, value: &str) {
		self.jar.add_cookie_str(&format!("{name}={value}; Path=/"), &self.base);
	}

	fn cookie(&self, name: &str) -> Option<String> {
		let header = self.jar.cookies(&self.base)?;
		cookie_value(header.to_str().ok()?, name)
	}
}

/// Extracts one value from a `Cookie` header.
pub(crate) fn cookie_value(header: &str, name: &str) -> Option<String> {
	header
		.split(';')
		.filter_map(|pair| pair.trim().split_once('='))
		.find(|(key, _)| *key == name)
		.map(|(_, value)| value.to_string())
}
