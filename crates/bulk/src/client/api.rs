use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::Method;
use serde_json::{Map, Value};

use super::auth::{Authenticator, Credentials};
use super::transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport};
use super::{BatchApi, ItemResults};
use crate::config::Config;
use crate::kind::KindSpec;
use crate::{Error, Result};

/// [`BatchApi`] over an authenticated [`Transport`].
///
/// Logs in lazily before the first request. A 401 triggers one forced
/// re-authentication and one retry of the same request.
pub struct ApiClient {
	transport: Arc<dyn Transport>,
	auth: Authenticator,
}

impl ApiClient {
	pub fn new(transport: Arc<dyn Transport>, credentials: Credentials) -> Self {
		Self {
			transport,
			auth: Authenticator::new(credentials),
		}
	}

	/// Builds a reqwest-backed client from validated configuration.
	pub fn from_config(config: &Config) -> Result<Self> {
		let transport = ReqwestTransport::new(&config.base_uri, config.request_timeout())?;
		Ok(Self::new(Arc::new(transport), Credentials::new(&config.username, &config.password)))
	}

	#[must_use]
	pub fn with_authenticator(mut self, auth: Authenticator) -> Self {
		self.auth = auth;
		self
	}

	pub fn transport(&self) -> &Arc<dyn Transport> {
		&self.transport
	}

	async fn call(&self, request: ApiRequest) -> Result<ApiResponse> {
		self.auth.ensure(&*self.transport).await?;
		let token = self.auth.token().await;

		let response = self.transport.send(request.clone()).await?;
		if response.status != 401 {
			return Ok(response);
		}

		tracing::info!(method = %request.method, path = %request.path, "bulk.auth.unauthorized");
		self.auth.refresh(&*self.transport, token.as_deref()).await?;
		let retried = self.transport.send(request).await?;
		if retried.status == 401 {
			return Err(Error::Auth(format!("still unauthorized after re-authentication: {}", retried.body)));
		}
		Ok(retried)
	}

	fn request(spec: &KindSpec, method: Method, body: Option<Value>) -> ApiRequest {
		let request = ApiRequest::new(method, spec.path()).query(&spec.query);
		match body {
			Some(body) => request.json(body),
			None => request,
		}
	}

	async fn write(&self, spec: &KindSpec, method: Method, items: &IndexMap<String, Value>) -> Result<ItemResults> {
		let batch: Map<String, Value> = items.iter().map(|(name, payload)| (name.clone(), payload.clone())).collect();
		let body = Value::Object(Map::from_iter([(spec.write_field.clone(), Value::Object(batch))]));
		let response = self.call(Self::request(spec, method, Some(body))).await?;
		item_results(items.keys().map(String::as_str), &response)
	}
}

#[async_trait]
impl BatchApi for ApiClient {
	async fn put_batch(&self, spec: &KindSpec, items: &IndexMap<String, Value>) -> Result<ItemResults> {
		self.write(spec, Method::PUT, items).await
	}

	async fn patch_batch(&self, spec: &KindSpec, items: &IndexMap<String, Value>) -> Result<ItemResults> {
		self.write(spec, Method::PATCH, items).await
	}

	async fn delete_batch(&self, spec: &KindSpec, names: &[String]) -> Result<ItemResults> {
		let list = names.iter().cloned().map(Value::String).collect();
		let body = Value::Object(Map::from_iter([(spec.write_field.clone(), Value::Array(list))]));
		let response = self.call(Self::request(spec, Method::DELETE, Some(body))).await?;
		item_results(names.iter().map(String::as_str), &response)
	}

	async fn get(&self, spec: &KindSpec) -> Result<Value> {
		let response = self.call(Self::request(spec, Method::GET, None)).await?;
		if !response.is_success() {
			return Err(Error::Http {
				status: response.status,
				body: response.body,
			});
		}
		match serde_json::from_str(&response.body) {
			Ok(value @ Value::Object(_)) => Ok(value),
			Ok(other) => Err(Error::Decode(format!("expected an object, got {other}"))),
			Err(err) => Err(Error::Decode(err.to_string())),
		}
	}
}

fn item_status(value: &Value) -> Option<(u16, String)> {
	let status = value.get("status")?.as_u64()?;
	let message = value.get("message").and_then(Value::as_str).unwrap_or_default().to_string();
	Some((u16::try_from(status).unwrap_or(u16::MAX), message))
}

/// Interprets a write response for the requested names.
///
/// A body that maps at least one requested name to `{status, message?}` is
/// read per item, with unlisted names taking the HTTP status. Any other body
/// applies the HTTP status to the whole batch.
pub fn item_results<'a>(names: impl IntoIterator<Item = &'a str>, response: &ApiResponse) -> Result<ItemResults> {
	let names: Vec<&str> = names.into_iter().collect();
	let per_item = serde_json::from_str::<Value>(&response.body)
		.ok()
		.and_then(|v| match v {
			Value::Object(map) => Some(map),
			_ => None,
		})
		.filter(|map| names.iter().any(|n| map.get(*n).and_then(item_status).is_some()));

	let Some(map) = per_item else {
		if !response.is_success() {
			return Err(Error::Http {
				status: response.status,
				body: response.body.clone(),
			});
		}
		return Ok(names.into_iter().map(|n| (n.to_string(), Ok(()))).collect());
	};

	Ok(names
		.into_iter()
		.map(|name| {
			let (status, message) = map.get(name).and_then(item_status).unwrap_or_else(|| (response.status, String::new()));
			let outcome = if (200..300).contains(&status) { Ok(()) } else { Err(Error::PerItem { status, message }) };
			(name.to_string(), outcome)
		})
		.collect())
}
