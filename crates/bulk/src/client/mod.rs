//! Narrow HTTP adapter over the controller API.
//!
//! The executor only sees [`BatchApi`]; [`ApiClient`] is the real
//! implementation, layered over a [`Transport`] and an [`Authenticator`].

mod api;
mod auth;
mod transport;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;

pub use self::api::{ApiClient, item_results};
pub use self::auth::{AUTH_PATH, Authenticator, Credentials, SESSION_COOKIE, TOKEN_LIFETIME};
pub use self::transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport};
use crate::Result;
use crate::kind::KindSpec;

/// Per-item outcomes of one batch, in request order.
pub type ItemResults = IndexMap<String, Result<()>>;

/// Batch operations the executor issues against one kind.
///
/// An `Err` return is a batch-level failure that applies to every item; an
/// `Ok` map carries one entry per requested name.
#[async_trait]
pub trait BatchApi: Send + Sync {
	async fn put_batch(&self, spec: &KindSpec, items: &IndexMap<String, Value>) -> Result<ItemResults>;

	async fn patch_batch(&self, spec: &KindSpec, items: &IndexMap<String, Value>) -> Result<ItemResults>;

	async fn delete_batch(&self, spec: &KindSpec, names: &[String]) -> Result<ItemResults>;

	/// Raw collection response for the kind.
	async fn get(&self, spec: &KindSpec) -> Result<Value>;
}
