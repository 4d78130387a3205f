#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::{Value, json};
use tokio::time::Instant;
use verity_bulk::client::{AUTH_PATH, ApiRequest, ApiResponse};
use verity_bulk::{ApiClient, Config, Coordinator, Credentials, Result, Transport};

pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_test_writer()
		.with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
		.try_init();
}

/// A request the fake controller received.
#[derive(Debug, Clone)]
pub struct Recorded {
	pub at: Instant,
	pub method: Method,
	pub path: String,
	pub query: Vec<(String, String)>,
	pub body: Option<Value>,
}

#[derive(Default)]
struct State {
	requests: Vec<Recorded>,
	logins: usize,
	unauthorized: usize,
	replies: HashMap<(Method, String), VecDeque<ApiResponse>>,
	collections: HashMap<String, Value>,
	cookies: HashMap<String, String>,
}

/// In-memory stand-in for the controller's HTTP surface.
///
/// Logins always succeed with a fresh token. Writes answer `200 {}` unless a
/// reply was scripted; GETs answer the configured collection or `{}`.
#[derive(Default)]
pub struct FakeController {
	state: Mutex<State>,
}

impl FakeController {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Answers the next `count` resource requests with 401.
	pub fn reject_next(&self, count: usize) {
		self.state.lock().unauthorized = count;
	}

	pub fn reply(&self, method: Method, path: &str, status: u16, body: Value) {
		self.state.lock().replies.entry((method, path.to_string())).or_default().push_back(ApiResponse {
			status,
			body: body.to_string(),
		});
	}

	pub fn collection(&self, path: &str, body: Value) {
		self.state.lock().collections.insert(path.to_string(), body);
	}

	pub fn logins(&self) -> usize {
		self.state.lock().logins
	}

	/// Every non-auth request, in arrival order.
	pub fn resource_requests(&self) -> Vec<Recorded> {
		self.state.lock().requests.iter().filter(|r| r.path != AUTH_PATH).cloned().collect()
	}

	pub fn writes(&self) -> Vec<Recorded> {
		self.resource_requests().into_iter().filter(|r| r.method != Method::GET).collect()
	}

	pub fn count(&self, method: &Method, path: &str) -> usize {
		self.resource_requests().iter().filter(|r| &r.method == method && r.path == path).count()
	}
}

#[async_trait]
impl Transport for FakeController {
	async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
		let mut state = self.state.lock();
		state.requests.push(Recorded {
			at: Instant::now(),
			method: request.method.clone(),
			path: request.path.clone(),
			query: request.query.clone(),
			body: request.body.clone(),
		});

		if request.path == AUTH_PATH {
			state.logins += 1;
			return Ok(ApiResponse {
				status: 200,
				body: json!({"token": format!("tok-{}", state.logins)}).to_string(),
			});
		}
		if state.unauthorized > 0 {
			state.unauthorized -= 1;
			return Ok(ApiResponse {
				status: 401,
				body: "token expired".into(),
			});
		}
		if let Some(reply) = state.replies.get_mut(&(request.method.clone(), request.path.clone())).and_then(VecDeque::pop_front) {
			return Ok(reply);
		}
		let body = match request.method {
			Method::GET => state.collections.get(&request.path).cloned().unwrap_or_else(|| json!({})),
			_ => json!({}),
		};
		Ok(ApiResponse {
			status: 200,
			body: body.to_string(),
		})
	}

	fn set_cookie(&self, name: &str, value: &str) {
		self.state.lock().cookies.insert(name.to_string(), value.to_string());
	}

	fn cookie(&self, name: &str) -> Option<String> {
		self.state.lock().cookies.get(name).cloned()
	}
}

pub fn config() -> Config {
	let mut config = Config::new("https://verity.test", "admin", "secret");
	config.validate().expect("test config is valid");
	config
}

pub fn coordinator(controller: &Arc<FakeController>) -> Coordinator {
	coordinator_with(controller, &config())
}

pub fn coordinator_with(controller: &Arc<FakeController>, config: &Config) -> Coordinator {
	init_tracing();
	let transport: Arc<dyn Transport> = controller.clone();
	let api = ApiClient::new(transport, Credentials::new(&config.username, &config.password));
	Coordinator::new(config, Arc::new(api))
}
