use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;

use crate::kind::ResourceKind;

/// Objects read back after writes to kinds whose fields the controller fills in.
#[derive(Default)]
pub struct ResponseStore {
	objects: Mutex<HashMap<(ResourceKind, String), Value>>,
}

impl ResponseStore {
	/// Stores every object of a collection under its key and, when it differs,
	/// under its `name` field. Returns the number of objects stored.
	pub fn store_collection(&self, kind: ResourceKind, collection: &Value) -> usize {
		let Some(items) = collection.as_object() else {
			return 0;
		};
		let mut objects = self.objects.lock();
		for (key, object) in items {
			if let Some(name) = object.get("name").and_then(Value::as_str).filter(|n| *n != key) {
				objects.insert((kind, name.to_string()), object.clone());
			}
			objects.insert((kind, key.clone()), object.clone());
		}
		items.len()
	}

	pub fn get(&self, kind: ResourceKind, name: &str) -> Option<Value> {
		self.objects.lock().get(&(kind, name.to_string())).cloned()
	}

	pub fn remove(&self, kind: ResourceKind, name: &str) {
		self.objects.lock().remove(&(kind, name.to_string()));
	}
}
