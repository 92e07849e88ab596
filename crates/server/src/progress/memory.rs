//! In-memory progress store.
//!
//! Backs tests and local development. Namespaces persist for the life of the
//! factory, so an evicted-and-respawned session observes its earlier writes
//! the same way it would against the durable backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{ProgressFactory, ProgressStore};
use crate::error::Result;

/// A single in-memory namespace.
#[derive(Debug, Default)]
pub struct MemoryProgress {
	entries: Mutex<BTreeMap<String, serde_json::Value>>,
}

#[async_trait]
impl ProgressStore for MemoryProgress {
	async fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
		self.entries
			.lock()
			.unwrap()
			.insert(key.to_string(), value);
		Ok(())
	}

	async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
		Ok(self.entries.lock().unwrap().get(key).cloned())
	}

	async fn list(&self, prefix: &str) -> Result<Vec<(String, serde_json::Value)>> {
		Ok(self
			.entries
			.lock()
			.unwrap()
			.range(prefix.to_string()..)
			.take_while(|(k, _)| k.starts_with(prefix))
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect())
	}
}

/// Factory handing out one persistent [`MemoryProgress`] per client.
#[derive(Debug, Default)]
pub struct MemoryProgressFactory {
	namespaces: Mutex<HashMap<String, Arc<MemoryProgress>>>,
}

#[async_trait]
impl ProgressFactory for MemoryProgressFactory {
	async fn open(&self, client_id: &str) -> Result<Arc<dyn ProgressStore>> {
		let mut namespaces = self.namespaces.lock().unwrap();
		let store = namespaces
			.entry(client_id.to_string())
			.or_default()
			.clone();
		Ok(store)
	}
}
