#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use delegate_domain::{ChannelDocument, ChannelName};
use delegate_store::{ChannelStore, StoreError};
use tokio::sync::Mutex;
use tracing::debug;

use crate::server::persist::PersistenceQueue;

/// In-memory channel documents, loaded on demand from the store.
///
/// Loaded channels stay resident; mutations go through [`try_update`] so
/// the persistence queue sees every dirty transition.
///
/// [`try_update`]: ChannelRuntime::try_update
pub struct ChannelRuntime {
	store: Arc<dyn ChannelStore>,
	queue: Arc<PersistenceQueue>,
	cache: Mutex<HashMap<ChannelName, ChannelDocument>>,
}

impl ChannelRuntime {
	pub fn new(store: Arc<dyn ChannelStore>, queue: Arc<PersistenceQueue>) -> Self {
		Self {
			store,
			queue,
			cache: Mutex::new(HashMap::new()),
		}
	}

	pub async fn exists(&self, name: &ChannelName) -> Result<bool, StoreError> {
		if self.cache.lock().await.contains_key(name) {
			return Ok(true);
		}
		self.store.channel_exists(name).await
	}

	/// Persist a brand-new channel and make it resident.
	pub async fn register(&self, name: &ChannelName, document: ChannelDocument) -> Result<(), StoreError> {
		self.store.register_channel(name, &document).await?;
		self.cache.lock().await.insert(name.clone(), document);
		debug!(channel = %name, "channel registered");
		Ok(())
	}

	/// A copy of the channel document, loading it if not yet resident.
	pub async fn get(&self, name: &ChannelName) -> Result<ChannelDocument, StoreError> {
		{
			let cache = self.cache.lock().await;
			if let Some(document) = cache.get(name) {
				return Ok(document.clone());
			}
		}

		let document = self.store.load_channel(name).await?;
		let mut cache = self.cache.lock().await;
		Ok(cache.entry(name.clone()).or_insert(document).clone())
	}

	/// Run a fallible mutation against the live document. The channel is
	/// only marked dirty when the mutation reports success.
	pub async fn try_update<T, E, F>(&self, name: &ChannelName, mutate: F) -> Result<Result<T, E>, StoreError>
	where
		F: FnOnce(&mut ChannelDocument) -> Result<T, E>,
	{
		{
			let mut cache = self.cache.lock().await;
			if !cache.contains_key(name) {
				drop(cache);
				let document = self.store.load_channel(name).await?;
				let mut cache = self.cache.lock().await;
				cache.entry(name.clone()).or_insert(document);
			}
		}

		let mut cache = self.cache.lock().await;
		let document = cache
			.get_mut(name)
			.ok_or_else(|| StoreError::ChannelNotFound(name.clone()))?;

		let outcome = mutate(document);
		drop(cache);

		if outcome.is_ok() {
			self.queue.mark_channel_dirty(name);
		}
		Ok(outcome)
	}

	/// Current in-memory state for the flush worker.
	pub async fn snapshot(&self, name: &ChannelName) -> Option<ChannelDocument> {
		self.cache.lock().await.get(name).cloned()
	}
}
