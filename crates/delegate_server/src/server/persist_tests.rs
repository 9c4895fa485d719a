use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use delegate_domain::{AccountDocument, ChannelDocument, ChannelName, Username, default_account_document};
use delegate_store::{AccountStore, ChannelStore, MemoryStore, NewAccount, StoreError};
use serde_json::json;
use tokio::time::{sleep, timeout};

use crate::server::persist::{PersistenceQueue, SnapshotSource};

fn alice() -> Username {
	Username::new("alice").unwrap()
}

/// Store wrapper that counts account flushes.
#[derive(Clone)]
struct CountingStore {
	inner: MemoryStore,
	saves: Arc<AtomicUsize>,
}

impl CountingStore {
	fn new(inner: MemoryStore) -> Self {
		Self {
			inner,
			saves: Arc::new(AtomicUsize::new(0)),
		}
	}
}

#[async_trait]
impl AccountStore for CountingStore {
	async fn account_exists(&self, username: &Username) -> Result<bool, StoreError> {
		self.inner.account_exists(username).await
	}

	async fn register_account(&self, account: NewAccount) -> Result<(), StoreError> {
		self.inner.register_account(account).await
	}

	async fn load_account(&self, username: &Username) -> Result<AccountDocument, StoreError> {
		self.inner.load_account(username).await
	}

	async fn save_account(&self, username: &Username, document: &AccountDocument) -> Result<(), StoreError> {
		self.saves.fetch_add(1, Ordering::SeqCst);
		self.inner.save_account(username, document).await
	}

	async fn password_hash(&self, username: &Username) -> Result<String, StoreError> {
		self.inner.password_hash(username).await
	}

	async fn totp_secret(&self, username: &Username) -> Result<Option<String>, StoreError> {
		self.inner.totp_secret(username).await
	}

	async fn set_totp_secret(&self, username: &Username, secret: &str) -> Result<(), StoreError> {
		self.inner.set_totp_secret(username, secret).await
	}
}

/// Snapshot source serving one fixed account document.
struct FixedSource {
	document: AccountDocument,
}

#[async_trait]
impl SnapshotSource for FixedSource {
	async fn account_snapshot(&self, _username: &Username) -> Option<AccountDocument> {
		Some(self.document.clone())
	}

	async fn channel_snapshot(&self, _name: &ChannelName) -> Option<ChannelDocument> {
		None
	}
}

async fn spawn_worker(
	queue: &Arc<PersistenceQueue>,
	rx: tokio::sync::mpsc::UnboundedReceiver<crate::server::persist::PersistJob>,
	document: AccountDocument,
) -> CountingStore {
	let store = CountingStore::new(MemoryStore::new());
	store
		.register_account(NewAccount {
			username: alice(),
			created: 0,
			document: default_account_document(0, false),
			password_hash: "h".into(),
		})
		.await
		.unwrap();
	// Registration itself does not count as a flush.
	store.saves.store(0, Ordering::SeqCst);

	let source = Arc::new(FixedSource { document });
	let channels: Arc<dyn ChannelStore> = Arc::new(MemoryStore::new());
	tokio::spawn(Arc::clone(queue).run(rx, source, Arc::new(store.clone()), channels));
	store
}

#[tokio::test]
async fn rapid_mutations_coalesce_into_one_flush() {
	let (queue, rx) = PersistenceQueue::new(Duration::from_millis(20));

	let mut document = default_account_document(0, false);
	document.set("name", json!("final"));
	let store = spawn_worker(&queue, rx, document).await;

	for _ in 0..10 {
		queue.mark_account_dirty(&alice());
	}

	sleep(Duration::from_millis(100)).await;
	assert_eq!(store.saves.load(Ordering::SeqCst), 1);

	// The single flush carries the final state, not an intermediate one.
	let persisted = store.load_account(&alice()).await.unwrap();
	assert_eq!(persisted.get("name"), Some(&json!("final")));
}

#[tokio::test]
async fn mutations_after_a_flush_enqueue_a_fresh_job() {
	let (queue, rx) = PersistenceQueue::new(Duration::from_millis(10));
	let store = spawn_worker(&queue, rx, default_account_document(0, false)).await;

	queue.mark_account_dirty(&alice());
	timeout(Duration::from_secs(5), async {
		while store.saves.load(Ordering::SeqCst) < 1 {
			sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.unwrap();

	queue.mark_account_dirty(&alice());
	timeout(Duration::from_secs(5), async {
		while store.saves.load(Ordering::SeqCst) < 2 {
			sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.unwrap();

	assert_eq!(store.saves.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn evicted_entities_are_skipped_not_invented() {
	struct EmptySource;

	#[async_trait]
	impl SnapshotSource for EmptySource {
		async fn account_snapshot(&self, _username: &Username) -> Option<AccountDocument> {
			None
		}

		async fn channel_snapshot(&self, _name: &ChannelName) -> Option<ChannelDocument> {
			None
		}
	}

	let (queue, rx) = PersistenceQueue::new(Duration::from_millis(5));
	let store = CountingStore::new(MemoryStore::new());
	let channels: Arc<dyn ChannelStore> = Arc::new(MemoryStore::new());
	tokio::spawn(Arc::clone(&queue).run(rx, Arc::new(EmptySource), Arc::new(store.clone()), channels));

	queue.mark_account_dirty(&alice());
	sleep(Duration::from_millis(50)).await;
	assert_eq!(store.saves.load(Ordering::SeqCst), 0);
}
