use std::sync::Arc;
use std::time::Duration;

use delegate_domain::account::keys;
use delegate_domain::{UserStatus, Username, default_account_document};
use delegate_store::{AccountStore, MemoryStore, NewAccount};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::persist::PersistenceQueue;
use crate::server::session::{ConnectionHandle, SessionError, SessionRegistry};

fn alice() -> Username {
	Username::new("alice").unwrap()
}

fn handle(conn_id: u64) -> (ConnectionHandle, mpsc::Receiver<Value>) {
	let (tx, rx) = mpsc::channel(8);
	(ConnectionHandle { conn_id, tx }, rx)
}

async fn registry_with_alice() -> (Arc<SessionRegistry>, Arc<MemoryStore>) {
	let store = Arc::new(MemoryStore::new());
	store
		.register_account(NewAccount {
			username: alice(),
			created: 1,
			document: default_account_document(1, false),
			password_hash: "h".into(),
		})
		.await
		.unwrap();

	let (queue, _rx) = PersistenceQueue::new(Duration::from_millis(10));
	let registry = Arc::new(SessionRegistry::new(store.clone() as Arc<dyn AccountStore>, queue));
	(registry, store)
}

#[tokio::test]
async fn first_sign_in_loads_and_later_ones_append() {
	let (registry, _store) = registry_with_alice().await;

	let (first, _rx1) = handle(1);
	let outcome = registry.sign_in(&alice(), first, false).await.unwrap();
	assert!(outcome.came_online);

	let (second, _rx2) = handle(2);
	let outcome = registry.sign_in(&alice(), second, false).await.unwrap();
	assert!(!outcome.came_online);

	assert!(registry.is_online(&alice()).await);
	assert_eq!(registry.connection_handles(&alice()).await.len(), 2);

	let doc = registry.get_settings(&alice()).await.unwrap();
	assert_eq!(doc.status(), UserStatus::Online);
}

#[tokio::test]
async fn concurrent_sign_ins_share_one_load() {
	let (registry, _store) = registry_with_alice().await;

	let mut tasks = Vec::new();
	for conn_id in 0..8 {
		let registry = Arc::clone(&registry);
		let (h, rx) = handle(conn_id);
		tasks.push(tokio::spawn(async move {
			let outcome = registry.sign_in(&alice(), h, false).await.unwrap();
			(outcome.came_online, rx)
		}));
	}

	let mut came_online = 0;
	let mut receivers = Vec::new();
	for task in tasks {
		let (online, rx) = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
		if online {
			came_online += 1;
		}
		receivers.push(rx);
	}

	assert_eq!(came_online, 1);
	assert_eq!(registry.connection_handles(&alice()).await.len(), 8);
}

#[tokio::test]
async fn last_removal_marks_offline_and_persists() {
	let (registry, store) = registry_with_alice().await;

	let (first, _rx1) = handle(1);
	let (second, _rx2) = handle(2);
	registry.sign_in(&alice(), first, false).await.unwrap();
	registry.sign_in(&alice(), second, false).await.unwrap();

	assert!(!registry.remove_connection(&alice(), 1, false, true).await);
	assert!(registry.is_online(&alice()).await);

	assert!(registry.remove_connection(&alice(), 2, false, false).await);
	assert!(!registry.is_online(&alice()).await);

	let persisted = store.load_account(&alice()).await.unwrap();
	assert_eq!(persisted.status(), UserStatus::Offline);
}

#[tokio::test]
async fn removing_an_absent_connection_is_a_no_op() {
	let (registry, _store) = registry_with_alice().await;

	assert!(!registry.remove_connection(&alice(), 42, false, true).await);

	let (h, _rx) = handle(1);
	registry.sign_in(&alice(), h, false).await.unwrap();
	assert!(!registry.remove_connection(&alice(), 42, false, true).await);
	assert!(registry.is_online(&alice()).await);
}

#[tokio::test]
async fn event_connections_require_a_live_normal_connection() {
	let (registry, _store) = registry_with_alice().await;

	let (h, _rx) = handle(1);
	let result = registry.sign_in(&alice(), h, true).await;
	assert!(matches!(result, Err(SessionError::EventConnectionWithoutSession)));

	let (normal, _rx1) = handle(2);
	registry.sign_in(&alice(), normal, false).await.unwrap();
	let (event, _rx2) = handle(3);
	let outcome = registry.sign_in(&alice(), event, true).await.unwrap();
	assert!(!outcome.came_online);
	assert_eq!(registry.connection_handles(&alice()).await.len(), 2);
}

#[tokio::test]
async fn offline_reads_go_through_the_cache_until_sign_in() {
	let (registry, store) = registry_with_alice().await;

	let doc = registry.get_settings(&alice()).await.unwrap();
	assert_eq!(doc.status(), UserStatus::Online); // default document value

	// Mutating the store directly is not seen through the cache.
	let mut stale = doc.clone();
	stale.set("name", json!("shadow"));
	store.save_account(&alice(), &stale).await.unwrap();
	let cached = registry.get_settings(&alice()).await.unwrap();
	assert_eq!(cached.get("name"), Some(&Value::Null));

	// Coming online invalidates the cache and reloads from the store.
	let (h, _rx) = handle(1);
	registry.sign_in(&alice(), h, false).await.unwrap();
	let live = registry.get_settings(&alice()).await.unwrap();
	assert_eq!(live.get("name"), Some(&json!("shadow")));
}

#[tokio::test]
async fn offline_mutations_write_back_synchronously() {
	let (registry, store) = registry_with_alice().await;

	registry
		.mutate_settings(&alice(), vec![("name".to_string(), json!("Alice"))])
		.await
		.unwrap();

	let persisted = store.load_account(&alice()).await.unwrap();
	assert_eq!(persisted.get("name"), Some(&json!("Alice")));

	let missing = Username::new("nobody").unwrap();
	assert!(matches!(
		registry.mutate_settings(&missing, vec![]).await,
		Err(SessionError::NotFound(_))
	));
}
