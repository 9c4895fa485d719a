#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use delegate_domain::{AccountDocument, UserStatus, Username};
use delegate_store::{AccountStore, StoreError};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use crate::server::persist::PersistenceQueue;

#[derive(Debug, Error)]
pub enum SessionError {
	#[error("no such account: {0}")]
	NotFound(Username),

	#[error("event connection requires a live normal connection")]
	EventConnectionWithoutSession,

	#[error(transparent)]
	Store(StoreError),
}

impl From<StoreError> for SessionError {
	fn from(e: StoreError) -> Self {
		match e {
			StoreError::AccountNotFound(u) => SessionError::NotFound(u),
			other => SessionError::Store(other),
		}
	}
}

/// Write handle to one live connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
	pub conn_id: u64,
	pub tx: mpsc::Sender<Value>,
}

#[derive(Debug)]
struct OnlineAccount {
	document: AccountDocument,
	connections: Vec<ConnectionHandle>,
	event_connections: Vec<ConnectionHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignInOutcome {
	/// True when this sign-in loaded the account and flipped it online;
	/// subsequent sign-ins only append a connection.
	pub came_online: bool,
}

#[derive(Default)]
struct Inner {
	online: HashMap<Username, OnlineAccount>,
	/// Load-in-progress markers; concurrent sign-ins for the same username
	/// wait on the receiver instead of issuing a second load.
	loading: HashMap<Username, watch::Receiver<bool>>,
	/// Read-through cache for offline lookups, dropped the moment the
	/// account comes online.
	cache: HashMap<Username, AccountDocument>,
}

/// Tracks online accounts and their live connections.
///
/// Guarantees at most one in-memory document per username: the username is
/// either in `online`, or being loaded exactly once, or served read-only
/// from the offline cache.
pub struct SessionRegistry {
	store: Arc<dyn AccountStore>,
	queue: Arc<PersistenceQueue>,
	inner: Mutex<Inner>,
}

impl SessionRegistry {
	pub fn new(store: Arc<dyn AccountStore>, queue: Arc<PersistenceQueue>) -> Self {
		Self {
			store,
			queue,
			inner: Mutex::new(Inner::default()),
		}
	}

	/// Attach a connection to an account, loading it on the first one.
	pub async fn sign_in(
		&self,
		username: &Username,
		connection: ConnectionHandle,
		is_event_connection: bool,
	) -> Result<SignInOutcome, SessionError> {
		loop {
			let waiter = {
				let mut inner = self.inner.lock().await;

				if let Some(account) = inner.online.get_mut(username) {
					if is_event_connection {
						account.event_connections.push(connection);
					} else {
						account.connections.push(connection);
					}
					debug!(username = %username, "appended connection to online account");
					return Ok(SignInOutcome { came_online: false });
				}

				if is_event_connection {
					return Err(SessionError::EventConnectionWithoutSession);
				}

				match inner.loading.get(username) {
					Some(rx) => rx.clone(),
					None => {
						let (tx, rx) = watch::channel(false);
						inner.loading.insert(username.clone(), rx);
						drop(inner);

						return self.finish_load(username, connection, tx).await;
					}
				}
			};

			// A load for this username is in flight; join it and retry.
			let mut waiter = waiter;
			let _ = waiter.changed().await;
		}
	}

	async fn finish_load(
		&self,
		username: &Username,
		connection: ConnectionHandle,
		done: watch::Sender<bool>,
	) -> Result<SignInOutcome, SessionError> {
		let loaded = self.store.load_account(username).await;

		let mut inner = self.inner.lock().await;
		inner.loading.remove(username);
		let _ = done.send(true);

		let mut document = loaded?;
		document.set_status(UserStatus::Online);
		inner.cache.remove(username);
		inner.online.insert(
			username.clone(),
			OnlineAccount {
				document,
				connections: vec![connection],
				event_connections: Vec::new(),
			},
		);
		drop(inner);

		self.queue.mark_account_dirty(username);
		metrics::gauge!("delegate_server_accounts_online").increment(1.0);
		info!(username = %username, "account came online");
		Ok(SignInOutcome { came_online: true })
	}

	/// Detach one connection. Dead transports in either list are pruned as
	/// a side effect. Removing a connection that is already gone is a
	/// no-op. Returns true when the account went offline and was evicted.
	pub async fn remove_connection(
		&self,
		username: &Username,
		conn_id: u64,
		is_event_connection: bool,
		consensual: bool,
	) -> bool {
		self.detach(username, Some((conn_id, is_event_connection)), consensual).await
	}

	/// Drop connections whose transport already closed, evicting the
	/// account if nothing is left.
	pub async fn prune_dead_connections(&self, username: &Username) -> bool {
		self.detach(username, None, false).await
	}

	async fn detach(&self, username: &Username, remove: Option<(u64, bool)>, consensual: bool) -> bool {
		let evicted = {
			let mut inner = self.inner.lock().await;
			let Some(account) = inner.online.get_mut(username) else {
				return false;
			};

			let keep = |c: &ConnectionHandle| !c.tx.is_closed();
			account.connections.retain(keep);
			account.event_connections.retain(keep);
			if let Some((conn_id, is_event_connection)) = remove {
				if is_event_connection {
					account.event_connections.retain(|c| c.conn_id != conn_id);
				} else {
					account.connections.retain(|c| c.conn_id != conn_id);
				}
			}

			if !account.connections.is_empty() || !account.event_connections.is_empty() {
				debug!(username = %username, consensual, "connection removed, account stays online");
				return false;
			}

			let Some(mut account) = inner.online.remove(username) else {
				return false;
			};
			account.document.set_status(UserStatus::Offline);
			inner.cache.insert(username.clone(), account.document.clone());
			account.document
		};

		self.queue.forget_account(username);
		metrics::gauge!("delegate_server_accounts_online").decrement(1.0);
		info!(username = %username, consensual, "account went offline");

		// The account left memory, so the debounced path can no longer see
		// it; the final state is written out directly.
		if let Err(e) = self.store.save_account(username, &evicted).await {
			warn!(username = %username, error = %e, "failed to persist account at sign-off");
		}
		true
	}

	pub async fn is_online(&self, username: &Username) -> bool {
		self.inner.lock().await.online.contains_key(username)
	}

	/// Live in-memory document for the flush worker; `None` once evicted.
	pub async fn online_snapshot(&self, username: &Username) -> Option<AccountDocument> {
		self.inner
			.lock()
			.await
			.online
			.get(username)
			.map(|a| a.document.clone())
	}

	/// All connection handles (normal and event) of an online account.
	pub async fn connection_handles(&self, username: &Username) -> Vec<ConnectionHandle> {
		let inner = self.inner.lock().await;
		let Some(account) = inner.online.get(username) else {
			return Vec::new();
		};
		account
			.connections
			.iter()
			.chain(account.event_connections.iter())
			.cloned()
			.collect()
	}

	/// Settings of any account: live document if online, else a
	/// read-through cache over the store.
	pub async fn get_settings(&self, username: &Username) -> Result<AccountDocument, SessionError> {
		{
			let inner = self.inner.lock().await;
			if let Some(account) = inner.online.get(username) {
				return Ok(account.document.clone());
			}
			if let Some(document) = inner.cache.get(username) {
				return Ok(document.clone());
			}
		}

		let document = self.store.load_account(username).await?;

		let mut inner = self.inner.lock().await;
		if !inner.online.contains_key(username) {
			inner.cache.insert(username.clone(), document.clone());
		}
		Ok(document)
	}

	/// Apply `mutate` to the account's document. Online accounts are
	/// mutated in memory and flushed through the queue; offline accounts
	/// go through a synchronous read-modify-write against the store.
	pub async fn update_account<F>(&self, username: &Username, mutate: F) -> Result<(), SessionError>
	where
		F: FnOnce(&mut AccountDocument),
	{
		{
			let mut inner = self.inner.lock().await;
			if let Some(account) = inner.online.get_mut(username) {
				mutate(&mut account.document);
				drop(inner);
				self.queue.mark_account_dirty(username);
				return Ok(());
			}
		}

		let mut document = self.store.load_account(username).await?;
		mutate(&mut document);
		self.store.save_account(username, &document).await?;

		let mut inner = self.inner.lock().await;
		if !inner.online.contains_key(username) {
			inner.cache.insert(username.clone(), document);
		}
		Ok(())
	}

	/// Apply a settings patch per `update_account` semantics.
	pub async fn mutate_settings(
		&self,
		username: &Username,
		patch: Vec<(String, Value)>,
	) -> Result<(), SessionError> {
		self.update_account(username, move |document| {
			for (key, value) in patch {
				document.set(key, value);
			}
		})
		.await
	}
}
