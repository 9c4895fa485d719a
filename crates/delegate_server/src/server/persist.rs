#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use delegate_domain::{AccountDocument, ChannelDocument, ChannelName, Username};
use delegate_store::{AccountStore, ChannelStore};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default flush debounce. Persisted state may lag in-memory truth by up
/// to this interval; a crash in the window loses the latest mutations.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistJob {
	Account(Username),
	Channel(ChannelName),
}

/// Where the flush worker reads current entity state from. Returning
/// `None` means the entity left memory since the job was enqueued and the
/// flush is skipped (eviction persists synchronously on its own path).
#[async_trait]
pub trait SnapshotSource: Send + Sync {
	async fn account_snapshot(&self, username: &Username) -> Option<AccountDocument>;
	async fn channel_snapshot(&self, name: &ChannelName) -> Option<ChannelDocument>;
}

/// Coalescing write-back queue.
///
/// A mutation marks its entity dirty; marking an already-dirty entity is a
/// no-op, so any burst of mutations inside the debounce window collapses
/// into one flush of the final state. The worker clears the dirty flag
/// before reading the snapshot, so mutations arriving mid-write enqueue a
/// fresh job instead of being lost.
pub struct PersistenceQueue {
	tx: mpsc::UnboundedSender<PersistJob>,
	dirty_accounts: Mutex<HashMap<Username, Arc<AtomicBool>>>,
	dirty_channels: Mutex<HashMap<ChannelName, Arc<AtomicBool>>>,
	debounce: Duration,
}

impl PersistenceQueue {
	pub fn new(debounce: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<PersistJob>) {
		let (tx, rx) = mpsc::unbounded_channel();
		let queue = Arc::new(Self {
			tx,
			dirty_accounts: Mutex::new(HashMap::new()),
			dirty_channels: Mutex::new(HashMap::new()),
			debounce,
		});
		(queue, rx)
	}

	fn flag_for_account(&self, username: &Username) -> Arc<AtomicBool> {
		let mut flags = self.dirty_accounts.lock().unwrap_or_else(|e| e.into_inner());
		Arc::clone(flags.entry(username.clone()).or_default())
	}

	fn flag_for_channel(&self, name: &ChannelName) -> Arc<AtomicBool> {
		let mut flags = self.dirty_channels.lock().unwrap_or_else(|e| e.into_inner());
		Arc::clone(flags.entry(name.clone()).or_default())
	}

	pub fn mark_account_dirty(&self, username: &Username) {
		let flag = self.flag_for_account(username);
		if !flag.swap(true, Ordering::AcqRel) {
			let _ = self.tx.send(PersistJob::Account(username.clone()));
		}
	}

	pub fn mark_channel_dirty(&self, name: &ChannelName) {
		let flag = self.flag_for_channel(name);
		if !flag.swap(true, Ordering::AcqRel) {
			let _ = self.tx.send(PersistJob::Channel(name.clone()));
		}
	}

	/// Drop bookkeeping for an account that was evicted from memory.
	pub fn forget_account(&self, username: &Username) {
		let mut flags = self.dirty_accounts.lock().unwrap_or_else(|e| e.into_inner());
		flags.remove(username);
	}

	/// Single-consumer flush loop; run as a background task.
	pub async fn run(
		self: Arc<Self>,
		mut rx: mpsc::UnboundedReceiver<PersistJob>,
		source: Arc<dyn SnapshotSource>,
		accounts: Arc<dyn AccountStore>,
		channels: Arc<dyn ChannelStore>,
	) {
		while let Some(job) = rx.recv().await {
			match job {
				PersistJob::Account(username) => {
					self.flag_for_account(&username).store(false, Ordering::Release);
					if let Some(document) = source.account_snapshot(&username).await {
						match accounts.save_account(&username, &document).await {
							Ok(()) => {
								metrics::counter!("delegate_server_persistence_flushes_total").increment(1);
								debug!(username = %username, "flushed account");
							}
							Err(e) => warn!(username = %username, error = %e, "account flush failed"),
						}
					}
				}
				PersistJob::Channel(name) => {
					self.flag_for_channel(&name).store(false, Ordering::Release);
					if let Some(document) = source.channel_snapshot(&name).await {
						match channels.save_channel(&name, &document).await {
							Ok(()) => {
								metrics::counter!("delegate_server_persistence_flushes_total").increment(1);
								debug!(channel = %name, "flushed channel");
							}
							Err(e) => warn!(channel = %name, error = %e, "channel flush failed"),
						}
					}
				}
			}

			tokio::time::sleep(self.debounce).await;
		}
	}
}
