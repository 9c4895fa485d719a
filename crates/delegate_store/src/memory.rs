#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use delegate_domain::{AccountDocument, ChannelDocument, ChannelName, Username};
use tokio::sync::Mutex;

use crate::{AccountStore, ChannelStore, NewAccount, StoreError};

#[derive(Debug)]
struct AccountRow {
	document: AccountDocument,
	password_hash: String,
	totp_secret: Option<String>,
}

/// In-memory store used by tests and database-less servers.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
	accounts: Arc<Mutex<HashMap<Username, AccountRow>>>,
	channels: Arc<Mutex<HashMap<ChannelName, ChannelDocument>>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl AccountStore for MemoryStore {
	async fn account_exists(&self, username: &Username) -> Result<bool, StoreError> {
		Ok(self.accounts.lock().await.contains_key(username))
	}

	async fn register_account(&self, account: NewAccount) -> Result<(), StoreError> {
		let mut accounts = self.accounts.lock().await;
		if accounts.contains_key(&account.username) {
			return Err(StoreError::AccountExists(account.username));
		}

		accounts.insert(
			account.username,
			AccountRow {
				document: account.document,
				password_hash: account.password_hash,
				totp_secret: None,
			},
		);
		Ok(())
	}

	async fn load_account(&self, username: &Username) -> Result<AccountDocument, StoreError> {
		self.accounts
			.lock()
			.await
			.get(username)
			.map(|row| row.document.clone())
			.ok_or_else(|| StoreError::AccountNotFound(username.clone()))
	}

	async fn save_account(&self, username: &Username, document: &AccountDocument) -> Result<(), StoreError> {
		let mut accounts = self.accounts.lock().await;
		let row = accounts
			.get_mut(username)
			.ok_or_else(|| StoreError::AccountNotFound(username.clone()))?;
		row.document = document.clone();
		Ok(())
	}

	async fn password_hash(&self, username: &Username) -> Result<String, StoreError> {
		self.accounts
			.lock()
			.await
			.get(username)
			.map(|row| row.password_hash.clone())
			.ok_or_else(|| StoreError::AccountNotFound(username.clone()))
	}

	async fn totp_secret(&self, username: &Username) -> Result<Option<String>, StoreError> {
		self.accounts
			.lock()
			.await
			.get(username)
			.map(|row| row.totp_secret.clone())
			.ok_or_else(|| StoreError::AccountNotFound(username.clone()))
	}

	async fn set_totp_secret(&self, username: &Username, secret: &str) -> Result<(), StoreError> {
		let mut accounts = self.accounts.lock().await;
		let row = accounts
			.get_mut(username)
			.ok_or_else(|| StoreError::AccountNotFound(username.clone()))?;
		row.totp_secret = Some(secret.to_string());
		Ok(())
	}
}

#[async_trait]
impl ChannelStore for MemoryStore {
	async fn channel_exists(&self, name: &ChannelName) -> Result<bool, StoreError> {
		Ok(self.channels.lock().await.contains_key(name))
	}

	async fn register_channel(&self, name: &ChannelName, document: &ChannelDocument) -> Result<(), StoreError> {
		let mut channels = self.channels.lock().await;
		if channels.contains_key(name) {
			return Err(StoreError::ChannelExists(name.clone()));
		}
		channels.insert(name.clone(), document.clone());
		Ok(())
	}

	async fn load_channel(&self, name: &ChannelName) -> Result<ChannelDocument, StoreError> {
		self.channels
			.lock()
			.await
			.get(name)
			.cloned()
			.ok_or_else(|| StoreError::ChannelNotFound(name.clone()))
	}

	async fn save_channel(&self, name: &ChannelName, document: &ChannelDocument) -> Result<(), StoreError> {
		let mut channels = self.channels.lock().await;
		let slot = channels
			.get_mut(name)
			.ok_or_else(|| StoreError::ChannelNotFound(name.clone()))?;
		*slot = document.clone();
		Ok(())
	}
}
