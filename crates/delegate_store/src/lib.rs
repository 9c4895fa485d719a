#![forbid(unsafe_code)]

//! Durable key-value persistence for account and channel documents.
//!
//! The runtime talks to storage only through [`AccountStore`] and
//! [`ChannelStore`]; the SQL schema behind the sqlx backend is an
//! implementation detail. [`MemoryStore`] backs tests and servers running
//! without a database.

pub mod memory;
pub mod sql;

use async_trait::async_trait;
use delegate_domain::{AccountDocument, ChannelDocument, ChannelName, Username};
use thiserror::Error;

pub use memory::MemoryStore;
pub use sql::SqlStore;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("no such account: {0}")]
	AccountNotFound(Username),

	#[error("account already exists: {0}")]
	AccountExists(Username),

	#[error("no such channel: {0}")]
	ChannelNotFound(ChannelName),

	#[error("channel already exists: {0}")]
	ChannelExists(ChannelName),

	#[error("document encode/decode error: {0}")]
	Codec(#[from] serde_json::Error),

	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),
}

/// A freshly registered account row.
#[derive(Debug, Clone)]
pub struct NewAccount {
	pub username: Username,
	pub created: i64,
	pub document: AccountDocument,
	pub password_hash: String,
}

/// Durable account persistence, get/set by username.
#[async_trait]
pub trait AccountStore: Send + Sync {
	async fn account_exists(&self, username: &Username) -> Result<bool, StoreError>;

	/// Persist a new account. Fails with [`StoreError::AccountExists`] on a
	/// duplicate username.
	async fn register_account(&self, account: NewAccount) -> Result<(), StoreError>;

	async fn load_account(&self, username: &Username) -> Result<AccountDocument, StoreError>;

	/// Overwrite the full persisted document.
	async fn save_account(&self, username: &Username, document: &AccountDocument) -> Result<(), StoreError>;

	async fn password_hash(&self, username: &Username) -> Result<String, StoreError>;

	/// The stored TOTP secret, `None` when two-factor is not set up.
	async fn totp_secret(&self, username: &Username) -> Result<Option<String>, StoreError>;

	async fn set_totp_secret(&self, username: &Username, secret: &str) -> Result<(), StoreError>;
}

/// Durable channel persistence, get/set by channel name.
#[async_trait]
pub trait ChannelStore: Send + Sync {
	async fn channel_exists(&self, name: &ChannelName) -> Result<bool, StoreError>;

	/// Persist a new channel. Fails with [`StoreError::ChannelExists`] on a
	/// duplicate name.
	async fn register_channel(&self, name: &ChannelName, document: &ChannelDocument) -> Result<(), StoreError>;

	async fn load_channel(&self, name: &ChannelName) -> Result<ChannelDocument, StoreError>;

	async fn save_channel(&self, name: &ChannelName, document: &ChannelDocument) -> Result<(), StoreError>;
}
