#![forbid(unsafe_code)]

use async_trait::async_trait;
use delegate_domain::{AccountDocument, ChannelDocument, ChannelName, Username};
use sqlx::Row as _;
use tracing::info;

use crate::{AccountStore, ChannelStore, NewAccount, StoreError};

/// sqlx-backed store. Documents are stored as JSON text, one row per
/// account/channel, matching the get/set-by-id contract of the traits.
#[derive(Clone)]
pub struct SqlStore {
	backend: Backend,
}

#[derive(Clone)]
enum Backend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl SqlStore {
	/// Connect by database URL (`sqlite:` or `postgres:`) and create the
	/// tables if they do not already exist.
	pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
		let backend = if database_url.starts_with("sqlite:") {
			Backend::Sqlite(sqlx::SqlitePool::connect(database_url).await?)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			Backend::Postgres(sqlx::PgPool::connect(database_url).await?)
		} else {
			return Err(StoreError::Database(sqlx::Error::Configuration(
				format!("unsupported database_url: {database_url}").into(),
			)));
		};

		let store = Self { backend };
		store.ensure_schema().await?;
		info!("store connected");
		Ok(store)
	}

	async fn ensure_schema(&self) -> Result<(), StoreError> {
		const ACCOUNTS: &str = "CREATE TABLE IF NOT EXISTS accounts \
			(username TEXT PRIMARY KEY, created BIGINT NOT NULL, settings TEXT NOT NULL, \
			passhash TEXT NOT NULL, tfa TEXT DEFAULT NULL)";
		const CHANNELS: &str = "CREATE TABLE IF NOT EXISTS channels \
			(channel TEXT PRIMARY KEY, created BIGINT NOT NULL, settings TEXT NOT NULL)";

		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query(ACCOUNTS).execute(pool).await?;
				sqlx::query(CHANNELS).execute(pool).await?;
			}
			Backend::Postgres(pool) => {
				sqlx::query(ACCOUNTS).execute(pool).await?;
				sqlx::query(CHANNELS).execute(pool).await?;
			}
		}

		Ok(())
	}

	async fn account_column(&self, username: &Username, column: &'static str) -> Result<Option<String>, StoreError> {
		let row = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query(&format!("SELECT {column} FROM accounts WHERE username = ?"))
					.bind(username.as_str())
					.fetch_optional(pool)
					.await?
					.map(|r| r.try_get::<Option<String>, _>(0))
			}
			Backend::Postgres(pool) => {
				sqlx::query(&format!("SELECT {column} FROM accounts WHERE username = $1"))
					.bind(username.as_str())
					.fetch_optional(pool)
					.await?
					.map(|r| r.try_get::<Option<String>, _>(0))
			}
		};

		match row {
			None => Err(StoreError::AccountNotFound(username.clone())),
			Some(value) => Ok(value?),
		}
	}
}

#[async_trait]
impl AccountStore for SqlStore {
	async fn account_exists(&self, username: &Username) -> Result<bool, StoreError> {
		let found = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query("SELECT 1 FROM accounts WHERE username = ?")
					.bind(username.as_str())
					.fetch_optional(pool)
					.await?
					.is_some()
			}
			Backend::Postgres(pool) => {
				sqlx::query("SELECT 1 FROM accounts WHERE username = $1")
					.bind(username.as_str())
					.fetch_optional(pool)
					.await?
					.is_some()
			}
		};

		Ok(found)
	}

	async fn register_account(&self, account: NewAccount) -> Result<(), StoreError> {
		if self.account_exists(&account.username).await? {
			return Err(StoreError::AccountExists(account.username));
		}

		let settings = serde_json::to_string(&account.document)?;

		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query("INSERT INTO accounts (username, created, settings, passhash) VALUES (?, ?, ?, ?)")
					.bind(account.username.as_str())
					.bind(account.created)
					.bind(settings)
					.bind(&account.password_hash)
					.execute(pool)
					.await?;
			}
			Backend::Postgres(pool) => {
				sqlx::query("INSERT INTO accounts (username, created, settings, passhash) VALUES ($1, $2, $3, $4)")
					.bind(account.username.as_str())
					.bind(account.created)
					.bind(settings)
					.bind(&account.password_hash)
					.execute(pool)
					.await?;
			}
		}

		Ok(())
	}

	async fn load_account(&self, username: &Username) -> Result<AccountDocument, StoreError> {
		let settings = self
			.account_column(username, "settings")
			.await?
			.ok_or_else(|| StoreError::AccountNotFound(username.clone()))?;
		Ok(serde_json::from_str(&settings)?)
	}

	async fn save_account(&self, username: &Username, document: &AccountDocument) -> Result<(), StoreError> {
		let settings = serde_json::to_string(document)?;

		let rows = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query("UPDATE accounts SET settings = ? WHERE username = ?")
					.bind(settings)
					.bind(username.as_str())
					.execute(pool)
					.await?
					.rows_affected()
			}
			Backend::Postgres(pool) => {
				sqlx::query("UPDATE accounts SET settings = $1 WHERE username = $2")
					.bind(settings)
					.bind(username.as_str())
					.execute(pool)
					.await?
					.rows_affected()
			}
		};

		if rows == 0 {
			return Err(StoreError::AccountNotFound(username.clone()));
		}
		Ok(())
	}

	async fn password_hash(&self, username: &Username) -> Result<String, StoreError> {
		self.account_column(username, "passhash")
			.await?
			.ok_or_else(|| StoreError::AccountNotFound(username.clone()))
	}

	async fn totp_secret(&self, username: &Username) -> Result<Option<String>, StoreError> {
		self.account_column(username, "tfa").await
	}

	async fn set_totp_secret(&self, username: &Username, secret: &str) -> Result<(), StoreError> {
		let rows = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query("UPDATE accounts SET tfa = ? WHERE username = ?")
					.bind(secret)
					.bind(username.as_str())
					.execute(pool)
					.await?
					.rows_affected()
			}
			Backend::Postgres(pool) => {
				sqlx::query("UPDATE accounts SET tfa = $1 WHERE username = $2")
					.bind(secret)
					.bind(username.as_str())
					.execute(pool)
					.await?
					.rows_affected()
			}
		};

		if rows == 0 {
			return Err(StoreError::AccountNotFound(username.clone()));
		}
		Ok(())
	}
}

#[async_trait]
impl ChannelStore for SqlStore {
	async fn channel_exists(&self, name: &ChannelName) -> Result<bool, StoreError> {
		let found = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query("SELECT 1 FROM channels WHERE channel = ?")
					.bind(name.as_str())
					.fetch_optional(pool)
					.await?
					.is_some()
			}
			Backend::Postgres(pool) => {
				sqlx::query("SELECT 1 FROM channels WHERE channel = $1")
					.bind(name.as_str())
					.fetch_optional(pool)
					.await?
					.is_some()
			}
		};

		Ok(found)
	}

	async fn register_channel(&self, name: &ChannelName, document: &ChannelDocument) -> Result<(), StoreError> {
		if self.channel_exists(name).await? {
			return Err(StoreError::ChannelExists(name.clone()));
		}

		let settings = serde_json::to_string(document)?;

		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query("INSERT INTO channels (channel, created, settings) VALUES (?, ?, ?)")
					.bind(name.as_str())
					.bind(document.created)
					.bind(settings)
					.execute(pool)
					.await?;
			}
			Backend::Postgres(pool) => {
				sqlx::query("INSERT INTO channels (channel, created, settings) VALUES ($1, $2, $3)")
					.bind(name.as_str())
					.bind(document.created)
					.bind(settings)
					.execute(pool)
					.await?;
			}
		}

		Ok(())
	}

	async fn load_channel(&self, name: &ChannelName) -> Result<ChannelDocument, StoreError> {
		let settings: String = match &self.backend {
			Backend::Sqlite(pool) => {
				let row = sqlx::query("SELECT settings FROM channels WHERE channel = ?")
					.bind(name.as_str())
					.fetch_optional(pool)
					.await?
					.ok_or_else(|| StoreError::ChannelNotFound(name.clone()))?;
				row.try_get(0)?
			}
			Backend::Postgres(pool) => {
				let row = sqlx::query("SELECT settings FROM channels WHERE channel = $1")
					.bind(name.as_str())
					.fetch_optional(pool)
					.await?
					.ok_or_else(|| StoreError::ChannelNotFound(name.clone()))?;
				row.try_get(0)?
			}
		};

		Ok(serde_json::from_str(&settings)?)
	}

	async fn save_channel(&self, name: &ChannelName, document: &ChannelDocument) -> Result<(), StoreError> {
		let settings = serde_json::to_string(document)?;

		let rows = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query("UPDATE channels SET settings = ? WHERE channel = ?")
					.bind(settings)
					.bind(name.as_str())
					.execute(pool)
					.await?
					.rows_affected()
			}
			Backend::Postgres(pool) => {
				sqlx::query("UPDATE channels SET settings = $1 WHERE channel = $2")
					.bind(settings)
					.bind(name.as_str())
					.execute(pool)
					.await?
					.rows_affected()
			}
		};

		if rows == 0 {
			return Err(StoreError::ChannelNotFound(name.clone()));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use delegate_domain::{ChannelDocument, default_account_document};
	use serde_json::json;

	use super::*;

	fn alice() -> Username {
		Username::new("alice").unwrap()
	}

	/// Named shared-cache memory database, so every pool connection sees
	/// the same data.
	async fn store(name: &str) -> SqlStore {
		SqlStore::connect(&format!("sqlite:file:{name}?mode=memory&cache=shared"))
			.await
			.unwrap()
	}

	#[tokio::test]
	async fn account_updates_round_trip_and_report_missing_rows() {
		let store = store("sql_accounts").await;

		store
			.register_account(NewAccount {
				username: alice(),
				created: 7,
				document: default_account_document(7, false),
				password_hash: "h".into(),
			})
			.await
			.unwrap();

		let mut doc = store.load_account(&alice()).await.unwrap();
		doc.set("name", json!("Alice"));
		store.save_account(&alice(), &doc).await.unwrap();
		assert_eq!(store.load_account(&alice()).await.unwrap().get("name"), Some(&json!("Alice")));

		let nobody = Username::new("nobody").unwrap();
		assert!(matches!(
			store.save_account(&nobody, &doc).await,
			Err(StoreError::AccountNotFound(_))
		));
	}

	#[tokio::test]
	async fn totp_secret_is_null_until_set() {
		let store = store("sql_totp").await;

		store
			.register_account(NewAccount {
				username: alice(),
				created: 0,
				document: default_account_document(0, false),
				password_hash: "h".into(),
			})
			.await
			.unwrap();

		assert_eq!(store.totp_secret(&alice()).await.unwrap(), None);
		store.set_totp_secret(&alice(), "s3cret").await.unwrap();
		assert_eq!(store.totp_secret(&alice()).await.unwrap(), Some("s3cret".to_string()));

		let nobody = Username::new("nobody").unwrap();
		assert!(matches!(
			store.set_totp_secret(&nobody, "x").await,
			Err(StoreError::AccountNotFound(_))
		));
	}

	#[tokio::test]
	async fn channel_updates_round_trip_and_report_missing_rows() {
		let store = store("sql_channels").await;
		let name = ChannelName::new("general").unwrap();

		let mut doc = ChannelDocument::new(alice(), 9, false);
		store.register_channel(&name, &doc).await.unwrap();
		assert!(store.channel_exists(&name).await.unwrap());

		doc.settings.insert("description".into(), json!("the commons"));
		store.save_channel(&name, &doc).await.unwrap();
		assert_eq!(store.load_channel(&name).await.unwrap(), doc);

		let missing = ChannelName::new("missing").unwrap();
		assert!(matches!(
			store.load_channel(&missing).await,
			Err(StoreError::ChannelNotFound(_))
		));
		assert!(matches!(
			store.save_channel(&missing, &doc).await,
			Err(StoreError::ChannelNotFound(_))
		));
	}
}
