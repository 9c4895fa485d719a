#![forbid(unsafe_code)]

use std::collections::HashMap;

use delegate_domain::account::keys;
use delegate_domain::{AccountDocument, Qualifier, WhitelistEntry};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettingsError {
	#[error("setting is immutable: {0}")]
	Immutable(String),

	#[error("wrong type for setting: {0}")]
	WrongType(String),

	#[error("value out of range for setting: {0}")]
	OutOfRange(String),

	#[error("settings are mutually exclusive: {key} and {other}")]
	MutuallyExclusive { key: String, other: String },

	#[error("free setting cap reached ({0})")]
	FreeSettingCap(usize),
}

/// Registered value type for a setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
	Bool,
	Int,
	Text,
}

/// Registered numeric or length range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingRange {
	Int(i64, i64),
	Len(usize, usize),
}

/// Registered metadata for one setting key. The qualifier lives here, not
/// in the key's leading character; the prefix convention survives only in
/// persisted key names and as the fallback for unregistered keys.
#[derive(Debug, Clone)]
pub struct SettingInfo {
	pub qualifier: Qualifier,
	pub kind: SettingKind,
	pub nullable: bool,
	pub range: Option<SettingRange>,
	/// Changes to special settings are broadcast to subscribers and friends.
	pub special: bool,
	/// Sibling keys that cannot be true at the same time as this one.
	pub conflicts: &'static [&'static str],
}

impl SettingInfo {
	fn new(qualifier: Qualifier, kind: SettingKind) -> Self {
		Self {
			qualifier,
			kind,
			nullable: false,
			range: None,
			special: false,
			conflicts: &[],
		}
	}

	fn nullable(mut self) -> Self {
		self.nullable = true;
		self
	}

	fn range(mut self, range: SettingRange) -> Self {
		self.range = Some(range);
		self
	}

	fn special(mut self) -> Self {
		self.special = true;
		self
	}

	fn conflicts(mut self, keys: &'static [&'static str]) -> Self {
		self.conflicts = keys;
		self
	}
}

/// Validates and classifies account settings.
pub struct SettingsEngine {
	registered: HashMap<&'static str, SettingInfo>,
	free_setting_cap: usize,
	free_setting_value_len: usize,
}

impl SettingsEngine {
	pub fn new(free_setting_cap: usize, free_setting_value_len: usize) -> Self {
		use Qualifier::{Immutable, Private, PrivateImmutable, Public};
		use SettingKind::{Bool, Int, Text};

		let mut registered = HashMap::new();
		let mut reg = |key: &'static str, info: SettingInfo| {
			registered.insert(key, info);
		};

		reg(
			"name",
			SettingInfo::new(Public, Text)
				.nullable()
				.range(SettingRange::Len(1, 48))
				.special(),
		);
		reg("dnd", SettingInfo::new(Public, Bool).special());
		reg(
			"status_text",
			SettingInfo::new(Public, Text)
				.nullable()
				.range(SettingRange::Len(0, 128))
				.special(),
		);
		reg(
			"description",
			SettingInfo::new(Public, Text)
				.nullable()
				.range(SettingRange::Len(0, 1024))
				.special(),
		);
		reg("avatar", SettingInfo::new(Public, Text).nullable().special());

		reg(keys::INVISIBLE, SettingInfo::new(Private, Bool));
		reg(
			keys::ASOCIAL,
			SettingInfo::new(Private, Bool).conflicts(&[keys::FRIENDS_ONLY]),
		);
		reg(
			keys::FRIENDS_ONLY,
			SettingInfo::new(Private, Bool).conflicts(&[keys::ASOCIAL]),
		);
		reg(keys::LONE, SettingInfo::new(Private, Bool).conflicts(&[keys::SKEPTIC]));
		reg(keys::SKEPTIC, SettingInfo::new(Private, Bool).conflicts(&[keys::LONE]));
		reg(keys::FRIENDLY, SettingInfo::new(Private, Bool));
		reg(keys::PAGER, SettingInfo::new(Private, Text).nullable());
		reg(
			keys::PAGER_LEVEL,
			SettingInfo::new(Private, Int).range(SettingRange::Int(0, 3)),
		);
		reg(keys::TWO_FACTOR, SettingInfo::new(Private, Bool));

		reg(keys::CREATION, SettingInfo::new(Immutable, Int));
		reg(keys::STATUS, SettingInfo::new(Immutable, Int).range(SettingRange::Int(0, 2)).special());
		reg(keys::BOT, SettingInfo::new(Immutable, Bool));

		for key in [
			keys::CHANNELS,
			keys::GROUP_CHANNELS,
			keys::BLOCKED,
			keys::FRIENDS,
			keys::FRIEND_REQUESTS,
			keys::SUBSCRIPTIONS_TO,
			keys::SUBSCRIPTIONS_TO_ME,
			keys::PRIVATED_SETTINGS,
			keys::PRIVATE_WHITELIST,
		] {
			reg(key, SettingInfo::new(PrivateImmutable, Text).nullable());
		}

		Self {
			registered,
			free_setting_cap,
			free_setting_value_len,
		}
	}

	pub fn info(&self, key: &str) -> Option<&SettingInfo> {
		self.registered.get(key)
	}

	pub fn is_registered(&self, key: &str) -> bool {
		self.registered.contains_key(key)
	}

	/// Qualifier of a key: registered metadata first, key-prefix fallback
	/// for free settings.
	pub fn classify(&self, key: &str) -> Qualifier {
		self.registered
			.get(key)
			.map(|info| info.qualifier)
			.unwrap_or_else(|| Qualifier::from_key(key))
	}

	pub fn is_special(&self, key: &str) -> bool {
		self.registered.get(key).is_some_and(|info| info.special)
	}

	/// The special subset of a batch of changed keys, in batch order.
	pub fn special_subset<'a>(&self, changed: impl IntoIterator<Item = &'a str>) -> Vec<String> {
		changed
			.into_iter()
			.filter(|k| self.is_special(k))
			.map(str::to_string)
			.collect()
	}

	/// Reject client writes to immutable keys. Runs before validation.
	pub fn check_client_mutable(&self, key: &str) -> Result<(), SettingsError> {
		if self.classify(key).client_mutable() {
			Ok(())
		} else {
			Err(SettingsError::Immutable(key.to_string()))
		}
	}

	/// Validate one key/value pair against registered constraints and the
	/// rest of the document.
	pub fn validate(&self, document: &AccountDocument, key: &str, value: &Value) -> Result<(), SettingsError> {
		let Some(info) = self.registered.get(key) else {
			return self.validate_free(document, key, value);
		};

		if value.is_null() {
			if info.nullable {
				return Ok(());
			}
			return Err(SettingsError::WrongType(key.to_string()));
		}

		match info.kind {
			SettingKind::Bool => {
				if !value.is_boolean() {
					return Err(SettingsError::WrongType(key.to_string()));
				}
			}
			SettingKind::Int => {
				let Some(n) = value.as_i64() else {
					return Err(SettingsError::WrongType(key.to_string()));
				};
				if let Some(SettingRange::Int(min, max)) = info.range
					&& !(min..=max).contains(&n)
				{
					return Err(SettingsError::OutOfRange(key.to_string()));
				}
			}
			SettingKind::Text => {
				let Some(s) = value.as_str() else {
					return Err(SettingsError::WrongType(key.to_string()));
				};
				if let Some(SettingRange::Len(min, max)) = info.range
					&& !(min..=max).contains(&s.chars().count())
				{
					return Err(SettingsError::OutOfRange(key.to_string()));
				}
			}
		}

		if value.as_bool() == Some(true) {
			for other in info.conflicts {
				if document.bool_setting(other) {
					return Err(SettingsError::MutuallyExclusive {
						key: key.to_string(),
						other: (*other).to_string(),
					});
				}
			}
		}

		Ok(())
	}

	/// Unregistered (free) settings: scalar values only, capped count and
	/// string length.
	fn validate_free(&self, document: &AccountDocument, key: &str, value: &Value) -> Result<(), SettingsError> {
		match value {
			Value::Null | Value::Bool(_) | Value::Number(_) => {}
			Value::String(s) => {
				if s.chars().count() > self.free_setting_value_len {
					return Err(SettingsError::OutOfRange(key.to_string()));
				}
			}
			Value::Array(_) | Value::Object(_) => {
				return Err(SettingsError::WrongType(key.to_string()));
			}
		}

		let free_count = document
			.settings
			.keys()
			.filter(|k| !self.is_registered(k))
			.count();
		if document.get(key).is_none() && free_count >= self.free_setting_cap {
			return Err(SettingsError::FreeSettingCap(self.free_setting_cap));
		}

		Ok(())
	}

	/// Visibility of `key` on `owner_doc` for `requester`.
	///
	/// The owner sees everything. Others see a setting unless it is
	/// private, where private means an inherently private qualifier or a
	/// key the owner declared private. A private setting is still visible
	/// to explicitly whitelisted requesters, or to friends when the
	/// whitelist entry is the friends-only sentinel.
	pub fn is_visible(&self, owner_doc: &AccountDocument, owner: &str, requester: &str, key: &str) -> bool {
		if owner == requester {
			return true;
		}

		let declared_private = owner_doc.list_contains(keys::PRIVATED_SETTINGS, key);
		if !self.classify(key).inherently_private() && !declared_private {
			return true;
		}

		match owner_doc.private_whitelist().get(key) {
			Some(WhitelistEntry::Users(users)) => users.iter().any(|u| u.as_str() == requester),
			Some(WhitelistEntry::FriendsOnly) => owner_doc.is_friend(requester),
			None => false,
		}
	}
}
