#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::{UserStatus, Username};

/// A settings document: dynamic key → value map, keys following the
/// qualifier key-name convention (`&`, `$`, `!` prefixes).
pub type SettingsDocument = Map<String, Value>;

/// Entry in the privacy whitelist for one private setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WhitelistEntry {
	/// `null` sentinel: the privacy rule is waived for friends only.
	FriendsOnly,
	/// Explicit usernames exempted from the privacy rule.
	Users(Vec<Username>),
}

/// The persisted account document, as stored by the `AccountStore`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountDocument {
	pub settings: SettingsDocument,
}

impl AccountDocument {
	pub fn get(&self, key: &str) -> Option<&Value> {
		self.settings.get(key)
	}

	pub fn set(&mut self, key: impl Into<String>, value: Value) {
		self.settings.insert(key.into(), value);
	}

	/// Names stored under a list-valued setting such as `!friends`.
	pub fn name_list(&self, key: &str) -> Vec<String> {
		self.settings
			.get(key)
			.and_then(Value::as_array)
			.map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
			.unwrap_or_default()
	}

	pub fn list_contains(&self, key: &str, name: &str) -> bool {
		self.settings
			.get(key)
			.and_then(Value::as_array)
			.is_some_and(|a| a.iter().any(|v| v.as_str() == Some(name)))
	}

	/// Append to a list-valued setting, skipping duplicates.
	pub fn list_insert(&mut self, key: &str, name: &str) {
		let entry = self.settings.entry(key.to_string()).or_insert_with(|| json!([]));
		if let Some(arr) = entry.as_array_mut()
			&& !arr.iter().any(|v| v.as_str() == Some(name))
		{
			arr.push(Value::String(name.to_string()));
		}
	}

	/// Remove from a list-valued setting. Missing values are a no-op.
	pub fn list_remove(&mut self, key: &str, name: &str) {
		if let Some(arr) = self.settings.get_mut(key).and_then(Value::as_array_mut) {
			arr.retain(|v| v.as_str() != Some(name));
		}
	}

	pub fn friends(&self) -> Vec<String> {
		self.name_list(keys::FRIENDS)
	}

	pub fn is_friend(&self, name: &str) -> bool {
		self.list_contains(keys::FRIENDS, name)
	}

	pub fn has_blocked(&self, name: &str) -> bool {
		self.list_contains(keys::BLOCKED, name)
	}

	pub fn subscribers(&self) -> Vec<String> {
		self.name_list(keys::SUBSCRIPTIONS_TO_ME)
	}

	pub fn channels(&self) -> Vec<String> {
		self.name_list(keys::CHANNELS)
	}

	pub fn bool_setting(&self, key: &str) -> bool {
		self.settings.get(key).and_then(Value::as_bool).unwrap_or(false)
	}

	pub fn status(&self) -> UserStatus {
		self.settings
			.get(keys::STATUS)
			.cloned()
			.and_then(|v| serde_json::from_value(v).ok())
			.unwrap_or(UserStatus::Offline)
	}

	pub fn set_status(&mut self, status: UserStatus) {
		self.set(keys::STATUS, json!(u8::from(status)));
	}

	/// Settings the account has declared private.
	pub fn privated_settings(&self) -> Vec<String> {
		self.name_list(keys::PRIVATED_SETTINGS)
	}

	/// Whitelist map: private setting key → exemption entry.
	pub fn private_whitelist(&self) -> BTreeMap<String, WhitelistEntry> {
		self.settings
			.get(keys::PRIVATE_WHITELIST)
			.and_then(Value::as_object)
			.map(|m| {
				m.iter()
					.filter_map(|(k, v)| {
						serde_json::from_value::<WhitelistEntry>(v.clone())
							.ok()
							.map(|e| (k.clone(), e))
					})
					.collect()
			})
			.unwrap_or_default()
	}
}

/// Well-known setting keys. The prefixes are part of the persisted key
/// names; qualifier classification goes through registered metadata.
pub mod keys {
	pub const CREATION: &str = "$creation";
	pub const STATUS: &str = "$status";
	pub const BOT: &str = "$bot";

	pub const CHANNELS: &str = "!channels";
	pub const GROUP_CHANNELS: &str = "!gchannels";
	pub const BLOCKED: &str = "!blocked";
	pub const FRIENDS: &str = "!friends";
	pub const FRIEND_REQUESTS: &str = "!friendreqs";
	pub const SUBSCRIPTIONS_TO: &str = "!subscriptionsto";
	pub const SUBSCRIPTIONS_TO_ME: &str = "!subscriptionstome";
	pub const PRIVATED_SETTINGS: &str = "!privatedsettings";
	pub const PRIVATE_WHITELIST: &str = "!privatewhitelist";

	pub const INVISIBLE: &str = "&invisible";
	pub const ASOCIAL: &str = "&asocial";
	pub const FRIENDS_ONLY: &str = "&friends_only";
	pub const LONE: &str = "&lone";
	pub const SKEPTIC: &str = "&skeptic";
	pub const FRIENDLY: &str = "&friendly";
	pub const PAGER: &str = "&pager";
	pub const PAGER_LEVEL: &str = "&pager_level";
	pub const TWO_FACTOR: &str = "&2fa";
}

/// The default document written at registration time.
pub fn default_account_document(creation: i64, bot: bool) -> AccountDocument {
	let settings = json!({
		"name": null,
		"dnd": false,
		"status_text": null,
		"description": null,
		"avatar": null,
		keys::CREATION: creation,
		keys::CHANNELS: [],
		keys::GROUP_CHANNELS: [],
		keys::BLOCKED: [],
		keys::FRIENDS: [],
		keys::FRIEND_REQUESTS: [],
		keys::SUBSCRIPTIONS_TO: [],
		keys::SUBSCRIPTIONS_TO_ME: [],
		keys::PRIVATED_SETTINGS: [],
		keys::PRIVATE_WHITELIST: {},
		keys::BOT: bot,
		keys::INVISIBLE: true,
		keys::ASOCIAL: false,
		keys::FRIENDS_ONLY: false,
		keys::LONE: false,
		keys::SKEPTIC: false,
		keys::FRIENDLY: true,
		keys::STATUS: u8::from(crate::UserStatus::Online),
		keys::PAGER: null,
		keys::PAGER_LEVEL: 0,
		keys::TWO_FACTOR: false,
	});

	let Value::Object(settings) = settings else {
		unreachable!("default settings literal is an object");
	};

	AccountDocument { settings }
}
