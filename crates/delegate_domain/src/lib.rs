#![forbid(unsafe_code)]

pub mod account;
pub mod channel;

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use account::{AccountDocument, SettingsDocument, WhitelistEntry, default_account_document};
pub use channel::{ChannelDocument, MemberRecord, Subchannel};

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
}

/// Unique account identifier. Usernames are immutable once registered;
/// length/regex regulations are enforced at registration time by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
	/// Create a non-empty `Username`.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		if name.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(name))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Username {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Username {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Username::new(s.to_string())
	}
}

/// Unique channel identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
	/// Create a non-empty `ChannelName`.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		if name.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(name))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ChannelName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelName::new(s.to_string())
	}
}

/// Visibility/mutability class of a setting key.
///
/// Registered settings carry an explicit qualifier in their metadata; the
/// leading-character convention (`&`, `$`, `!`) survives only in persisted
/// key names and as a fallback classification for unregistered (free) keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Qualifier {
	Public,
	Private,
	Immutable,
	PrivateImmutable,
}

impl Qualifier {
	/// Fallback classification for keys with no registered metadata.
	pub fn from_key(key: &str) -> Self {
		match key.chars().next() {
			Some('&') => Qualifier::Private,
			Some('$') => Qualifier::Immutable,
			Some('!') => Qualifier::PrivateImmutable,
			_ => Qualifier::Public,
		}
	}

	/// Whether a client may write this setting at all.
	pub fn client_mutable(self) -> bool {
		matches!(self, Qualifier::Public | Qualifier::Private)
	}

	/// Whether the key is private by qualifier alone (before per-account
	/// privacy declarations are consulted).
	pub fn inherently_private(self) -> bool {
		matches!(self, Qualifier::Private | Qualifier::PrivateImmutable)
	}
}

/// Presence status, stored in the `$status` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum UserStatus {
	Online,
	Away,
	Offline,
}

impl From<UserStatus> for u8 {
	fn from(s: UserStatus) -> u8 {
		match s {
			UserStatus::Online => 0,
			UserStatus::Away => 1,
			UserStatus::Offline => 2,
		}
	}
}

impl TryFrom<u8> for UserStatus {
	type Error = String;

	fn try_from(v: u8) -> Result<Self, Self::Error> {
		match v {
			0 => Ok(UserStatus::Online),
			1 => Ok(UserStatus::Away),
			2 => Ok(UserStatus::Offline),
			other => Err(format!("unknown user status: {other}")),
		}
	}
}

/// Channel-scoped permissions. `Admin` implies everything except
/// `DeleteChannel`; the owner role implies everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
	Admin,
	DeleteChannel,
	ManageRoles,
	ManageSubchannels,
	ManageSettings,
	Ban,
	Mute,
	Kick,
	Invite,
	Send,
	Read,
}

/// Role name that is always maximally powerful when present.
pub const OWNER_ROLE: &str = "owner";

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn qualifier_fallback_follows_key_prefix() {
		assert_eq!(Qualifier::from_key("name"), Qualifier::Public);
		assert_eq!(Qualifier::from_key("&asocial"), Qualifier::Private);
		assert_eq!(Qualifier::from_key("$creation"), Qualifier::Immutable);
		assert_eq!(Qualifier::from_key("!friends"), Qualifier::PrivateImmutable);
	}

	#[test]
	fn immutable_qualifiers_are_not_client_mutable() {
		assert!(Qualifier::Public.client_mutable());
		assert!(Qualifier::Private.client_mutable());
		assert!(!Qualifier::Immutable.client_mutable());
		assert!(!Qualifier::PrivateImmutable.client_mutable());
	}

	#[test]
	fn status_round_trips_as_integer() {
		let v = serde_json::to_value(UserStatus::Offline).unwrap();
		assert_eq!(v, serde_json::json!(2));
		let back: UserStatus = serde_json::from_value(v).unwrap();
		assert_eq!(back, UserStatus::Offline);
	}

	#[test]
	fn empty_identifiers_are_rejected() {
		assert!(Username::new("  ").is_err());
		assert!(ChannelName::new("").is_err());
		assert!("alice".parse::<Username>().is_ok());
	}
}
