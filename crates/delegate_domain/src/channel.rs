#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::{OWNER_ROLE, Permission, Username};

/// Per-member channel metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
	pub role: String,
	pub joined: i64,
	#[serde(default)]
	pub nickname: Option<String>,
	#[serde(default)]
	pub labels: BTreeSet<String>,
	/// Per-member sent-message counter.
	#[serde(default)]
	pub sent: u64,
	#[serde(default)]
	pub level: i64,
}

impl MemberRecord {
	pub fn new(role: impl Into<String>, joined: i64) -> Self {
		Self {
			role: role.into(),
			joined,
			nickname: None,
			labels: BTreeSet::new(),
			sent: 0,
			level: 0,
		}
	}
}

/// A subchannel: permission overrides layered on top of the channel's
/// role → permission map, plus its own privacy flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subchannel {
	#[serde(default)]
	pub overrides: BTreeMap<String, BTreeSet<Permission>>,
	#[serde(default)]
	pub invisible: bool,
	#[serde(default)]
	pub lockdown: bool,
}

/// The persisted channel document.
///
/// Invariant: `order` always contains exactly the key set of `roles`, with
/// index 0 the most powerful role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDocument {
	pub created: i64,
	pub owner: Username,
	/// Ranked role names, most powerful first.
	pub order: Vec<String>,
	/// Role name → granted permission set.
	pub roles: BTreeMap<String, BTreeSet<Permission>>,
	pub members: BTreeMap<Username, MemberRecord>,
	#[serde(default)]
	pub banned: BTreeSet<String>,
	#[serde(default)]
	pub muted: BTreeSet<String>,
	#[serde(default)]
	pub subchannels: BTreeMap<String, Subchannel>,
	/// Free-form channel settings (description, image, join/leave
	/// messages, ...), same key convention as account settings.
	#[serde(default)]
	pub settings: Map<String, serde_json::Value>,
	#[serde(default)]
	pub group: bool,
}

impl ChannelDocument {
	/// Fresh channel with the implicit `owner` role and a `default` role,
	/// the registering account joined as owner.
	pub fn new(owner: Username, created: i64, group: bool) -> Self {
		let mut roles = BTreeMap::new();
		roles.insert(OWNER_ROLE.to_string(), BTreeSet::new());
		roles.insert("default".to_string(), BTreeSet::from([Permission::Read, Permission::Send]));

		let mut members = BTreeMap::new();
		members.insert(owner.clone(), MemberRecord::new(OWNER_ROLE, created));

		Self {
			created,
			owner,
			order: vec![OWNER_ROLE.to_string(), "default".to_string()],
			roles,
			members,
			banned: BTreeSet::new(),
			muted: BTreeSet::new(),
			subchannels: BTreeMap::new(),
			settings: Map::new(),
			group,
		}
	}

	pub fn member(&self, username: &Username) -> Option<&MemberRecord> {
		self.members.get(username)
	}

	pub fn role_of(&self, username: &Username) -> Option<&str> {
		self.members.get(username).map(|m| m.role.as_str())
	}

	/// Rank of a role in the order, 0 the most powerful.
	pub fn role_index(&self, role: &str) -> Option<usize> {
		self.order.iter().position(|r| r == role)
	}
}
