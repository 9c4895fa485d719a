#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use delegate_domain::{ChannelDocument, OWNER_ROLE, Permission, Username};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PermissionError {
	#[error("new order is not a permutation of the defined roles")]
	RoleSetMismatch,

	#[error("reorder would move a role at or above the actor's rank")]
	InsufficientPrivilege,

	#[error("not a member of the channel: {0}")]
	NotMember(Username),
}

/// All permissions of one member. The owner role conceptually grants
/// everything; callers should prefer [`has_permission`].
pub fn permissions_of(channel: &ChannelDocument, username: &Username) -> BTreeSet<Permission> {
	let Some(role) = channel.role_of(username) else {
		return BTreeSet::new();
	};
	channel.roles.get(role).cloned().unwrap_or_default()
}

/// Channel- or subchannel-scoped permission check.
///
/// Owner implies everything. `Admin` (granted at either scope) implies
/// everything except deleting the channel itself. With a subchannel, the
/// role's override set there is unioned with its channel-level set.
pub fn has_permission(
	channel: &ChannelDocument,
	username: &Username,
	permission: Permission,
	subchannel: Option<&str>,
) -> bool {
	let Some(role) = channel.role_of(username) else {
		return false;
	};
	if role == OWNER_ROLE {
		return true;
	}

	let channel_perms = channel.roles.get(role);
	let override_perms = subchannel
		.and_then(|name| channel.subchannels.get(name))
		.and_then(|sub| sub.overrides.get(role));

	let holds = |p: Permission| {
		channel_perms.is_some_and(|set| set.contains(&p)) || override_perms.is_some_and(|set| set.contains(&p))
	};

	if holds(permission) {
		return true;
	}
	permission != Permission::DeleteChannel && holds(Permission::Admin)
}

/// Moderation precedence: strictly lower role index wins.
pub fn can_moderate(channel: &ChannelDocument, actor: &Username, target: &Username) -> bool {
	let actor_idx = channel.role_of(actor).and_then(|r| channel.role_index(r));
	let target_idx = channel.role_of(target).and_then(|r| channel.role_index(r));
	match (actor_idx, target_idx) {
		(Some(a), Some(t)) => a < t,
		_ => false,
	}
}

/// Replace the channel's role order with `new_order`.
///
/// The new order must be a permutation of the defined role set, and every
/// role at an index at or above the actor's current rank must keep its
/// index. The order is only replaced on success.
pub fn reorder_roles(
	channel: &mut ChannelDocument,
	actor: &Username,
	new_order: Vec<String>,
) -> Result<(), PermissionError> {
	let actor_role = channel
		.role_of(actor)
		.ok_or_else(|| PermissionError::NotMember(actor.clone()))?;
	let actor_idx = channel
		.role_index(actor_role)
		.ok_or(PermissionError::RoleSetMismatch)?;

	let old_set: BTreeSet<&str> = channel.order.iter().map(String::as_str).collect();
	let new_set: BTreeSet<&str> = new_order.iter().map(String::as_str).collect();
	if old_set != new_set || new_order.len() != channel.order.len() {
		return Err(PermissionError::RoleSetMismatch);
	}

	for (idx, role) in channel.order.iter().enumerate().take(actor_idx + 1) {
		if new_order.get(idx) != Some(role) {
			return Err(PermissionError::InsufficientPrivilege);
		}
	}

	channel.order = new_order;
	Ok(())
}
