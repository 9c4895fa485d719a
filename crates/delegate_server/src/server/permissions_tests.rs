use std::collections::BTreeSet;

use delegate_domain::{ChannelDocument, MemberRecord, OWNER_ROLE, Permission, Subchannel, Username};

use crate::server::permissions::{PermissionError, can_moderate, has_permission, reorder_roles};

fn user(name: &str) -> Username {
	Username::new(name).unwrap()
}

/// Channel with roles owner > moderator > default and one member per role.
fn three_role_channel() -> ChannelDocument {
	let mut doc = ChannelDocument::new(user("bob"), 100, false);
	doc.roles.insert(
		"moderator".to_string(),
		BTreeSet::from([Permission::Read, Permission::Send, Permission::Mute, Permission::Kick]),
	);
	doc.order = vec![OWNER_ROLE.to_string(), "moderator".to_string(), "default".to_string()];
	doc.members.insert(user("mallory"), MemberRecord::new("moderator", 101));
	doc.members.insert(user("dave"), MemberRecord::new("default", 102));
	doc
}

#[test]
fn owner_holds_every_permission_regardless_of_registered_sets() {
	let doc = three_role_channel();
	for permission in [
		Permission::Admin,
		Permission::DeleteChannel,
		Permission::ManageRoles,
		Permission::Ban,
		Permission::Send,
		Permission::Read,
	] {
		assert!(has_permission(&doc, &user("bob"), permission, None));
	}
}

#[test]
fn non_members_hold_nothing() {
	let doc = three_role_channel();
	assert!(!has_permission(&doc, &user("eve"), Permission::Read, None));
	assert!(crate::server::permissions::permissions_of(&doc, &user("eve")).is_empty());
}

#[test]
fn admin_grants_everything_except_channel_deletion() {
	let mut doc = three_role_channel();
	doc.roles
		.get_mut("moderator")
		.unwrap()
		.insert(Permission::Admin);

	assert!(has_permission(&doc, &user("mallory"), Permission::Ban, None));
	assert!(has_permission(&doc, &user("mallory"), Permission::ManageRoles, None));
	assert!(!has_permission(&doc, &user("mallory"), Permission::DeleteChannel, None));
}

#[test]
fn subchannel_overrides_union_with_channel_permissions() {
	let mut doc = three_role_channel();
	doc.roles.insert("default".to_string(), BTreeSet::from([Permission::Send]));
	let mut sub = Subchannel::default();
	sub.overrides
		.insert("default".to_string(), BTreeSet::from([Permission::Read]));
	doc.subchannels.insert("lounge".to_string(), sub);

	assert!(!has_permission(&doc, &user("dave"), Permission::Read, None));
	assert!(has_permission(&doc, &user("dave"), Permission::Read, Some("lounge")));
	// Channel-level permissions still apply inside the subchannel.
	assert!(has_permission(&doc, &user("dave"), Permission::Send, Some("lounge")));
}

#[test]
fn moderation_requires_a_strictly_higher_rank() {
	let doc = three_role_channel();
	assert!(can_moderate(&doc, &user("bob"), &user("mallory")));
	assert!(can_moderate(&doc, &user("mallory"), &user("dave")));
	assert!(!can_moderate(&doc, &user("mallory"), &user("mallory")));
	assert!(!can_moderate(&doc, &user("dave"), &user("mallory")));
	assert!(!can_moderate(&doc, &user("eve"), &user("dave")));
}

#[test]
fn owner_cannot_displace_their_own_role() {
	let mut doc = ChannelDocument::new(user("bob"), 100, false);
	let result = reorder_roles(&mut doc, &user("bob"), vec!["default".to_string(), OWNER_ROLE.to_string()]);
	assert_eq!(result, Err(PermissionError::InsufficientPrivilege));
	assert_eq!(doc.order[0], OWNER_ROLE);
}

#[test]
fn reorder_rejects_non_permutations() {
	let mut doc = three_role_channel();
	let result = reorder_roles(
		&mut doc,
		&user("bob"),
		vec![OWNER_ROLE.to_string(), "moderator".to_string()],
	);
	assert_eq!(result, Err(PermissionError::RoleSetMismatch));

	let result = reorder_roles(
		&mut doc,
		&user("bob"),
		vec![OWNER_ROLE.to_string(), "moderator".to_string(), "ghost".to_string()],
	);
	assert_eq!(result, Err(PermissionError::RoleSetMismatch));
}

#[test]
fn reorder_moves_only_roles_below_the_actor() {
	let mut doc = three_role_channel();
	doc.roles.insert("helper".to_string(), BTreeSet::new());
	doc.order = vec![
		OWNER_ROLE.to_string(),
		"moderator".to_string(),
		"helper".to_string(),
		"default".to_string(),
	];

	// The moderator swaps the two roles below them.
	let result = reorder_roles(
		&mut doc,
		&user("mallory"),
		vec![
			OWNER_ROLE.to_string(),
			"moderator".to_string(),
			"default".to_string(),
			"helper".to_string(),
		],
	);
	assert_eq!(result, Ok(()));
	assert_eq!(doc.role_index("default"), Some(2));

	// Everything at or above the actor's old rank kept its index.
	assert_eq!(doc.role_index(OWNER_ROLE), Some(0));
	assert_eq!(doc.role_index("moderator"), Some(1));

	// The moderator cannot move a role at their own rank or above.
	let result = reorder_roles(
		&mut doc,
		&user("mallory"),
		vec![
			"moderator".to_string(),
			OWNER_ROLE.to_string(),
			"default".to_string(),
			"helper".to_string(),
		],
	);
	assert_eq!(result, Err(PermissionError::InsufficientPrivilege));
}

#[test]
fn reorder_by_a_non_member_is_refused() {
	let mut doc = three_role_channel();
	let result = reorder_roles(
		&mut doc,
		&user("eve"),
		vec![OWNER_ROLE.to_string(), "moderator".to_string(), "default".to_string()],
	);
	assert!(matches!(result, Err(PermissionError::NotMember(_))));
}
