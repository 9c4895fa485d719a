#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use delegate_domain::{ChannelName, Permission, Username};
use delegate_protocol::EventFrame;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::server::channels::ChannelRuntime;
use crate::server::permissions::has_permission;
use crate::server::session::SessionRegistry;

/// Fan-out of event frames to account connections, channel members, and
/// the subscriber/friend audience of special setting changes.
///
/// Delivery is best-effort and isolated per recipient: one stuck or dead
/// connection never aborts delivery to the rest. Ordering holds only per
/// connection queue.
pub struct EventBroadcaster {
	registry: Arc<SessionRegistry>,
	channels: Arc<ChannelRuntime>,
}

impl EventBroadcaster {
	pub fn new(registry: Arc<SessionRegistry>, channels: Arc<ChannelRuntime>) -> Self {
		Self { registry, channels }
	}

	/// Deliver to every live connection (normal and event) of one account.
	pub async fn to_connections(&self, username: &Username, event: &EventFrame) {
		let value = event.to_value();
		let mut saw_dead = false;

		for handle in self.registry.connection_handles(username).await {
			match handle.tx.try_send(value.clone()) {
				Ok(()) => {}
				Err(TrySendError::Full(_)) => {
					metrics::counter!("delegate_server_broadcast_drops_total").increment(1);
					warn!(username = %username, conn_id = handle.conn_id, "outbound queue full, event dropped");
				}
				Err(TrySendError::Closed(_)) => {
					metrics::counter!("delegate_server_broadcast_drops_total").increment(1);
					saw_dead = true;
				}
			}
		}

		if saw_dead {
			self.registry.prune_dead_connections(username).await;
		}
	}

	/// Deliver to every member of a channel, or of a subchannel's allowed
	/// set when scoped, except the optionally excluded sender.
	pub async fn to_channel(
		&self,
		channel: &ChannelName,
		event: &EventFrame,
		subchannel: Option<&str>,
		exclude: Option<&Username>,
	) {
		let document = match self.channels.get(channel).await {
			Ok(document) => document,
			Err(e) => {
				debug!(channel = %channel, error = %e, "channel broadcast skipped");
				return;
			}
		};

		for member in document.members.keys() {
			if exclude == Some(member) {
				continue;
			}
			if subchannel.is_some() && !has_permission(&document, member, Permission::Read, subchannel) {
				continue;
			}
			self.to_connections(member, event).await;
		}
	}

	/// Deliver a special-settings change to the union of the account's
	/// subscribers and friends, deduplicated.
	pub async fn special_settings_changed(&self, username: &Username, changed_keys: &[String]) {
		if changed_keys.is_empty() {
			return;
		}

		let document = match self.registry.get_settings(username).await {
			Ok(document) => document,
			Err(e) => {
				debug!(username = %username, error = %e, "special settings broadcast skipped");
				return;
			}
		};

		let mut settings = Map::new();
		for key in changed_keys {
			settings.insert(key.clone(), document.get(key).cloned().unwrap_or(Value::Null));
		}
		let event = EventFrame::new("uspecial")
			.with("username", json!(username.as_str()))
			.with("settings", Value::Object(settings));

		let audience: BTreeSet<String> = document
			.subscribers()
			.into_iter()
			.chain(document.friends())
			.collect();

		for name in audience {
			let Ok(recipient) = Username::new(name) else {
				continue;
			};
			self.to_connections(&recipient, &event).await;
		}
	}
}
