#![forbid(unsafe_code)]

use std::sync::Arc;

use delegate_domain::account::keys;
use delegate_domain::{ChannelDocument, ParseIdError, Username, default_account_document};
use delegate_protocol::{ArgError, CommandFrame, EventFrame, ResponseFrame, codes};
use delegate_store::{AccountStore, NewAccount, StoreError};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::server::broadcast::EventBroadcaster;
use crate::server::channels::ChannelRuntime;
use crate::server::credentials::{PasswordHasher, TotpVerifier, constant_time_eq};
use crate::server::permissions::{PermissionError, reorder_roles};
use crate::server::session::{ConnectionHandle, SessionError, SessionRegistry};
use crate::server::settings::{SettingsEngine, SettingsError};

/// Commands reachable before sign-in.
const PRIMITIVE_COMMANDS: [&str; 6] = ["user", "uregister", "quit", "ping", "get", "authenticate"];

/// Everything a connection handler needs, built once at startup.
pub struct ServerContext {
	pub config: ServerConfig,
	pub accounts: Arc<dyn AccountStore>,
	pub registry: Arc<SessionRegistry>,
	pub channels: Arc<ChannelRuntime>,
	pub broadcaster: Arc<EventBroadcaster>,
	pub settings: SettingsEngine,
	pub hasher: Arc<dyn PasswordHasher>,
	pub totp: Arc<dyn TotpVerifier>,
}

/// Per-connection authorization state.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnState {
	/// Server password configured and not yet presented.
	PasswordPending,
	/// Authenticated against the server but not signed in.
	Ready,
	SignedIn { username: Username, is_event: bool },
	Closed,
}

enum CommandError {
	Args(ArgError),
	Settings(SettingsError),
	Permission(PermissionError),
	Session(SessionError),
	Store(StoreError),
	/// A fully-formed error response from a handler.
	Response(ResponseFrame),
}

impl From<ArgError> for CommandError {
	fn from(e: ArgError) -> Self {
		CommandError::Args(e)
	}
}

impl From<SettingsError> for CommandError {
	fn from(e: SettingsError) -> Self {
		CommandError::Settings(e)
	}
}

impl From<PermissionError> for CommandError {
	fn from(e: PermissionError) -> Self {
		CommandError::Permission(e)
	}
}

impl From<SessionError> for CommandError {
	fn from(e: SessionError) -> Self {
		CommandError::Session(e)
	}
}

impl From<StoreError> for CommandError {
	fn from(e: StoreError) -> Self {
		CommandError::Store(e)
	}
}

impl CommandError {
	fn into_response(self) -> ResponseFrame {
		match self {
			CommandError::Args(ArgError::Missing(name)) => {
				ResponseFrame::new(codes::command::ARGS_MISSING).with("argument", json!(name))
			}
			CommandError::Args(ArgError::WrongType(name)) => {
				ResponseFrame::new(codes::command::INVALID_TYPES).with("argument", json!(name))
			}
			CommandError::Settings(e) => match e {
				SettingsError::Immutable(key) => ResponseFrame::new(codes::setting::IMMUTABLE).with("key", json!(key)),
				SettingsError::WrongType(key) => ResponseFrame::new(codes::setting::TYPE).with("key", json!(key)),
				SettingsError::OutOfRange(key) => ResponseFrame::new(codes::setting::RANGE).with("key", json!(key)),
				SettingsError::MutuallyExclusive { key, other } => {
					ResponseFrame::new(codes::setting::MUTUALLY_EXCLUSIVE).with("keys", json!([key, other]))
				}
				SettingsError::FreeSettingCap(cap) => ResponseFrame::new(codes::setting::RANGE).with("cap", json!(cap)),
			},
			CommandError::Permission(e) => match e {
				PermissionError::RoleSetMismatch => ResponseFrame::new(codes::channel::ROLE_SET_MISMATCH),
				PermissionError::InsufficientPrivilege => ResponseFrame::new(codes::channel::INSUFFICIENT_PRIVILEGE),
				PermissionError::NotMember(u) => {
					ResponseFrame::new(codes::channel::NOT_MEMBER).with("username", json!(u.as_str()))
				}
			},
			CommandError::Session(e) => match e {
				SessionError::NotFound(u) => {
					ResponseFrame::new(codes::user::USERNAME_NOENT).with("username", json!(u.as_str()))
				}
				SessionError::EventConnectionWithoutSession => ResponseFrame::new(codes::user::EVENT_CONNECTION),
				SessionError::Store(e) => exception_response(&e),
			},
			CommandError::Store(e) => match e {
				StoreError::AccountNotFound(u) => {
					ResponseFrame::new(codes::user::USERNAME_NOENT).with("username", json!(u.as_str()))
				}
				StoreError::AccountExists(u) => {
					ResponseFrame::new(codes::user::USERNAME_EXISTS).with("username", json!(u.as_str()))
				}
				StoreError::ChannelNotFound(c) => {
					ResponseFrame::new(codes::channel::NOENT).with("channel", json!(c.as_str()))
				}
				StoreError::ChannelExists(c) => {
					ResponseFrame::new(codes::channel::ALREADY_EXISTS).with("channel", json!(c.as_str()))
				}
				other => exception_response(&other),
			},
			CommandError::Response(frame) => frame,
		}
	}
}

fn exception_response(e: &dyn std::error::Error) -> ResponseFrame {
	warn!(error = %e, "command failed with internal error");
	ResponseFrame::new(codes::server::EXCEPTION)
		.with("kind", json!("internal"))
		.with("message", json!(e.to_string()))
}

fn err(frame: ResponseFrame) -> CommandError {
	CommandError::Response(frame)
}

fn now_secs() -> i64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_secs() as i64)
		.unwrap_or(0)
}

fn username_arg(frame: &CommandFrame, name: &str) -> Result<Username, CommandError> {
	let raw = frame.str_arg(name)?;
	Username::new(raw).map_err(|ParseIdError::Empty| CommandError::Args(ArgError::WrongType(name.to_string())))
}

/// Per-connection protocol state machine. Parses nothing itself; the
/// connection loop feeds it decoded frames and writes back the responses.
pub struct Dispatcher {
	ctx: Arc<ServerContext>,
	handle: ConnectionHandle,
	state: ConnState,
}

impl Dispatcher {
	pub fn new(ctx: Arc<ServerContext>, handle: ConnectionHandle) -> Self {
		let state = if ctx.config.server.password.is_some() {
			ConnState::PasswordPending
		} else {
			ConnState::Ready
		};
		Self { ctx, handle, state }
	}

	pub fn is_closed(&self) -> bool {
		self.state == ConnState::Closed
	}

	fn signed_in(&self) -> Option<(Username, bool)> {
		match &self.state {
			ConnState::SignedIn { username, is_event } => Some((username.clone(), *is_event)),
			_ => None,
		}
	}

	/// Cleanup for a transport that dropped without `quit`.
	pub async fn connection_lost(&mut self) {
		if let Some((username, is_event)) = self.signed_in() {
			let went_offline = self
				.ctx
				.registry
				.remove_connection(&username, self.handle.conn_id, is_event, false)
				.await;
			if went_offline {
				self.ctx
					.broadcaster
					.special_settings_changed(&username, &[keys::STATUS.to_string()])
					.await;
			}
		}
		self.state = ConnState::Closed;
	}

	pub async fn dispatch(&mut self, frame: CommandFrame) -> ResponseFrame {
		metrics::counter!("delegate_server_commands_total").increment(1);

		if self.state == ConnState::PasswordPending && frame.command != "authenticate" && frame.command != "quit" {
			return ResponseFrame::new(codes::server::PASSWORD_REQUIRED);
		}

		if self.signed_in().is_none() && !PRIMITIVE_COMMANDS.contains(&frame.command.as_str()) {
			return ResponseFrame::new(codes::command::NOT_SIGNED_IN);
		}

		let result = match frame.command.as_str() {
			"ping" => Ok(ResponseFrame::new(codes::server::PONG)),
			"get" => self.handle_get(&frame),
			"authenticate" => self.handle_authenticate(&frame),
			"uregister" => self.handle_uregister(&frame).await,
			"user" => self.handle_user(&frame).await,
			"quit" => self.handle_quit().await,
			"usend" => self.handle_usend(&frame).await,
			"uset" => self.handle_uset(&frame).await,
			"uget" => self.handle_uget(&frame).await,
			"upriv" => self.handle_upriv(&frame).await,
			"uprivwhitelist" => self.handle_uprivwhitelist(&frame).await,
			"frequest" => self.handle_frequest(&frame).await,
			"friend" => self.handle_friend(&frame).await,
			"usubscribe" => self.handle_usubscribe(&frame).await,
			"2fa" => self.handle_two_factor().await,
			"cregister" => self.handle_cregister(&frame).await,
			"corder" => self.handle_corder(&frame).await,
			other => {
				debug!(command = %other, "unknown command");
				Ok(ResponseFrame::new(codes::command::NOT_FOUND))
			}
		};

		result.unwrap_or_else(CommandError::into_response)
	}

	fn server_constants(&self) -> Map<String, Value> {
		let cfg = &self.ctx.config;
		let mut constants = Map::new();
		constants.insert("name".into(), json!(cfg.server.name));
		constants.insert("description".into(), json!(cfg.server.description));
		constants.insert("version".into(), json!(env!("CARGO_PKG_VERSION")));
		constants.insert("admin".into(), json!(cfg.server.admin));
		constants.insert("password_required".into(), json!(cfg.server.password.is_some()));
		constants.insert("max_message_len".into(), json!(cfg.regulations.max_message_len));
		constants.insert("username_len_min".into(), json!(cfg.regulations.username_len.0));
		constants.insert("username_len_max".into(), json!(cfg.regulations.username_len.1));
		constants.insert("username_regex".into(), json!(cfg.regulations.username_regex.as_str()));
		constants.insert("password_len_min".into(), json!(cfg.regulations.password_len.0));
		constants.insert("password_len_max".into(), json!(cfg.regulations.password_len.1));
		constants.insert(
			"channel_name_len_min".into(),
			json!(cfg.regulations.channel_name_len.0),
		);
		constants.insert(
			"channel_name_len_max".into(),
			json!(cfg.regulations.channel_name_len.1),
		);
		constants.insert(
			"channel_name_regex".into(),
			json!(cfg.regulations.channel_name_regex.as_str()),
		);
		constants
	}

	fn handle_get(&self, frame: &CommandFrame) -> Result<ResponseFrame, CommandError> {
		let requested = frame.array_arg("settings")?;
		let constants = self.server_constants();

		let mut values = Map::new();
		for key in requested {
			let Some(key) = key.as_str() else {
				return Err(CommandError::Args(ArgError::WrongType("settings".into())));
			};
			values.insert(key.to_string(), constants.get(key).cloned().unwrap_or(Value::Null));
		}

		Ok(ResponseFrame::new(codes::server::GET_OK).with("settings", Value::Object(values)))
	}

	fn handle_authenticate(&mut self, frame: &CommandFrame) -> Result<ResponseFrame, CommandError> {
		let presented = frame.str_arg("password")?;

		let Some(expected) = self.ctx.config.server.password.as_deref() else {
			return Ok(ResponseFrame::new(codes::server::AUTHENTICATE_OK));
		};

		if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
			return Err(err(ResponseFrame::new(codes::server::PASSWORD_INCORRECT)));
		}

		if self.state == ConnState::PasswordPending {
			self.state = ConnState::Ready;
		}
		Ok(ResponseFrame::new(codes::server::AUTHENTICATE_OK))
	}

	async fn handle_uregister(&self, frame: &CommandFrame) -> Result<ResponseFrame, CommandError> {
		let username = frame.str_arg("username")?;
		let password = frame.str_arg("password")?;
		let bot = frame.body.get("bot").and_then(Value::as_bool).unwrap_or(false);

		let reg = &self.ctx.config.regulations;
		let (min, max) = reg.username_len;
		let len = username.chars().count();
		if len < min || len > max {
			return Err(err(ResponseFrame::new(codes::user::USERNAME_LENGTH)
				.with("min", json!(min))
				.with("max", json!(max))));
		}
		if !reg.username_regex.is_match(username) {
			return Err(err(
				ResponseFrame::new(codes::user::USERNAME_REGEX).with("regex", json!(reg.username_regex.as_str()))
			));
		}

		let (pmin, pmax) = reg.password_len;
		let plen = password.chars().count();
		if plen < pmin || plen > pmax {
			return Err(err(ResponseFrame::new(codes::user::WEAK_PASSWORD)
				.with("min", json!(pmin))
				.with("max", json!(pmax))));
		}

		let username =
			Username::new(username).map_err(|ParseIdError::Empty| err(ResponseFrame::new(codes::user::USERNAME_REGEX)))?;

		let created = now_secs();
		self.ctx
			.accounts
			.register_account(NewAccount {
				username: username.clone(),
				created,
				document: default_account_document(created, bot),
				password_hash: self.ctx.hasher.hash(password),
			})
			.await?;

		metrics::counter!("delegate_server_registrations_total").increment(1);
		debug!(username = %username, bot, "account registered");
		Ok(ResponseFrame::new(codes::user::REGISTER_OK))
	}

	async fn handle_user(&mut self, frame: &CommandFrame) -> Result<ResponseFrame, CommandError> {
		if self.signed_in().is_some() {
			return Err(err(ResponseFrame::new(codes::user::ALREADY_SIGNED_IN)));
		}

		let username = username_arg(frame, "username")?;
		let password = frame.str_arg("password")?;
		let is_event = frame.body.get("event").and_then(Value::as_bool).unwrap_or(false);

		let stored_hash = self.ctx.accounts.password_hash(&username).await?;
		if !self.ctx.hasher.verify(password, &stored_hash) {
			return Err(err(ResponseFrame::new(codes::user::PASSWORD_INCORRECT)));
		}

		let document = self.ctx.registry.get_settings(&username).await?;
		if document.bool_setting(keys::TWO_FACTOR) {
			let Some(secret) = self.ctx.accounts.totp_secret(&username).await? else {
				return Err(err(ResponseFrame::new(codes::user::TWO_FACTOR_VERIFY)));
			};
			let code = frame
				.opt_str_arg("code")?
				.ok_or_else(|| err(ResponseFrame::new(codes::user::TWO_FACTOR_VERIFY)))?;
			if !self.ctx.totp.verify(&secret, code) {
				return Err(err(ResponseFrame::new(codes::user::TWO_FACTOR_VERIFY)));
			}
		}

		let outcome = self
			.ctx
			.registry
			.sign_in(&username, self.handle.clone(), is_event)
			.await?;

		self.state = ConnState::SignedIn {
			username: username.clone(),
			is_event,
		};

		if outcome.came_online {
			self.ctx
				.broadcaster
				.special_settings_changed(&username, &[keys::STATUS.to_string()])
				.await;
		}

		Ok(ResponseFrame::new(codes::user::SIGNIN_OK).with("motd", json!(self.ctx.config.server.name)))
	}

	async fn handle_quit(&mut self) -> Result<ResponseFrame, CommandError> {
		if let Some((username, is_event)) = self.signed_in() {
			let went_offline = self
				.ctx
				.registry
				.remove_connection(&username, self.handle.conn_id, is_event, true)
				.await;
			if went_offline {
				self.ctx
					.broadcaster
					.special_settings_changed(&username, &[keys::STATUS.to_string()])
					.await;
			}
		}
		self.state = ConnState::Closed;
		Ok(ResponseFrame::new(codes::user::LOGOUT_OK))
	}

	fn require_signed_in(&self) -> Result<Username, CommandError> {
		self.signed_in()
			.map(|(u, _)| u)
			.ok_or_else(|| err(ResponseFrame::new(codes::command::NOT_SIGNED_IN)))
	}

	fn shares_channel(&self, a: &delegate_domain::AccountDocument, b: &delegate_domain::AccountDocument) -> bool {
		let theirs: std::collections::BTreeSet<String> = b
			.channels()
			.into_iter()
			.chain(b.name_list(keys::GROUP_CHANNELS))
			.collect();
		a.channels()
			.into_iter()
			.chain(a.name_list(keys::GROUP_CHANNELS))
			.any(|c| theirs.contains(&c))
	}

	async fn handle_usend(&self, frame: &CommandFrame) -> Result<ResponseFrame, CommandError> {
		let sender = self.require_signed_in()?;
		let recipient = username_arg(frame, "username")?;
		let message = frame.str_arg("message")?;

		if message.chars().count() > self.ctx.config.regulations.max_message_len {
			return Err(err(ResponseFrame::new(codes::setting::RANGE)
				.with("key", json!("message"))
				.with("max", json!(self.ctx.config.regulations.max_message_len))));
		}

		let recipient_doc = self.ctx.registry.get_settings(&recipient).await?;

		if recipient_doc.has_blocked(sender.as_str()) {
			return Err(err(ResponseFrame::new(codes::user::USER_BLOCKED)));
		}
		if recipient_doc.bool_setting(keys::ASOCIAL) {
			return Err(err(ResponseFrame::new(codes::user::CANT_SEND_MESSAGE)));
		}
		if recipient_doc.bool_setting(keys::FRIENDS_ONLY) && !recipient_doc.is_friend(sender.as_str()) {
			return Err(err(ResponseFrame::new(codes::user::CANT_SEND_MESSAGE)));
		}
		// A non-friendly recipient requires a shared channel, friend or not.
		if !recipient_doc.bool_setting(keys::FRIENDLY) {
			let sender_doc = self.ctx.registry.get_settings(&sender).await?;
			if !self.shares_channel(&sender_doc, &recipient_doc) {
				return Err(err(ResponseFrame::new(codes::user::CANT_SEND_MESSAGE)));
			}
		}

		let id = Uuid::new_v4().to_string();
		let event = EventFrame::new("umessage")
			.with("from", json!(sender.as_str()))
			.with("message", json!(message))
			.with("id", json!(id));
		self.ctx.broadcaster.to_connections(&recipient, &event).await;

		metrics::counter!("delegate_server_direct_messages_total").increment(1);
		Ok(ResponseFrame::new(codes::OK).with("id", json!(id)))
	}

	async fn handle_uset(&self, frame: &CommandFrame) -> Result<ResponseFrame, CommandError> {
		let username = self.require_signed_in()?;
		let requested = frame.object_arg("settings")?;

		let document = self.ctx.registry.get_settings(&username).await?;
		for (key, value) in requested {
			self.ctx.settings.check_client_mutable(key)?;
			self.ctx.settings.validate(&document, key, value)?;
		}

		let patch: Vec<(String, Value)> = requested.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
		self.ctx.registry.mutate_settings(&username, patch).await?;

		let special = self.ctx.settings.special_subset(requested.keys().map(String::as_str));
		self.ctx.broadcaster.special_settings_changed(&username, &special).await;

		Ok(ResponseFrame::new(codes::user::SETTINGS_OK))
	}

	async fn handle_uget(&self, frame: &CommandFrame) -> Result<ResponseFrame, CommandError> {
		let requester = self.require_signed_in()?;
		let target = username_arg(frame, "username")?;
		let requested = frame.array_arg("settings")?;

		let document = self.ctx.registry.get_settings(&target).await?;

		let mut values = Map::new();
		for key in requested {
			let Some(key) = key.as_str() else {
				return Err(CommandError::Args(ArgError::WrongType("settings".into())));
			};
			let value = if self
				.ctx
				.settings
				.is_visible(&document, target.as_str(), requester.as_str(), key)
			{
				document.get(key).cloned().unwrap_or(Value::Null)
			} else {
				Value::Null
			};
			values.insert(key.to_string(), value);
		}

		Ok(ResponseFrame::new(codes::user::SETTINGS_OK)
			.with("username", json!(target.as_str()))
			.with("settings", Value::Object(values)))
	}

	async fn handle_upriv(&self, frame: &CommandFrame) -> Result<ResponseFrame, CommandError> {
		let username = self.require_signed_in()?;
		let key = frame.str_arg("key")?.to_string();
		let private = frame.bool_arg("private")?;

		if !matches!(self.ctx.settings.classify(&key), delegate_domain::Qualifier::Public) {
			return Err(err(ResponseFrame::new(codes::setting::PREFIXED).with("key", json!(key))));
		}

		let document = self.ctx.registry.get_settings(&username).await?;
		if !private && !document.list_contains(keys::PRIVATED_SETTINGS, &key) {
			return Err(err(ResponseFrame::new(codes::setting::NOT_PRIVATE).with("key", json!(key))));
		}

		self.ctx
			.registry
			.update_account(&username, move |document| {
				if private {
					document.list_insert(keys::PRIVATED_SETTINGS, &key);
				} else {
					document.list_remove(keys::PRIVATED_SETTINGS, &key);
					if let Some(whitelist) = document
						.settings
						.get_mut(keys::PRIVATE_WHITELIST)
						.and_then(Value::as_object_mut)
					{
						whitelist.remove(&key);
					}
				}
			})
			.await?;

		Ok(ResponseFrame::new(codes::user::SETTINGS_OK))
	}

	async fn handle_uprivwhitelist(&self, frame: &CommandFrame) -> Result<ResponseFrame, CommandError> {
		let username = self.require_signed_in()?;
		let key = frame.str_arg("key")?.to_string();

		let entry = match frame.body.get("users") {
			None => return Err(CommandError::Args(ArgError::Missing("users".into()))),
			Some(Value::Null) => Some(Value::Null),
			Some(Value::Array(users)) => {
				if users.iter().any(|u| !u.is_string()) {
					return Err(CommandError::Args(ArgError::WrongType("users".into())));
				}
				if users.is_empty() {
					None
				} else {
					Some(Value::Array(users.clone()))
				}
			}
			Some(_) => return Err(CommandError::Args(ArgError::WrongType("users".into()))),
		};

		let document = self.ctx.registry.get_settings(&username).await?;
		let private = self.ctx.settings.classify(&key).inherently_private()
			|| document.list_contains(keys::PRIVATED_SETTINGS, &key);
		if !private {
			return Err(err(ResponseFrame::new(codes::setting::NOT_PRIVATE).with("key", json!(key))));
		}
		if entry.is_none() && !document.private_whitelist().contains_key(&key) {
			return Err(err(
				ResponseFrame::new(codes::setting::WHITELIST_NOENT).with("key", json!(key))
			));
		}

		self.ctx
			.registry
			.update_account(&username, move |document| {
				let whitelist = document
					.settings
					.entry(keys::PRIVATE_WHITELIST.to_string())
					.or_insert_with(|| json!({}));
				if let Some(map) = whitelist.as_object_mut() {
					match entry {
						Some(value) => {
							map.insert(key, value);
						}
						None => {
							map.remove(&key);
						}
					}
				}
			})
			.await?;

		Ok(ResponseFrame::new(codes::user::SETTINGS_OK))
	}

	async fn handle_frequest(&self, frame: &CommandFrame) -> Result<ResponseFrame, CommandError> {
		let sender = self.require_signed_in()?;
		let target = username_arg(frame, "username")?;
		let message = frame.opt_str_arg("message")?.map(str::to_string);

		if sender == target {
			return Err(err(ResponseFrame::new(codes::user::CANT_BECOME_FRIENDS)));
		}

		let target_doc = self.ctx.registry.get_settings(&target).await?;

		if target_doc.has_blocked(sender.as_str()) {
			return Err(err(ResponseFrame::new(codes::user::USER_BLOCKED)));
		}
		if target_doc.is_friend(sender.as_str()) {
			return Err(err(ResponseFrame::new(codes::user::CANT_BECOME_FRIENDS)));
		}
		if target_doc.bool_setting(keys::LONE) {
			return Err(err(ResponseFrame::new(codes::user::CANT_BECOME_FRIENDS)));
		}
		if target_doc.bool_setting(keys::SKEPTIC) {
			let sender_doc = self.ctx.registry.get_settings(&sender).await?;
			if !self.shares_channel(&sender_doc, &target_doc) {
				return Err(err(ResponseFrame::new(codes::user::CANT_BECOME_FRIENDS)));
			}
		}
		if target_doc.list_contains(keys::FRIEND_REQUESTS, sender.as_str()) {
			return Err(err(ResponseFrame::new(codes::user::FRIEND_REQUEST_EXISTS)));
		}

		let sender_name = sender.clone();
		self.ctx
			.registry
			.update_account(&target, move |document| {
				document.list_insert(keys::FRIEND_REQUESTS, sender_name.as_str());
			})
			.await?;

		let mut event = EventFrame::new("frequest").with("username", json!(sender.as_str()));
		if let Some(message) = message {
			event = event.with("message", json!(message));
		}
		self.ctx.broadcaster.to_connections(&target, &event).await;

		Ok(ResponseFrame::new(codes::OK))
	}

	async fn handle_friend(&self, frame: &CommandFrame) -> Result<ResponseFrame, CommandError> {
		let username = self.require_signed_in()?;
		let requester = username_arg(frame, "username")?;
		let accept = frame.bool_arg("accept")?;
		let notify = frame.body.get("notify").and_then(Value::as_bool).unwrap_or(false);

		let document = self.ctx.registry.get_settings(&username).await?;
		if !document.list_contains(keys::FRIEND_REQUESTS, requester.as_str()) {
			return Err(err(ResponseFrame::new(codes::user::FRIEND_REQUEST_NOENT)));
		}

		let requester_name = requester.clone();
		self.ctx
			.registry
			.update_account(&username, move |document| {
				document.list_remove(keys::FRIEND_REQUESTS, requester_name.as_str());
				if accept {
					document.list_insert(keys::FRIENDS, requester_name.as_str());
				}
			})
			.await?;

		if accept {
			let accepter = username.clone();
			self.ctx
				.registry
				.update_account(&requester, move |document| {
					document.list_insert(keys::FRIENDS, accepter.as_str());
				})
				.await?;
		}

		// The requester learns the outcome either way.
		if notify {
			let event = EventFrame::new("friend")
				.with("username", json!(username.as_str()))
				.with("accepted", json!(accept));
			self.ctx.broadcaster.to_connections(&requester, &event).await;
		}

		Ok(ResponseFrame::new(codes::OK))
	}

	async fn handle_usubscribe(&self, frame: &CommandFrame) -> Result<ResponseFrame, CommandError> {
		let username = self.require_signed_in()?;
		let target = username_arg(frame, "username")?;
		let subscribe = frame.bool_arg("subscribe")?;

		// Existence check before any mutation.
		let _ = self.ctx.registry.get_settings(&target).await?;

		let document = self.ctx.registry.get_settings(&username).await?;
		let already = document.list_contains(keys::SUBSCRIPTIONS_TO, target.as_str());
		if subscribe == already {
			return Err(err(ResponseFrame::new(codes::user::SUBSCRIPTION_ERROR)));
		}

		let target_name = target.clone();
		self.ctx
			.registry
			.update_account(&username, move |document| {
				if subscribe {
					document.list_insert(keys::SUBSCRIPTIONS_TO, target_name.as_str());
				} else {
					document.list_remove(keys::SUBSCRIPTIONS_TO, target_name.as_str());
				}
			})
			.await?;

		let subscriber = username.clone();
		self.ctx
			.registry
			.update_account(&target, move |document| {
				if subscribe {
					document.list_insert(keys::SUBSCRIPTIONS_TO_ME, subscriber.as_str());
				} else {
					document.list_remove(keys::SUBSCRIPTIONS_TO_ME, subscriber.as_str());
				}
			})
			.await?;

		Ok(ResponseFrame::new(codes::OK))
	}

	async fn handle_two_factor(&self) -> Result<ResponseFrame, CommandError> {
		let username = self.require_signed_in()?;

		let secret = self.ctx.totp.generate_secret();
		self.ctx.accounts.set_totp_secret(&username, &secret).await?;
		self.ctx
			.registry
			.update_account(&username, |document| {
				document.set(keys::TWO_FACTOR, json!(true));
			})
			.await?;

		Ok(ResponseFrame::new(codes::user::TWO_FACTOR_OK).with("secret", json!(secret)))
	}

	async fn handle_cregister(&self, frame: &CommandFrame) -> Result<ResponseFrame, CommandError> {
		let username = self.require_signed_in()?;
		let name = frame.str_arg("channel")?;
		let group = frame.body.get("group").and_then(Value::as_bool).unwrap_or(false);

		let reg = &self.ctx.config.regulations;
		let (min, max) = reg.channel_name_len;
		let len = name.chars().count();
		if len < min || len > max {
			return Err(err(ResponseFrame::new(codes::channel::NAME_LENGTH)
				.with("min", json!(min))
				.with("max", json!(max))));
		}
		if !reg.channel_name_regex.is_match(name) {
			return Err(err(ResponseFrame::new(codes::channel::NAME_REGEX)
				.with("regex", json!(reg.channel_name_regex.as_str()))));
		}

		let channel = delegate_domain::ChannelName::new(name)
			.map_err(|ParseIdError::Empty| err(ResponseFrame::new(codes::channel::NAME_REGEX)))?;

		if self.ctx.channels.exists(&channel).await? {
			return Err(err(
				ResponseFrame::new(codes::channel::ALREADY_EXISTS).with("channel", json!(channel.as_str()))
			));
		}

		let document = ChannelDocument::new(username.clone(), now_secs(), group);
		self.ctx.channels.register(&channel, document).await?;

		let channel_name = channel.clone();
		self.ctx
			.registry
			.update_account(&username, move |document| {
				let key = if group { keys::GROUP_CHANNELS } else { keys::CHANNELS };
				document.list_insert(key, channel_name.as_str());
			})
			.await?;

		metrics::counter!("delegate_server_channels_registered_total").increment(1);
		Ok(ResponseFrame::new(codes::OK))
	}

	async fn handle_corder(&self, frame: &CommandFrame) -> Result<ResponseFrame, CommandError> {
		let username = self.require_signed_in()?;
		let channel = frame
			.str_arg("channel")
			.map_err(CommandError::Args)
			.and_then(|name| {
				delegate_domain::ChannelName::new(name)
					.map_err(|ParseIdError::Empty| CommandError::Args(ArgError::WrongType("channel".into())))
			})?;
		let order: Vec<String> = frame
			.array_arg("order")?
			.iter()
			.map(|v| v.as_str().map(str::to_string))
			.collect::<Option<_>>()
			.ok_or_else(|| CommandError::Args(ArgError::WrongType("order".into())))?;

		let actor = username.clone();
		let new_order = order.clone();
		self.ctx
			.channels
			.try_update(&channel, move |document| reorder_roles(document, &actor, new_order))
			.await??;

		let event = EventFrame::new("corder")
			.with("channel", json!(channel.as_str()))
			.with("order", json!(order));
		self.ctx.broadcaster.to_channel(&channel, &event, None, None).await;

		Ok(ResponseFrame::new(codes::OK))
	}
}
