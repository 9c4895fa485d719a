#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use regex::Regex;
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.delegate/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".delegate").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub regulations: Regulations,
	pub persistence: PersistenceSettings,
}

/// Server settings loaded by the server.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// TCP bind address (host:port).
	pub bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Server-wide shared password; when set, connections must
	/// `authenticate` before anything but `quit` is reachable.
	pub password: Option<String>,
	/// Secret fed to the credential hasher.
	pub credential_secret: String,
	/// Published server name.
	pub name: String,
	/// Published server description.
	pub description: Option<String>,
	/// Published admin contact.
	pub admin: Option<String>,
}

/// Identifier and content regulations enforced at registration and send time.
#[derive(Debug, Clone)]
pub struct Regulations {
	pub username_len: (usize, usize),
	pub username_regex: Regex,
	pub password_len: (usize, usize),
	pub channel_name_len: (usize, usize),
	pub channel_name_regex: Regex,
	/// Direct/channel message length cap, bytes.
	pub max_message_len: usize,
	/// How many unregistered (free) settings one account may hold.
	pub free_setting_cap: usize,
	/// Length cap for a free setting's string value.
	pub free_setting_value_len: usize,
}

/// Persistence settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Enable the sqlx-backed store; without it the server runs in-memory.
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: "127.0.0.1:18202".to_string(),
			metrics_bind: None,
			password: None,
			credential_secret: "delegate-dev-secret".to_string(),
			name: "delegate".to_string(),
			description: None,
			admin: None,
		}
	}
}

impl Default for Regulations {
	fn default() -> Self {
		Self {
			username_len: (3, 24),
			username_regex: Regex::new("^[A-Za-z0-9_]+$").unwrap_or_else(|_| unreachable!("static regex")),
			password_len: (8, 64),
			channel_name_len: (3, 32),
			channel_name_regex: Regex::new("^[A-Za-z0-9_-]+$").unwrap_or_else(|_| unreachable!("static regex")),
			max_message_len: 4096,
			free_setting_cap: 512,
			free_setting_value_len: 128,
		}
	}
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			server: ServerSettings::default(),
			regulations: Regulations::default(),
			persistence: PersistenceSettings::default(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	regulations: FileRegulations,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	password: Option<String>,
	credential_secret: Option<String>,
	name: Option<String>,
	description: Option<String>,
	admin: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRegulations {
	username_len_min: Option<usize>,
	username_len_max: Option<usize>,
	username_regex: Option<String>,
	password_len_min: Option<usize>,
	password_len_max: Option<usize>,
	channel_name_len_min: Option<usize>,
	channel_name_len_max: Option<usize>,
	channel_name_regex: Option<String>,
	max_message_len: Option<usize>,
	free_setting_cap: Option<usize>,
	free_setting_value_len: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let defaults = Regulations::default();
		let server_defaults = ServerSettings::default();

		let username_regex = match file.regulations.username_regex {
			Some(src) => Regex::new(&src).with_context(|| format!("compile username_regex {src:?}"))?,
			None => defaults.username_regex.clone(),
		};
		let channel_name_regex = match file.regulations.channel_name_regex {
			Some(src) => Regex::new(&src).with_context(|| format!("compile channel_name_regex {src:?}"))?,
			None => defaults.channel_name_regex.clone(),
		};

		Ok(Self {
			server: ServerSettings {
				bind: file
					.server
					.bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(server_defaults.bind),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				password: file.server.password.filter(|s| !s.is_empty()),
				credential_secret: file
					.server
					.credential_secret
					.filter(|s| !s.is_empty())
					.unwrap_or(server_defaults.credential_secret),
				name: file
					.server
					.name
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(server_defaults.name),
				description: file.server.description.filter(|s| !s.trim().is_empty()),
				admin: file.server.admin.filter(|s| !s.trim().is_empty()),
			},
			regulations: Regulations {
				username_len: (
					file.regulations.username_len_min.unwrap_or(defaults.username_len.0),
					file.regulations.username_len_max.unwrap_or(defaults.username_len.1),
				),
				username_regex,
				password_len: (
					file.regulations.password_len_min.unwrap_or(defaults.password_len.0),
					file.regulations.password_len_max.unwrap_or(defaults.password_len.1),
				),
				channel_name_len: (
					file.regulations.channel_name_len_min.unwrap_or(defaults.channel_name_len.0),
					file.regulations.channel_name_len_max.unwrap_or(defaults.channel_name_len.1),
				),
				channel_name_regex,
				max_message_len: file.regulations.max_message_len.unwrap_or(defaults.max_message_len),
				free_setting_cap: file.regulations.free_setting_cap.unwrap_or(defaults.free_setting_cap),
				free_setting_value_len: file
					.regulations
					.free_setting_value_len
					.unwrap_or(defaults.free_setting_value_len),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
		})
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("DELEGATE_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.bind = v;
			info!("server config: bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("DELEGATE_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("DELEGATE_SERVER_PASSWORD")
		&& !v.is_empty()
	{
		cfg.server.password = Some(v);
		info!("server config: password overridden by env");
	}

	if let Ok(v) = std::env::var("DELEGATE_CREDENTIAL_SECRET")
		&& !v.is_empty()
	{
		cfg.server.credential_secret = v;
		info!("server config: credential_secret overridden by env");
	}

	if let Ok(v) = std::env::var("DELEGATE_SERVER_NAME") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.name = v;
			info!("server config: name overridden by env");
		}
	}

	if let Ok(v) = std::env::var("DELEGATE_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("DELEGATE_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}
}
