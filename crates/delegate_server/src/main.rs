#![forbid(unsafe_code)]

mod config;
mod server;

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use delegate_domain::{AccountDocument, ChannelDocument, ChannelName, Username};
use delegate_store::{AccountStore, ChannelStore, MemoryStore, SqlStore};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::broadcast::EventBroadcaster;
use crate::server::channels::ChannelRuntime;
use crate::server::connection::handle_connection;
use crate::server::credentials::{HmacPasswordHasher, HmacTotpVerifier};
use crate::server::dispatcher::ServerContext;
use crate::server::persist::{DEFAULT_DEBOUNCE, PersistenceQueue, SnapshotSource};
use crate::server::session::SessionRegistry;
use crate::server::settings::SettingsEngine;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: delegate_server [--bind host:port]\n\
\n\
Options:\n\
\t--bind    Bind address (default: from config, 127.0.0.1:18202)\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<String> {
	let mut bind = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				bind = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,delegate_server=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

/// Current in-memory truth for the flush worker.
struct RuntimeSnapshots {
	registry: Arc<SessionRegistry>,
	channels: Arc<ChannelRuntime>,
}

#[async_trait]
impl SnapshotSource for RuntimeSnapshots {
	async fn account_snapshot(&self, username: &Username) -> Option<AccountDocument> {
		self.registry.online_snapshot(username).await
	}

	async fn channel_snapshot(&self, name: &ChannelName) -> Option<ChannelDocument> {
		self.channels.snapshot(name).await
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_override = parse_args();

	let config_path = config::default_config_path()?;
	let mut server_cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	if let Some(bind) = bind_override {
		server_cfg.server.bind = bind;
	}

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let (account_store, channel_store): (Arc<dyn AccountStore>, Arc<dyn ChannelStore>) = if server_cfg
		.persistence
		.enabled
	{
		let database_url = server_cfg
			.persistence
			.database_url
			.as_deref()
			.ok_or_else(|| anyhow::anyhow!("persistence enabled but no database_url configured"))?;
		let store = Arc::new(
			SqlStore::connect(database_url)
				.await
				.with_context(|| format!("connect store at {database_url}"))?,
		);
		(store.clone(), store)
	} else {
		warn!("persistence disabled; accounts and channels live in memory only");
		let store = Arc::new(MemoryStore::new());
		(store.clone(), store)
	};

	let (queue, queue_rx) = PersistenceQueue::new(DEFAULT_DEBOUNCE);
	let registry = Arc::new(SessionRegistry::new(Arc::clone(&account_store), Arc::clone(&queue)));
	let channels = Arc::new(ChannelRuntime::new(Arc::clone(&channel_store), Arc::clone(&queue)));
	let broadcaster = Arc::new(EventBroadcaster::new(Arc::clone(&registry), Arc::clone(&channels)));

	let snapshots = Arc::new(RuntimeSnapshots {
		registry: Arc::clone(&registry),
		channels: Arc::clone(&channels),
	});
	tokio::spawn(Arc::clone(&queue).run(
		queue_rx,
		snapshots,
		Arc::clone(&account_store),
		Arc::clone(&channel_store),
	));

	let settings = SettingsEngine::new(
		server_cfg.regulations.free_setting_cap,
		server_cfg.regulations.free_setting_value_len,
	);

	let ctx = Arc::new(ServerContext {
		accounts: account_store,
		registry,
		channels,
		broadcaster,
		settings,
		hasher: Arc::new(HmacPasswordHasher::new(
			server_cfg.server.credential_secret.as_bytes().to_vec(),
		)),
		totp: Arc::new(HmacTotpVerifier),
		config: server_cfg,
	});

	let listener = TcpListener::bind(&ctx.config.server.bind)
		.await
		.with_context(|| format!("bind {}", ctx.config.server.bind))?;
	info!(bind = %ctx.config.server.bind, "delegate_server listening");

	let mut next_conn_id: u64 = 1;

	loop {
		let (stream, remote) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(e) => {
				warn!(error = %e, "accept failed");
				continue;
			}
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("delegate_server_connections_total").increment(1);
		info!(conn_id, remote = %remote, "accepted connection");

		let ctx = Arc::clone(&ctx);
		tokio::spawn(async move {
			if let Err(e) = handle_connection(conn_id, stream, ctx).await {
				warn!(conn_id, error = %e, "connection handler exited with error");
			}
		});
	}
}
