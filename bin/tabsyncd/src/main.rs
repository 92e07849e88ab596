//! tabsync server binary.
//!
//! Wires the Postgres adapters to the session manager and serves:
//! - the sync transport (TCP, newline-delimited JSON frames)
//! - the control endpoints (HTTP: metrics, forced feed passes, stats)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tabsync_server::config::SyncConfig;
use tabsync_server::db::{Db, PgChangeFeed, PgChangeWriter, PgDomainTables};
use tabsync_server::manager::SessionManager;
use tabsync_server::metrics::Metrics;
use tabsync_server::progress::PgProgressFactory;
use tabsync_server::registry::ClientRegistry;
use tabsync_server::session::{Quarantine, SessionDeps};
use tabsync_server::{control, net};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Sync server command line arguments.
#[derive(Parser, Debug)]
#[command(name = "tabsyncd")]
#[command(about = "Replicates Postgres domain tables to client replicas")]
struct Args {
	/// Address for the sync transport
	#[arg(long, default_value = "127.0.0.1:8390")]
	listen: SocketAddr,

	/// Address for the control endpoints
	#[arg(long, default_value = "127.0.0.1:8391")]
	control: SocketAddr,

	/// Postgres connection string (falls back to DATABASE_URL)
	#[arg(long)]
	database_url: Option<String>,

	/// Rows per wire chunk
	#[arg(long)]
	chunk_size: Option<usize>,

	/// Rows per database cursor page
	#[arg(long)]
	page_size: Option<usize>,

	/// Seconds between registry sweeps
	#[arg(long, default_value_t = 3600)]
	sweep_interval: u64,

	/// Verbose logging
	#[arg(short, long)]
	verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	tracing_subscriber::fmt()
		.with_max_level(if args.verbose {
			tracing::Level::DEBUG
		} else {
			tracing::Level::INFO
		})
		.init();

	info!("starting tabsyncd");

	let database_url = match args.database_url {
		Some(url) => url,
		None => std::env::var("DATABASE_URL")
			.context("no --database-url and DATABASE_URL is unset")?,
	};

	let mut config = SyncConfig::default();
	if let Some(chunk_size) = args.chunk_size {
		config.chunk_size = chunk_size;
	}
	if let Some(page_size) = args.page_size {
		config.page_size = page_size;
	}

	let db = Db::from_url(&database_url)?;
	let progress = PgProgressFactory::new(db.clone());
	progress.ensure_schema().await?;

	let deps = SessionDeps {
		feed: Arc::new(PgChangeFeed::new(db.clone())),
		tables: Arc::new(PgDomainTables::new(db.clone())),
		writer: Arc::new(PgChangeWriter::new(db.clone(), config.statement_timeout)),
		progress: Arc::new(progress),
		registry: Arc::new(ClientRegistry::default()),
		quarantine: Arc::new(Quarantine::default()),
		metrics: Arc::new(Metrics::default()),
		config,
	};
	let manager = SessionManager::new(deps);

	let _control = control::spawn(args.control, manager.clone(), tokio::runtime::Handle::current())?;

	let sweeper = manager.clone();
	let sweep_interval = Duration::from_secs(args.sweep_interval.max(1));
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(sweep_interval);
		ticker.tick().await;
		loop {
			ticker.tick().await;
			sweeper.sweep().await;
		}
	});

	let shutdown = CancellationToken::new();
	let ctrl = shutdown.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			info!("interrupt received, shutting down");
			ctrl.cancel();
		}
	});

	let listener = TcpListener::bind(args.listen).await?;
	net::serve(listener, manager.clone(), shutdown).await?;

	manager.shutdown().await;
	Ok(())
}
