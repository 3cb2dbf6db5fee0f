//! digame-agent: offline cache and deferred-mutation sync agent.
//!
//! Sits between the Digame application and the network: serves GETs from a
//! versioned local cache, queues writes issued while offline, replays them
//! when connectivity returns, and routes push notifications back into open
//! application instances.

mod agent;
mod cache;
mod clients;
mod config;
mod intercept;
mod lifecycle;
mod net;
mod notify;
mod outbox;
mod sync;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use agent::{event_channel, spawn_periodic_sync, Agent, AgentEvent};
use cache::SqliteCacheStore;
use clients::ClientRegistry;
use config::Config;
use net::HttpNetwork;
use notify::LogDisplay;
use outbox::SqliteMutationStore;
use sync::SyncTrigger;

#[derive(Parser, Debug)]
#[command(name = "digame-agent")]
#[command(about = "Offline cache and sync agent for Digame")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/digame-agent/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Drain the pending-mutation outbox once and exit
  Sync,
}

/// Initialize the tracing subscriber: stderr plus a daily-rolled file in
/// the data directory. Use RUST_LOG to control the level.
fn init_tracing(data_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let file = tracing_appender::rolling::daily(data_dir.join("logs"), "digame-agent.log");
  let (file_writer, guard) = tracing_appender::non_blocking(file);

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(io::stderr))
    .with(fmt::layer().with_writer(file_writer).with_ansi(false))
    .with(filter)
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let data_dir = config.resolve_data_dir()?;
  let _guard = init_tracing(&data_dir);

  let store = Arc::new(SqliteCacheStore::open(&data_dir.join("cache.db"))?);
  let outbox = Arc::new(SqliteMutationStore::open(&data_dir.join("outbox.db"))?);
  let network = Arc::new(HttpNetwork::new(&config.origin)?);
  let registry = Arc::new(ClientRegistry::new());

  let agent = Agent::new(
    store,
    outbox,
    network,
    Arc::new(LogDisplay),
    registry,
    &config,
  )?;

  match args.command {
    Some(Command::Sync) => {
      let report = agent.run_sync(SyncTrigger::Requested).await?;
      println!("replayed {}, still queued {}", report.replayed, report.failed);
    }
    None => {
      info!(generation = %config.generation_name(), "digame-agent starting");

      agent.provision().await?;

      // The agent just came online; drain anything queued while it was down.
      if let Err(e) = agent
        .dispatch(AgentEvent::Sync {
          trigger: SyncTrigger::ConnectivityRegained,
        })
        .await
      {
        warn!(error = %e, "startup sync failed");
      }

      let (tx, driver) = event_channel();
      spawn_periodic_sync(tx.clone(), Duration::from_secs(config.sync_interval_secs));
      driver.run(&agent).await;
    }
  }

  Ok(())
}
