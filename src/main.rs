use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use outbox::cache::CacheLayer;
use outbox::config::Config;
use outbox::event::EventBus;
use outbox::queue::{MutationQueue, QueueStatus};
use outbox::remote::HttpRemote;
use outbox::store::{LocalStore, SqliteStore};
use outbox::sync::{spawn_probe, Connectivity, ConnectivityProbe, SyncEngine, SyncOrchestrator};

#[derive(Parser, Debug)]
#[command(name = "outbox")]
#[command(about = "Offline-first cache and mutation queue with replay against a remote backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/outbox/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show queue counts and whether the backend is reachable
  Status,
  /// List queued mutations, oldest first
  Queue {
    /// Only entries with this status (pending, syncing, failed)
    #[arg(long)]
    status: Option<String>,
  },
  /// Replay the queue once
  Sync,
  /// Keep the queue in sync until interrupted
  Run,
  /// Cache maintenance
  Cache {
    #[command(subcommand)]
    action: CacheCommand,
  },
  /// Drop entries that exhausted their retries
  DiscardFailed,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// Remove cached collections
  Clear {
    /// Only this owner's collections
    #[arg(long)]
    owner: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging(args.verbose)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let store = Arc::new(open_store(&config)?);

  match args.command {
    Command::Status => status(&config, &store).await,
    Command::Queue { status } => list_queue(&store, status.as_deref()),
    Command::Sync => sync_once(&config, store).await,
    Command::Run => run(&config, store).await,
    Command::Cache {
      action: CacheCommand::Clear { owner },
    } => {
      let removed = CacheLayer::new(store).clear(owner.as_deref());
      println!("Removed {} cached collection(s)", removed);
      Ok(())
    }
    Command::DiscardFailed => {
      let removed = MutationQueue::new(store, EventBus::default()).discard_failed()?;
      println!("Discarded {} failed entr{}", removed, if removed == 1 { "y" } else { "ies" });
      Ok(())
    }
  }
}

/// Log to a daily rolling file in the data directory, and to stderr when verbose.
fn init_logging(verbose: bool) -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("outbox")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "outbox.log"));
  let stderr = verbose.then(|| fmt::layer().with_writer(std::io::stderr));

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "outbox=info".into()))
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(stderr)
    .init();

  Ok(guard)
}

fn open_store(config: &Config) -> Result<SqliteStore> {
  match &config.database_path {
    Some(path) => SqliteStore::open(path),
    None => SqliteStore::open_default(),
  }
}

fn http_remote(config: &Config) -> Result<Arc<HttpRemote>> {
  let remote = HttpRemote::new(config.require_remote()?, Config::get_api_key())?;
  Ok(Arc::new(remote))
}

fn engine(
  config: &Config,
  store: Arc<SqliteStore>,
  remote: Arc<HttpRemote>,
) -> Arc<SyncEngine<SqliteStore, HttpRemote>> {
  Arc::new(SyncEngine::new(store, remote).with_max_retries(config.sync.max_retries))
}

async fn status(config: &Config, store: &SqliteStore) -> Result<()> {
  let pending = store.count_queue_entries(QueueStatus::Pending)?;
  let syncing = store.count_queue_entries(QueueStatus::Syncing)?;
  let failed = store.count_queue_entries(QueueStatus::Failed)?;

  println!("Owner:    {}", config.owner_id);
  println!("Pending:  {}", pending);
  if syncing > 0 {
    println!("Syncing:  {} (interrupted, requeued on next sync)", syncing);
  }
  println!("Failed:   {}", failed);

  match &config.remote {
    Some(remote_config) => {
      let remote = HttpRemote::new(remote_config, Config::get_api_key())?;
      let reachable = remote.is_reachable().await;
      println!(
        "Remote:   {} ({})",
        remote_config.url,
        if reachable { "online" } else { "offline" }
      );
    }
    None => println!("Remote:   not configured"),
  }
  Ok(())
}

fn list_queue(store: &Arc<SqliteStore>, status: Option<&str>) -> Result<()> {
  let status = status.map(str::parse::<QueueStatus>).transpose()?;
  let entries = MutationQueue::new(Arc::clone(store), EventBus::default()).entries(status)?;

  if entries.is_empty() {
    println!("Queue is empty");
    return Ok(());
  }

  for entry in entries {
    println!(
      "{:>6}  {}  {:<8} {:<8} {:<20} retries={}{}",
      entry.id,
      entry.created_at.format("%Y-%m-%d %H:%M:%S"),
      entry.status,
      entry.mutation.kind(),
      entry.table,
      entry.retry_count,
      entry
        .error
        .map(|e| format!("  error: {}", e))
        .unwrap_or_default()
    );
  }
  Ok(())
}

async fn sync_once(config: &Config, store: Arc<SqliteStore>) -> Result<()> {
  let remote = http_remote(config)?;
  if !remote.is_reachable().await {
    return Err(eyre!("Remote is not reachable, queue left untouched"));
  }

  let engine = engine(config, store, remote);
  engine.recover()?;
  let report = engine.process_sync_queue().await;
  println!("Synced {}, failed {}", report.synced, report.failed);
  Ok(())
}

async fn run(config: &Config, store: Arc<SqliteStore>) -> Result<()> {
  let remote = http_remote(config)?;
  let events = EventBus::default();
  let connectivity = Connectivity::new(remote.is_reachable().await);

  let orchestrator = Arc::new(
    SyncOrchestrator::new(
      engine(config, Arc::clone(&store), Arc::clone(&remote)),
      store,
      events,
      connectivity.clone(),
    )
    .with_settings(config.sync.orchestrator_settings()),
  );
  let mut status = orchestrator.subscribe();
  let probe = spawn_probe(remote, connectivity, config.sync.probe_interval());
  let handle = Arc::clone(&orchestrator).spawn();

  println!("Syncing, press Ctrl-C to stop");
  loop {
    tokio::select! {
      result = tokio::signal::ctrl_c() => {
        result.map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
        break;
      }
      changed = status.changed() => {
        if changed.is_err() {
          break;
        }
        let current = *status.borrow_and_update();
        tracing::info!(
          online = current.is_online,
          pending = current.pending_sync_count,
          failed = current.failed_sync_count,
          syncing = current.is_syncing,
          "sync status"
        );
      }
    }
  }

  probe.abort();
  handle.shutdown().await;
  Ok(())
}
