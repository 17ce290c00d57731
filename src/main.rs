use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tillsync::app::App;
use tillsync::config::Config;
use tillsync::lifecycle::LifecycleController;
use tillsync::proxy::CacheClass;

#[derive(Parser, Debug)]
#[command(name = "tillsync")]
#[command(about = "Offline-first sync core for a restaurant point-of-sale")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tillsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the background sync loop until interrupted (default)
  Run,
  /// Precache the shell and download reference data
  Install {
    /// Download reference data even if it is already present
    #[arg(long)]
    force: bool,
  },
  /// Run one reconciliation pass and print the session
  Sync,
  /// Show queue and cache status
  Status,
  /// List writes the remote rejected
  Failed,
  /// Move a failed write back into the queue
  Retry { sequence: i64 },
  /// Drop a failed write
  Discard { sequence: i64 },
  /// Clear cached responses, optionally for one class only
  PurgeCache { class: Option<CacheClass> },
  /// Remove old closed orders from the local store
  Sweep,
}

#[derive(Serialize)]
struct StatusReport {
  online: bool,
  ready: bool,
  pending: usize,
  failed: usize,
  cache: tillsync::proxy::CacheStatus,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.verbose);

  let config = Config::load(args.config.as_deref())?;
  let app = Arc::new(App::open(config)?);

  match args.command.unwrap_or(Command::Run) {
    Command::Run => run(app).await?,
    Command::Install { force } => {
      let installed = app.proxy().install().await?;
      if app.config().cache.auto_activate {
        app.proxy().activate()?;
      }
      let report = app.download_essential_data(force).await?;
      println!("precached {} responses", installed);
      print_json(&report)?;
    }
    Command::Sync => {
      app.queue().recover_in_flight()?;
      match app.force_sync().await {
        Some(session) => print_json(&session?)?,
        None => println!("a run is already in progress"),
      }
    }
    Command::Status => {
      let report = StatusReport {
        online: app.is_online(),
        ready: app.is_ready()?,
        pending: app.pending_count()?,
        failed: app.failed_count()?,
        cache: app.cache_status()?,
      };
      print_json(&report)?;
    }
    Command::Failed => {
      for item in app.failed_items()? {
        println!(
          "{:>6}  {:<12} {:<8} {}  {}",
          item.sequence,
          item.table.as_str(),
          item.operation.as_str(),
          item.record_id,
          item.last_error.as_deref().unwrap_or("-")
        );
      }
    }
    Command::Retry { sequence } => {
      if !app.retry_failed(sequence)? {
        return Err(eyre!("No failed write with sequence {}", sequence));
      }
      println!("write {} queued again", sequence);
    }
    Command::Discard { sequence } => match app.discard_failed(sequence)? {
      Some(item) => println!("discarded {} {} {}", item.operation, item.table, item.record_id),
      None => return Err(eyre!("No failed write with sequence {}", sequence)),
    },
    Command::PurgeCache { class } => {
      let removed = app.proxy().purge(class)?;
      println!("removed {} cached responses", removed);
    }
    Command::Sweep => {
      let report = app.sweep_retention()?;
      println!(
        "removed {} orders and {} order items",
        report.orders_removed, report.items_removed
      );
    }
  }

  Ok(())
}

async fn run(app: Arc<App>) -> Result<()> {
  let mut controller = LifecycleController::init(app).await?;
  let result = tokio::select! {
    result = controller.run() => result,
    _ = tokio::signal::ctrl_c() => {
      tracing::info!("interrupt received, shutting down");
      Ok(())
    }
  };
  controller.shutdown().await;
  result
}

/// Daily log file under the data directory, plus stderr when verbose.
fn init_tracing(verbose: bool) -> Option<WorkerGuard> {
  let filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| "tillsync=info".into());

  let (file_layer, guard) = match dirs::data_dir() {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir.join("tillsync").join("logs"), "tillsync.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };
  let stderr_layer = verbose.then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

  tracing_subscriber::registry()
    .with(filter)
    .with(file_layer)
    .with(stderr_layer)
    .init();
  guard
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let text = serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to encode output: {}", e))?;
  println!("{}", text);
  Ok(())
}
