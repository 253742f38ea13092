//! cohort server binary.
//!
//! Reads `config.toml` (or the path specified with `--config`) plus `COHORT_*`
//! environment variables, opens the SQLite store, and either serves the HTTP
//! API or runs a one-off snapshot build.
//!
//! # Password hash generation
//!
//! To generate the argon2 PHC string for `admin_password_hash`:
//!
//! ```
//! cargo run -p cohort-server -- hash-password
//! ```

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context as _;
use argon2::{Argon2, PasswordHasher, password_hash::SaltString};
use clap::{Parser, Subcommand};
use cohort_core::{
  builder::ProgressLevel,
  events::{EventBus, TracingListener},
  history::ProductId,
  job::SnapshotService,
};
use cohort_server::{AppState, ServerConfig, worker};
use cohort_store_sqlite::SqliteStore;
use rand_core::OsRng;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Cohort retention analytics server")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "config.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
  /// Serve the HTTP API (the default).
  Serve,
  /// Rebuild retention snapshots in the foreground and print a summary.
  GenerateSnapshots {
    /// Restrict the build to one product.
    #[arg(long)]
    product_id: Option<ProductId>,
  },
  /// Print the argon2 hash for a password entered on stdin and exit.
  HashPassword,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  match cli.command.unwrap_or(Command::Serve) {
    Command::HashPassword => hash_password(),
    Command::GenerateSnapshots { product_id } => {
      generate_snapshots(load_config(&cli.config)?, product_id).await
    }
    Command::Serve => serve(load_config(&cli.config)?).await,
  }
}

fn load_config(path: &Path) -> anyhow::Result<ServerConfig> {
  let settings = config::Config::builder()
    .add_source(config::File::from(path).required(false))
    .add_source(config::Environment::with_prefix("COHORT"))
    .build()
    .context("failed to read config file")?;

  settings
    .try_deserialize()
    .context("failed to deserialise ServerConfig")
}

async fn open_store(cfg: &ServerConfig) -> anyhow::Result<SqliteStore> {
  // Expand `~` in store path.
  let store_path = expand_tilde(&cfg.store_path);
  SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))
}

fn event_bus() -> Arc<EventBus> {
  let mut events = EventBus::new();
  events.register(TracingListener);
  Arc::new(events)
}

// ─── serve ────────────────────────────────────────────────────────────────────

async fn serve(cfg: ServerConfig) -> anyhow::Result<()> {
  cfg.validate().context("invalid configuration")?;
  let store = Arc::new(open_store(&cfg).await?);

  let mut service = SnapshotService::new(store, event_bus());
  let mut receiver = None;
  if cfg.background_jobs {
    let (queue, rx) = worker::channel();
    service = service.with_queue(Arc::new(queue));
    if let Some(budget) = cfg.job_time_budget() {
      service = service.with_budget(budget);
    }
    receiver = Some(rx);
  }
  let service = Arc::new(service);

  if let Some(rx) = receiver {
    worker::spawn_worker(Arc::clone(&service), rx);
  } else {
    tracing::info!("background jobs disabled; snapshot builds run inline");
  }

  let state = AppState { service, auth: Arc::new(cfg.auth()) };
  let app = cohort_server::router(state);
  let address = format!("{}:{}", cfg.host, cfg.port);

  tracing::info!("Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app).await.context("server error")?;

  Ok(())
}

// ─── generate-snapshots ───────────────────────────────────────────────────────

fn print_progress(message: &str, level: ProgressLevel) {
  let tag = match level {
    ProgressLevel::Info => "INFO",
    ProgressLevel::Success => " OK ",
    ProgressLevel::Warning => "WARN",
    ProgressLevel::Error => "FAIL",
  };
  println!("[{tag}] {message}");
}

async fn generate_snapshots(cfg: ServerConfig, product_id: Option<ProductId>) -> anyhow::Result<()> {
  let store = Arc::new(open_store(&cfg).await?);
  let service = SnapshotService::new(store, event_bus());

  let report = service
    .run_synchronous(product_id, &print_progress)
    .await
    .context("snapshot generation failed")?;

  println!();
  println!("Rows written:     {}", report.rows_written);
  println!("Total records:    {}", report.stats.total_records);
  println!("Unique cohorts:   {}", report.stats.unique_cohorts);
  println!("Unique periods:   {}", report.stats.unique_periods);
  println!("Unique products:  {}", report.stats.unique_products);
  Ok(())
}

// ─── hash-password ────────────────────────────────────────────────────────────

fn hash_password() -> anyhow::Result<()> {
  let password = read_password()?;
  let salt = SaltString::generate(&mut OsRng);
  let hash = Argon2::default()
    .hash_password(password.as_bytes(), &salt)
    .map_err(|e| anyhow::anyhow!("argon2 error: {e}"))?
    .to_string();
  println!("{hash}");
  Ok(())
}

/// Read a password from stdin.
fn read_password() -> anyhow::Result<String> {
  use std::io::{self, BufRead, Write};
  let stdin = io::stdin();
  print!("Password: ");
  io::stdout().flush().ok();
  let mut line = String::new();
  stdin.lock().read_line(&mut line)?;
  let password = line.trim_end_matches(['\n', '\r']).to_string();
  anyhow::ensure!(!password.is_empty(), "password must not be empty");
  Ok(password)
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
