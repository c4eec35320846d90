use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

use spotsync::backend::RestBackend;
use spotsync::cache::{KeyValueStorage, NoopStorage, PersistentCache, SqliteStorage};
use spotsync::config::Config;
use spotsync::network::HttpProbe;
use spotsync::sync::{SyncOutcome, SyncReport};
use spotsync::{
  MutationKind, MutationQueue, NetworkMonitor, QueryClient, SyncDataSource, SyncOrchestrator,
};

#[derive(Parser, Debug)]
#[command(name = "spotsync")]
#[command(about = "Offline-first cache, write queue and background sync for the spots backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/spotsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run a single sync cycle: replay queued writes, then refresh sources
  Sync,
  /// Probe connectivity and keep syncing in the background until Ctrl-C
  Run,
  /// Queue a write for replay on the next sync
  Enqueue {
    /// create, update or delete
    kind: MutationKind,
    /// Target table
    resource: String,
    /// JSON object payload (update and delete need an "id" field)
    payload: String,
  },
  /// Inspect or manage the offline write queue
  Queue {
    #[command(subcommand)]
    action: Option<QueueAction>,
  },
  /// Read a configured source through the query cache
  Fetch {
    key: String,
    /// Skip the cache and go straight to the network
    #[arg(long)]
    refresh: bool,
  },
  /// Manage cached reads
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
  /// List pending writes (default)
  List,
  /// Drop every pending write
  Clear,
  /// List writes that exhausted their retries
  Dead,
  /// Move a dead-lettered write back into the queue
  Requeue { id: String },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// Remove every cached read
  Clear,
  /// Remove one cached read
  Remove { key: String },
}

/// Long-lived services shared by every command.
struct Services {
  config: Config,
  network: Arc<NetworkMonitor>,
  cache: Arc<PersistentCache>,
  queue: Arc<MutationQueue>,
  client: Arc<QueryClient>,
  backend: RestBackend,
  orchestrator: Arc<SyncOrchestrator>,
  sources: Vec<SyncDataSource>,
}

impl Services {
  fn build(config: Config) -> Result<Self> {
    let storage: Arc<dyn KeyValueStorage> = if config.cache.persist {
      let storage = match &config.cache.path {
        Some(path) => SqliteStorage::open_at(path)?,
        None => SqliteStorage::open()?,
      };
      Arc::new(storage)
    } else {
      Arc::new(NoopStorage)
    };

    let network = Arc::new(NetworkMonitor::new());
    let cache = Arc::new(PersistentCache::new(Arc::clone(&storage)));
    let queue = Arc::new(
      MutationQueue::new(storage, Arc::clone(&network))
        .with_max_retries(config.sync.max_mutation_retries),
    );
    queue.rehydrate();

    let client = Arc::new(QueryClient::new(Arc::clone(&cache)).with_defaults(config.query_options()));

    let mut backend = RestBackend::new(
      config.backend.url.clone(),
      &config.backend.schema_path,
      Config::get_api_key()?,
    )?
    .with_retry(config.query.retry_policy());
    if let Some(token) = Config::get_access_token() {
      backend = backend.with_access_token(token);
    }

    let sources = config
      .sources
      .iter()
      .map(|s| {
        let ttl = s
          .ttl_secs
          .map(Duration::from_secs)
          .unwrap_or_else(|| config.cache.ttl());
        backend.table_source(s.key.as_deref(), &s.table, &s.query, ttl)
      })
      .collect();

    let orchestrator = Arc::new(SyncOrchestrator::new(
      Arc::clone(&queue),
      Arc::clone(&cache),
      Arc::clone(&network),
    ));

    Ok(Self {
      config,
      network,
      cache,
      queue,
      client,
      backend,
      orchestrator,
      sources,
    })
  }

  fn probe(&self) -> Result<HttpProbe> {
    let probe = HttpProbe::new(self.backend.root().clone(), self.config.sync.probe_interval())?;
    Ok(probe)
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _log_guard = init_tracing()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let services = Services::build(config)?;

  match args.command {
    Command::Sync => {
      services.probe()?.refresh(&services.network).await;
      let outcome = services
        .orchestrator
        .run_sync(&services.sources, &services.backend)
        .await;
      print_outcome(&outcome);
    }
    Command::Run => run(&services).await?,
    Command::Enqueue {
      kind,
      resource,
      payload,
    } => {
      let payload = match serde_json::from_str::<Value>(&payload)? {
        Value::Object(map) => map,
        other => return Err(eyre!("Payload must be a JSON object, got: {}", other)),
      };
      let mutation = services.queue.enqueue(kind, &resource, payload);
      println!("{}", mutation.id);
    }
    Command::Queue { action } => match action.unwrap_or(QueueAction::List) {
      QueueAction::List => print_json(&services.queue.pending())?,
      QueueAction::Clear => {
        services.queue.clear();
        println!("Queue cleared");
      }
      QueueAction::Dead => print_json(&services.queue.dead_letters())?,
      QueueAction::Requeue { id } => {
        if !services.queue.requeue_dead_letter(&id) {
          return Err(eyre!("No dead-lettered mutation with id {}", id));
        }
        println!("Requeued {}", id);
      }
    },
    Command::Fetch { key, refresh } => fetch(&services, &key, refresh).await?,
    Command::Cache { action } => match action {
      CacheAction::Clear => {
        services.cache.clear_all();
        println!("Cache cleared");
      }
      CacheAction::Remove { key } => {
        services.cache.remove(&key);
        println!("Removed {}", key);
      }
    },
  }

  Ok(())
}

async fn run(services: &Services) -> Result<()> {
  let probe = services.probe()?;
  probe.refresh(&services.network).await;
  let probe_task = probe.spawn(Arc::clone(&services.network));

  services.orchestrator.start(
    services.sources.clone(),
    Arc::new(services.backend.clone()),
    services.config.sync.interval(),
  );

  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
  info!("Shutting down");

  services.orchestrator.stop();
  probe_task.abort();
  print_json(&services.orchestrator.status())
}

async fn fetch(services: &Services, key: &str, refresh: bool) -> Result<()> {
  let source = services
    .sources
    .iter()
    .find(|s| s.key == key)
    .ok_or_else(|| eyre!("No source configured with key {}", key))?;

  services.probe()?.refresh(&services.network).await;

  let fetcher = Arc::clone(&source.fetcher);
  let mut query = services
    .client
    .query(Some(key), move || fetcher())
    .with_ttl(source.ttl)
    .persist(true);

  if refresh {
    query.refetch();
  } else {
    query.activate();
  }
  query.settle().await;

  if let Some(error) = query.error() {
    eprintln!("Fetch failed: {}", error);
  }
  match query.data() {
    Some(data) => {
      if query.is_stale() {
        eprintln!("(stale)");
      }
      print_json(data)
    }
    None => Err(eyre!("No data available for {}", key)),
  }
}

fn print_outcome(outcome: &SyncOutcome) {
  match outcome {
    SyncOutcome::Offline => println!("Offline: nothing synced"),
    SyncOutcome::AlreadyRunning => println!("A sync is already running"),
    SyncOutcome::Completed(SyncReport {
      queue,
      refreshed,
      failed,
    }) => {
      println!(
        "Mutations: {} attempted, {} succeeded, {} retained, {} dead-lettered",
        queue.attempted, queue.succeeded, queue.retained, queue.dead_lettered
      );
      println!("Sources refreshed: {}", refreshed.join(", "));
      for (key, error) in failed {
        println!("Source {} failed: {}", key, error);
      }
    }
  }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

/// Log to stderr and to a daily file under the data directory.
fn init_tracing() -> Result<Option<WorkerGuard>> {
  use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);

  let Some(logs_dir) = dirs::data_dir().map(|d| d.join("spotsync").join("logs")) else {
    tracing_subscriber::registry().with(filter).with(stderr).try_init()?;
    return Ok(None);
  };
  create_dir(&logs_dir)?;

  let appender = tracing_appender::rolling::daily(&logs_dir, "spotsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  tracing_subscriber::registry()
    .with(filter)
    .with(stderr)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .try_init()?;

  Ok(Some(guard))
}

fn create_dir(path: &Path) -> Result<()> {
  std::fs::create_dir_all(path)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", path.display(), e))
}
