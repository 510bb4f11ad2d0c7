//! beacon - CLI tool for inspecting and driving the delivery queue
//!
//! This tool provides commands for:
//! - Showing configuration and per-dispatcher queue sizes
//! - Queueing a dispatch by hand
//! - Purging or pruning queued entries
//! - Force-sending the queue through the collect dispatcher
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/beacon/queue.db (~/.local/share/beacon/queue.db)
//! - Config: $XDG_CONFIG_HOME/beacon/config.toml (~/.config/beacon/config.toml)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use beacon_core::connectivity::{ConnectivityManager, ManualMonitor};
use beacon_core::dispatcher::{CollectDispatcher, COLLECT_DISPATCHER_ID};
use beacon_core::{Config, Database, Dispatch, Payload, QueueManager, Tracker};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "beacon")]
#[command(about = "Inspect and drive the beacon delivery queue")]
#[command(version)]
struct Args {
    /// Also print logs to stderr
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration and queue sizes
    Status,

    /// Queue a dispatch
    Enqueue {
        /// Event name
        name: String,

        /// Target dispatcher (repeatable, default: collect)
        #[arg(short, long = "dispatcher")]
        dispatchers: Vec<String>,

        /// Payload as a JSON object
        #[arg(long)]
        data: Option<String>,
    },

    /// Delete every queued entry for a dispatcher
    Purge {
        /// Dispatcher id
        dispatcher: String,
    },

    /// Delete entries older than their dispatcher's expiration
    Prune,

    /// Deliver the collect queue now.
    ///
    /// Entries queued for other dispatchers are dropped, as on any tracker
    /// start that does not register them.
    Send {
        /// Seconds to wait for the queue to drain
        #[arg(short, long, default_value_t = 30)]
        timeout: u64,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load().context("failed to load configuration")?;

    let mut logging = config.logging.clone();
    logging.stderr |= args.verbose;
    let _log_guard = beacon_core::logging::init(&logging).context("failed to initialize logging")?;

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Enqueue {
            name,
            dispatchers,
            data,
        } => cmd_enqueue(&config, name, dispatchers, data),
        Command::Purge { dispatcher } => cmd_purge(&config, &dispatcher),
        Command::Prune => cmd_prune(&config),
        Command::Send { timeout } => cmd_send(config, Duration::from_secs(timeout)),
    }
}

fn open_database() -> Result<Arc<Database>> {
    let db_path = Config::database_path();
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    db.migrate().context("failed to run database migrations")?;
    Ok(Arc::new(db))
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("Beacon Configuration");
    println!("====================");
    println!();
    println!("Config file:     {}", Config::config_path().display());
    println!("Database:        {}", Config::database_path().display());
    println!("Logs:            {}", beacon_core::logging::log_dir().display());
    println!();
    println!("Max queue size:  {}", config.queue.max_queue_size);
    println!(
        "Expiration:      {} {:?}",
        config.queue.expiration.interval, config.queue.expiration.unit
    );
    println!("Settle:          {}ms", config.coordinator.settle_ms);

    if !config.barriers.is_empty() {
        println!();
        println!("Barriers:");
        let mut ids: Vec<_> = config.barriers.keys().collect();
        ids.sort();
        for id in ids {
            let settings = &config.barriers[id];
            let scopes = match &settings.scopes {
                Some(scopes) => scopes
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
                None => "default".to_string(),
            };
            println!(
                "  {:<14} scopes: {:<20} {}",
                id,
                scopes,
                serde_json::Value::Object(settings.configuration.clone())
            );
        }
    }

    println!();
    println!("Collect:         {}", if config.collect.is_ready() { "ready" } else { "disabled" });
    if config.collect.enabled {
        println!(
            "  URL:           {}",
            config.collect.url.as_deref().unwrap_or("<not set>")
        );
        println!("  Batch limit:   {}", config.collect.dispatch_limit);
    }

    let db_path = Config::database_path();
    if !db_path.exists() {
        println!();
        println!("No queue database yet.");
        return Ok(());
    }

    let db = open_database()?;
    let mut sizes: Vec<_> = db.queue_sizes()?.into_iter().collect();
    sizes.sort();

    println!();
    println!("Queued dispatches: {}", db.dispatch_count()?);
    if sizes.is_empty() {
        println!("  (queue is empty)");
    }
    for (dispatcher, size) in sizes {
        println!(
            "  {:<20} {:>6} / {}",
            dispatcher,
            size,
            config.queue.max_queue_size_for(&dispatcher)
        );
    }
    println!("Database size:   {} bytes", db.get_database_size()?);

    Ok(())
}

fn cmd_enqueue(
    config: &Config,
    name: String,
    dispatchers: Vec<String>,
    data: Option<String>,
) -> Result<()> {
    let payload: Payload = match data {
        Some(data) => serde_json::from_str(&data).context("--data must be a JSON object")?,
        None => Payload::new(),
    };
    let dispatchers = if dispatchers.is_empty() {
        vec![COLLECT_DISPATCHER_ID.to_string()]
    } else {
        dispatchers
    };

    let queue = QueueManager::new(open_database()?, config.queue.clone());
    let dispatch = Dispatch::with_payload(name, payload);
    queue.store_dispatches(std::slice::from_ref(&dispatch), &dispatchers);

    println!("Queued {} for {}", dispatch.id, dispatchers.join(", "));
    for dispatcher in &dispatchers {
        println!("  {:<20} {:>6}", dispatcher, queue.queue_size(dispatcher));
    }
    Ok(())
}

fn cmd_purge(config: &Config, dispatcher: &str) -> Result<()> {
    let queue = QueueManager::new(open_database()?, config.queue.clone());
    let removed = queue.delete_all_dispatches(dispatcher);
    println!("Removed {} entries for {}", removed, dispatcher);
    Ok(())
}

fn cmd_prune(config: &Config) -> Result<()> {
    let db = open_database()?;
    let dispatchers = db.queued_dispatcher_ids()?;
    let queue = QueueManager::new(db, config.queue.clone());
    let removed = queue.delete_expired(&dispatchers);
    println!(
        "Removed {} expired entries across {} dispatchers",
        removed,
        dispatchers.len()
    );
    Ok(())
}

fn cmd_send(config: Config, timeout: Duration) -> Result<()> {
    if !config.collect.is_ready() {
        bail!("collect dispatcher is not configured. Run 'status' for details.");
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create runtime")?;

    runtime.block_on(async move {
        let db = open_database()?;

        // No OS monitor on the command line: availability is empirical only
        let connectivity = Arc::new(ConnectivityManager::new(
            Arc::new(ManualMonitor::default()),
            &config.connectivity,
        ));
        let dispatcher = CollectDispatcher::new(&config.collect, connectivity.clone())
            .context("failed to create collect dispatcher")?;

        let tracker = Tracker::builder(config, db, connectivity)
            .dispatcher(Arc::new(dispatcher))
            .build();

        let before = tracker.queue().queue_size(COLLECT_DISPATCHER_ID);
        println!("Sending {} queued dispatches...", before);
        tracker.flush();

        let mut sizes = tracker.queue().metrics().sizes();
        let drained = tokio::time::timeout(
            timeout,
            sizes.wait_for(|sizes| !sizes.contains_key(COLLECT_DISPATCHER_ID)),
        )
        .await
        .is_ok();

        let after = tracker.queue().queue_size(COLLECT_DISPATCHER_ID);
        tracker.shutdown().await;

        println!("Delivered {}, {} still queued", before.saturating_sub(after), after);
        if !drained {
            println!("Timed out after {}s", timeout.as_secs());
        }
        Ok(())
    })
}
