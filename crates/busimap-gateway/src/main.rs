use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use busimap_core::config::BusimapConfig;
use busimap_health::probes::{CacheProbe, DatastoreProbe, SearchProbe};
use busimap_health::{HealthAggregator, ProbeSpec};
use busimap_scheduler::{EventKind, InstanceStore, JobEvent, JobRegistry, Scheduler};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

mod app;
mod http;
mod jobs;

#[derive(Parser)]
#[command(name = "busimap-gateway", version, about = "BusiMap health and job gateway")]
struct Cli {
    /// Config file (defaults to ~/.busimap/busimap.toml)
    #[arg(long, env = "BUSIMAP_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway and the job scheduler (default)
    Serve,
    /// Probe every dependency once, print the report and exit non-zero if unhealthy
    Check,
    /// List registered jobs and their schedules
    Jobs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "busimap_gateway=info,busimap_scheduler=info,busimap_health=info,tower_http=debug"
                    .into()
            }),
        )
        .init();

    let cli = Cli::parse();

    let config = BusimapConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        BusimapConfig::default()
    });

    let health = Arc::new(build_health(&config)?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Check => check(&config, &health).await,
        Command::Jobs => {
            let (registry, _) = build_registry(&config, &health)?;
            for def in registry.definitions() {
                let schedule = match def.schedule {
                    Some(ref s) => serde_json::to_string(s)?,
                    None => "on demand".to_string(),
                };
                println!("{:<32} {}", def.name, schedule);
            }
            Ok(())
        }
        Command::Serve => serve(config, health).await,
    }
}

async fn serve(config: BusimapConfig, health: Arc<HealthAggregator>) -> anyhow::Result<()> {
    let (registry, store) = build_registry(&config, &health)?;

    let (events_tx, mut events_rx) = tokio::sync::mpsc::channel::<JobEvent>(256);
    let scheduler = Arc::new(
        Scheduler::new(Arc::new(registry), store, &config.scheduler)
            .with_gate(health.clone())
            .with_events(events_tx),
    );

    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            log_event(&event);
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown_rx));

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let state = Arc::new(app::AppState::new(config, health, scheduler));
    let router = app::build_router(state);

    info!("BusiMap gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for shutdown signal: {e}");
            }
        })
        .await?;

    // signal scheduler to stop
    let _ = shutdown_tx.send(true);
    let _ = scheduler_task.await;
    Ok(())
}

async fn check(config: &BusimapConfig, health: &HealthAggregator) -> anyhow::Result<()> {
    let report = health.aggregate().await;
    println!(
        "{}",
        serde_json::to_string_pretty(&report.to_body(&config.gateway.api_version))?
    );
    if !report.is_healthy() {
        std::process::exit(1);
    }
    Ok(())
}

/// Register the datastore and cache probes, plus the search probe when a
/// search index is configured.
fn build_health(config: &BusimapConfig) -> anyhow::Result<HealthAggregator> {
    let timeout = Duration::from_secs(config.health.probe_timeout_secs);

    let search = config.search.as_ref().map(|s| {
        let spec = ProbeSpec::new(Arc::new(SearchProbe::new(s.url.clone())), timeout);
        if s.required {
            spec
        } else {
            spec.optional()
        }
    });

    let aggregator = HealthAggregator::builder()
        .probe(ProbeSpec::new(
            Arc::new(DatastoreProbe::new(&config.database.path)),
            timeout,
        ))
        .probe(ProbeSpec::new(
            Arc::new(CacheProbe::new(&config.cache.url)?),
            timeout,
        ))
        .probe_if_configured(search)
        .margin(Duration::from_millis(config.health.budget_margin_ms))
        .build()?;

    info!(probes = ?aggregator.probe_names(), budget_ms = aggregator.budget().as_millis() as u64, "health probes registered");
    Ok(aggregator)
}

/// Open the database and fill the job registry.
fn build_registry(
    config: &BusimapConfig,
    health: &Arc<HealthAggregator>,
) -> anyhow::Result<(JobRegistry, Arc<InstanceStore>)> {
    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    let store = Arc::new(InstanceStore::new(db)?);

    let deps = jobs::JobDeps {
        store: Arc::clone(&store),
        health: Arc::clone(health),
        cache_url: config.cache.url.clone(),
        api_version: config.gateway.api_version.clone(),
    };
    let mut registry = JobRegistry::new();
    jobs::register_builtin(&mut registry, &config.scheduler, &deps)?;
    Ok((registry, store))
}

fn log_event(event: &JobEvent) {
    let detail = event.detail.as_deref().unwrap_or("");
    match event.kind {
        EventKind::Dead => error!(
            job = %event.job_name,
            instance_id = %event.instance_id,
            attempts = event.attempt_count,
            "job dead: {detail}"
        ),
        EventKind::Failed | EventKind::TimedOut | EventKind::Retrying | EventKind::Deferred => {
            warn!(
                job = %event.job_name,
                instance_id = %event.instance_id,
                kind = ?event.kind,
                "{detail}"
            )
        }
        _ => info!(
            job = %event.job_name,
            instance_id = %event.instance_id,
            kind = ?event.kind,
            state = %event.state,
            "job event"
        ),
    }
}

/// Create the parent directory for a file path if it doesn't exist.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
}
