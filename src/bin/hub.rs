use std::sync::Arc;

use anyhow::Context;
use backend_monitor::{
    actors::SchedulerHandle,
    alerts::AlertManager,
    api::{ApiState, spawn_api_server},
    config::{Config, LivenessMethod, StorageConfig, StorageKind, read_config_file},
    ingest::{AgentClient, Ingestor},
    storage::{MemoryBackend, StorageBackend, sqlite::SqliteBackend},
    tiles::{LivenessCache, LivenessProbe, PingProbe, TcpConnectProbe, TileEngine},
};
use chrono::Utc;
use clap::Parser;
use tracing::{debug, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("backend_monitor", LevelFilter::DEBUG),
        ("monitor_hub", LevelFilter::TRACE),
        ("tower_http", LevelFilter::DEBUG),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

async fn open_storage(config: &StorageConfig) -> anyhow::Result<Arc<dyn StorageBackend>> {
    match config.backend {
        StorageKind::None => {
            warn!("using in-memory storage, history is lost on restart");
            Ok(Arc::new(MemoryBackend::new()))
        }
        StorageKind::Sqlite => {
            let backend = SqliteBackend::new(&config.path)
                .await
                .with_context(|| format!("failed to open database {}", config.path.display()))?;
            Ok(Arc::new(backend))
        }
    }
}

fn liveness_probe(config: &Config) -> Arc<dyn LivenessProbe> {
    match config.liveness.method {
        LivenessMethod::Icmp => Arc::new(PingProbe),
        LivenessMethod::Tcp => Arc::new(TcpConnectProbe),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)
        .with_context(|| format!("failed to load {}", args.file))?;

    let storage = open_storage(&config.storage).await?;

    let target_ids = config
        .sync_targets(storage.as_ref())
        .await
        .context("failed to store targets")?;
    let tile_definitions = config.tile_definitions(&target_ids)?;

    // The retention window may have shrunk since the last run
    let retention = config.storage.retention();
    let pruned = storage
        .prune(&retention, Utc::now())
        .await
        .context("failed to prune expired snapshots")?;
    if pruned > 0 {
        info!("pruned {pruned} expired snapshots");
    }
    match storage.get_stats().await {
        Ok(stats) => debug!("storage: {stats}"),
        Err(e) => warn!("could not read storage stats: {e}"),
    }
    info!(
        "monitoring {} targets with {} tiles",
        target_ids.len(),
        tile_definitions.len()
    );

    let client = AgentClient::new(config.request_timeout()).context("failed to build HTTP client")?;
    let mut ingestor = Ingestor::new(client, Arc::clone(&storage), retention);
    if let Some(alert) = config.alert.clone() {
        ingestor = ingestor.with_notifier(Arc::new(AlertManager::new(alert)));
    }
    let ingestor = Arc::new(ingestor);

    // Thresholds may differ from the ones the stored warnings were computed with
    let rewritten = ingestor
        .update_thresholds(config.thresholds)
        .await
        .context("failed to re-evaluate stored warnings")?;
    if rewritten > 0 {
        info!("re-evaluated warnings of {rewritten} snapshots");
    }

    let scheduler = SchedulerHandle::spawn(Arc::clone(&ingestor), config.scheduler.tick());

    if config.api.enabled {
        let liveness = Arc::new(LivenessCache::new(
            liveness_probe(&config),
            config.request_timeout(),
        ));
        let tiles = Arc::new(TileEngine::new(Arc::clone(&storage), liveness));
        let state = ApiState::new(
            Arc::clone(&storage),
            scheduler.clone(),
            tiles,
            tile_definitions,
        );
        spawn_api_server(&config.api, state).await?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    scheduler.shutdown().await?;
    storage.close().await?;

    Ok(())
}
