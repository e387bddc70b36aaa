//! IM routing service entry point
//!
//! Wires the router, sequencer, presence registry, offline pipeline
//! and read-receipt tracker onto shared Redis / Kafka / PostgreSQL
//! connections and serves the HTTP surface. Exit code 0 on graceful
//! shutdown, non-zero on startup failure.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info};

use magpie::bus::{BusConsumer, BusProducer, KafkaConsumer, KafkaProducer, topics};
use magpie::config::ImConfig;
use magpie::db::Database;
use magpie::im::repository::{
    OfflineMessageRepository, PgOfflineMessageRepository, PgReceiptRepository,
    PgSnapshotRepository, ReceiptRepository, SnapshotRepository,
};
use magpie::im::{
    HttpGatewayClient, MessageRouter, OfflineTtlSweeper, OfflineWriter, PresenceRegistry,
    ReadReceiptTracker, RedisRegistry, RegistryBackend, Sequencer, WordFilter, api,
    presence::PRESENCE_PREFIX,
};
use magpie::logging::init_logging;
use magpie::store::{FastStore, RedisStore};

/// Scan interval of the registry watch pump; bounds lookup staleness
const REGISTRY_SCAN_INTERVAL: Duration = Duration::from_secs(1);

fn config_path() -> String {
    let args: Vec<String> = std::env::args().collect();
    args.iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .unwrap_or_else(|| "config/im.yaml".to_string())
}

#[tokio::main]
async fn main() {
    let path = config_path();
    let config = match ImConfig::from_file(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: failed to load config {path}: {e}");
            std::process::exit(1);
        }
    };
    let _guard = init_logging(&config.log);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        git = env!("GIT_HASH"),
        config = %path,
        "im-server starting"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "im-server failed");
        std::process::exit(1);
    }
}

async fn run(config: ImConfig) -> anyhow::Result<()> {
    let db = Database::bootstrap(&config.stores.database_url).await?;
    let pool = db.pool().clone();

    let store: Arc<dyn FastStore> = Arc::new(RedisStore::connect(&config.stores.redis_url).await?);
    let producer: Arc<dyn BusProducer> =
        Arc::new(KafkaProducer::new(&config.stores.kafka_brokers)?);
    let offline_consumer: Arc<dyn BusConsumer> = Arc::new(KafkaConsumer::new(
        &config.stores.kafka_brokers,
        &format!("{}-offline-writer", config.stores.kafka_group_id),
        topics::OFFLINE_MSG,
    )?);

    let offline_repo: Arc<dyn OfflineMessageRepository> =
        Arc::new(PgOfflineMessageRepository::new(pool.clone()));
    let snapshots: Arc<dyn SnapshotRepository> =
        Arc::new(PgSnapshotRepository::new(pool.clone()));
    let receipts_repo: Arc<dyn ReceiptRepository> =
        Arc::new(PgReceiptRepository::new(pool.clone()));

    let registry = Arc::new(
        RedisRegistry::connect(&config.stores.redis_url, REGISTRY_SCAN_INTERVAL).await?,
    );
    {
        let registry = registry.clone();
        tokio::spawn(async move { registry.run_watch_pump(PRESENCE_PREFIX).await });
    }
    let backend: Arc<dyn RegistryBackend> = registry;
    let presence = Arc::new(PresenceRegistry::new(
        backend,
        Duration::from_secs(config.presence.ttl_secs),
    ));
    {
        let presence = presence.clone();
        tokio::spawn(async move { presence.run_watch_invalidation().await });
    }

    let sequencer = Arc::new(Sequencer::new(
        store.clone(),
        snapshots,
        config.sequencer.snapshot_every,
    ));
    let seeded = sequencer.recover_all().await?;
    info!(conversations = seeded, "Sequence counters seeded from snapshots");
    let filter = Arc::new(WordFilter::from_config(&config.filter));
    let gateway = Arc::new(HttpGatewayClient::new(Duration::from_millis(
        config.router.push_timeout_ms,
    ))?);

    let router = Arc::new(MessageRouter::new(
        sequencer,
        filter,
        presence.clone(),
        gateway,
        producer.clone(),
        store.clone(),
        config.router.clone(),
        config.offline.message_ttl_secs,
    ));
    let receipts = Arc::new(ReadReceiptTracker::new(
        receipts_repo,
        presence.clone(),
        producer.clone(),
    ));

    let writer = Arc::new(OfflineWriter::new(
        offline_consumer,
        offline_repo.clone(),
        store.clone(),
        config.offline.clone(),
    ));
    let ttl_sweeper = Arc::new(OfflineTtlSweeper::new(
        offline_repo.clone(),
        config.offline.clone(),
    ));
    {
        let writer = writer.clone();
        tokio::spawn(async move { writer.run().await });
    }
    {
        let ttl_sweeper = ttl_sweeper.clone();
        tokio::spawn(async move { ttl_sweeper.run().await });
    }

    let app = api::router(api::AppState {
        router,
        presence,
        receipts,
        offline: offline_repo,
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "im-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("im-server shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
