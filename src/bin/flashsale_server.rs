//! Flash-sale service entry point
//!
//! Wires the admission gate, inventory engine, order materializer,
//! lifecycle manager, sweeper and reconciler onto shared Redis /
//! Kafka / PostgreSQL connections and serves the HTTP surface.
//! Exit code 0 on graceful shutdown, non-zero on startup failure.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use magpie::bus::{BusConsumer, BusProducer, KafkaConsumer, KafkaProducer, topics};
use magpie::config::FlashSaleConfig;
use magpie::db::Database;
use magpie::flashsale::repository::{
    ActivityRepository, OrderRepository, PgActivityRepository, PgOrderRepository,
    PgReconciliationRepository, PgStockLogRepository, ReconciliationRepository,
    StockLogRepository,
};
use magpie::flashsale::{
    AdmissionGate, InventoryEngine, LifecycleManager, OrderMaterializer, Reconciler,
    TimeoutSweeper, api,
};
use magpie::logging::init_logging;
use magpie::store::{FastStore, RedisStore};

fn config_path() -> String {
    let args: Vec<String> = std::env::args().collect();
    args.iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .unwrap_or_else(|| "config/flashsale.yaml".to_string())
}

#[tokio::main]
async fn main() {
    let path = config_path();
    let config = match FlashSaleConfig::from_file(&path) {
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
        "flashsale-server starting"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "flashsale-server failed");
        std::process::exit(1);
    }
}

async fn run(config: FlashSaleConfig) -> anyhow::Result<()> {
    // Durable store first; a broken schema must stop the process here
    let db = Database::bootstrap(&config.stores.database_url).await?;
    let pool = db.pool().clone();

    let store: Arc<dyn FastStore> = Arc::new(RedisStore::connect(&config.stores.redis_url).await?);
    let producer: Arc<dyn BusProducer> =
        Arc::new(KafkaProducer::new(&config.stores.kafka_brokers)?);
    let order_consumer: Arc<dyn BusConsumer> = Arc::new(KafkaConsumer::new(
        &config.stores.kafka_brokers,
        &format!("{}-materializer", config.stores.kafka_group_id),
        topics::ORDER_EVENTS,
    )?);

    let orders: Arc<dyn OrderRepository> = Arc::new(PgOrderRepository::new(pool.clone()));
    let stock_logs: Arc<dyn StockLogRepository> =
        Arc::new(PgStockLogRepository::new(pool.clone()));
    let activities: Arc<dyn ActivityRepository> =
        Arc::new(PgActivityRepository::new(pool.clone()));
    let recon_logs: Arc<dyn ReconciliationRepository> =
        Arc::new(PgReconciliationRepository::new(pool.clone()));

    let inventory = Arc::new(InventoryEngine::new(
        store.clone(),
        orders.clone(),
        stock_logs.clone(),
        producer.clone(),
        config.orders.order_status_ttl_secs,
    ));
    let admission = Arc::new(AdmissionGate::new(store.clone(), config.admission.clone()));
    let lifecycle = Arc::new(LifecycleManager::new(
        activities.clone(),
        inventory.clone(),
        admission.clone(),
        store.clone(),
        config.lifecycle.clone(),
        config.admission.clone(),
    ));

    let materializer = Arc::new(OrderMaterializer::new(
        order_consumer,
        orders.clone(),
        store.clone(),
        config.orders.clone(),
    ));
    let sweeper = Arc::new(TimeoutSweeper::new(
        orders.clone(),
        inventory.clone(),
        store.clone(),
        config.orders.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        orders.clone(),
        activities.clone(),
        recon_logs,
        inventory.clone(),
        config.reconciler.clone(),
        config.lifecycle.retention_secs,
    ));

    {
        let materializer = materializer.clone();
        tokio::spawn(async move { materializer.run().await });
    }
    {
        let sweeper = sweeper.clone();
        tokio::spawn(async move { sweeper.run().await });
    }
    {
        let reconciler = reconciler.clone();
        tokio::spawn(async move { reconciler.run().await });
    }
    {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move { lifecycle.run().await });
    }

    let app = api::router(api::AppState {
        admission,
        inventory,
        lifecycle,
        orders,
        activities,
        store,
        order_status_ttl_secs: config.orders.order_status_ttl_secs,
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "flashsale-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("flashsale-server shut down cleanly");
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
