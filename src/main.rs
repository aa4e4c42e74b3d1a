//! scale-plane - Resilience and scaling control plane
//!
//! This is the composition root that wires together all the components.

use scale_plane::adapters::inbound::ApiServer;
use scale_plane::adapters::outbound::{MemoryStore, RedisStore};
use scale_plane::config::{load_config, AppConfig, StoreBackend};
use scale_plane::domain::ports::EphemeralStore;
use scale_plane::infrastructure::connection_pool::{DatabasePool, PoolConfig};
use scale_plane::infrastructure::shutdown::shutdown_signal;
use scale_plane::ControlPlane;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;

fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Worker threads come from the scaling profile
    let runtime = cfg.scaling.build_runtime()?;
    runtime.block_on(run(cfg))
}

async fn run(cfg: AppConfig) -> anyhow::Result<()> {
    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!(
        "starting scale-plane {} mode={} workers={} env={} listen={}",
        cfg.version,
        cfg.scaling.mode,
        cfg.scaling.max_workers,
        cfg.environment,
        cfg.listen_addr
    );

    // ===== COMPOSITION ROOT =====

    // 1. Shared ephemeral store
    let store: Arc<dyn EphemeralStore> = match cfg.store_backend {
        StoreBackend::Redis => {
            tracing::info!(
                "using redis store at {} (max {} connections)",
                cfg.redis_url,
                cfg.scaling.store_connection_limit
            );
            Arc::new(RedisStore::open(
                &cfg.redis_url,
                cfg.scaling.store_connection_limit,
            )?)
        }
        StoreBackend::Memory => {
            tracing::info!("using in-process store");
            let memory = MemoryStore::new();
            memory.start_gc(Duration::from_secs(60));
            Arc::new(memory)
        }
    };

    // 2. Database pool, sized by the scaling profile
    let database = Arc::new(DatabasePool::new(PoolConfig::new(
        cfg.database_path.clone(),
        cfg.scaling.connection_pool_size,
    )));

    // 3. Control plane and its background tasks
    let plane = Arc::new(ControlPlane::new(&cfg, store, database));
    let background = plane.start_background_tasks();

    // 4. Inbound adapter, until a shutdown signal arrives
    let controller = plane.shutdown_controller().clone();
    let mut shutdown_rx = controller.subscribe();
    let server = ApiServer::new(cfg.listen_addr, plane.clone());
    let mut server_task = tokio::spawn(async move { server.run(shutdown_signal(controller)).await });

    tokio::select! {
        result = &mut server_task => {
            // Server stopped on its own (bind failure or early exit)
            result??;
        }
        _ = shutdown_rx.recv() => {}
    }

    // 5. Drain in-flight work (bounded), then release resources
    plane.shutdown().await;
    server_task.abort();
    for task in background {
        task.abort();
    }

    Ok(())
}
