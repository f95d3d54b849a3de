//! Map Tile Server - renders and serves slippy-map tiles.
//!
//! This binary wires configuration, caches, the renderer and the HTTP
//! server together, then waits for SIGINT/SIGTERM and shuts down in order.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use map_tile_server::{
    config::Config,
    error::{ShutdownError, StartupError},
    render::{CoverageEngine, MapFile},
    server::{create_router, AssetResolver, ConnectionRegistry, RouterConfig, ThemeAssets},
    shutdown::{ShutdownHooks, WorkerPool},
    store::PersistentTileStore,
    tile::{TileCacheBuilder, TileService},
};

fn main() -> ExitCode {
    let config = Config::parse();
    init_logging(config.verbose);

    match run(config) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(failures) => {
            warn!(failures, "Shutdown finished with failures");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Start the server, serve until a termination signal, then shut down.
///
/// Returns the number of shutdown actions that failed.
fn run(config: Config) -> Result<usize, StartupError> {
    config.validate()?;

    let maps = config
        .map_paths()?
        .into_iter()
        .map(MapFile::open)
        .collect::<Result<Vec<_>, _>>()?;

    info!("Configuration:");
    for map in &maps {
        info!(
            "  Map: {} ({} bytes, created {})",
            map.path.display(),
            map.header.file_size,
            map.header.created_ms
        );
    }

    let workers = config.worker_count();
    let pool = Arc::new(WorkerPool::new(workers)?);
    info!("  Workers: {}", workers);

    let store = match config.store_config() {
        Some(store_config) => {
            let store = PersistentTileStore::open(store_config)?;
            info!(
                "  Disk cache: {} ({} tiles, {} bytes)",
                store.root().display(),
                store.len(),
                store.total_bytes()
            );
            Some(Arc::new(store))
        }
        None => {
            info!("  Disk cache: disabled");
            None
        }
    };

    info!("  Memory limit: {} bytes", config.memory_limit());
    let budget = config.memory_cache_budget()?;
    let mut builder = TileCacheBuilder::new(budget).concurrency_level(workers);
    if let Some(store) = &store {
        builder = store.configure_sizing(builder);
    }
    if builder.max_weight() == 0 {
        return Err(StartupError::InsufficientMemory {
            limit: budget,
            reserve: budget - builder.max_weight(),
        });
    }
    info!("  Memory cache: {} bytes", builder.max_weight());

    let engine = Arc::new(CoverageEngine::new(maps));
    let service = Arc::new(TileService::new(engine, builder.build(), store));

    let assets: Arc<dyn AssetResolver> = Arc::new(ThemeAssets::new(&config.theme));
    let router = create_router(
        service.clone(),
        assets,
        RouterConfig::new().with_tracing(!config.no_tracing),
    );

    let addr = config.bind_address();
    let listener = pool.block_on(TcpListener::bind(&addr))?;

    let registry = ConnectionRegistry::with_grace(config.shutdown_grace());
    let server = axum::serve(registry.listener(listener), router).with_graceful_shutdown(registry.shutdown_signal());
    registry.register_server(pool.handle().spawn(async move { server.await }));

    info!("");
    info!("  Server listening on: http://{}", addr);
    info!("    curl http://{}/health", addr);
    info!("    curl http://{}/0/0/0.png", addr);
    info!("");

    pool.block_on(wait_for_signal());

    let mut hooks = build_shutdown_hooks(registry, pool, service);
    Ok(hooks.run().len())
}

/// The termination sequence, in execution order.
fn build_shutdown_hooks(
    registry: ConnectionRegistry,
    pool: Arc<WorkerPool>,
    service: Arc<TileService<CoverageEngine>>,
) -> ShutdownHooks {
    let mut hooks = ShutdownHooks::new();

    let handle = pool.handle().clone();
    hooks.add("close connections", move || {
        handle.block_on(registry.close_and_wait());
        Ok(())
    });

    let initiating = pool.clone();
    hooks.add("initiate worker shutdown", move || initiating.initiate_shutdown());

    hooks.add("flush tile store", move || {
        service.flush_and_dispose().map_err(|e| ShutdownError::Failed {
            action: "flush tile store",
            message: e.to_string(),
        })
    });

    hooks.add_last("await worker shutdown", move || pool.await_shutdown());
    hooks
}

/// Wait for SIGINT, or SIGTERM on unix.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "map_tile_server=debug,tower_http=debug"
    } else {
        "map_tile_server=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
