use std::path::Path;
use std::sync::Arc;

use agentboard::automation::AutomationEngine;
use agentboard::config::ServerConfig;
use agentboard::events::EventBus;
use agentboard::registry::{sweeper, WorkerRegistry};
use agentboard::server::{build_router, AppState, StaticTokenAuth};
use agentboard::store::{LibSqlStore, Store};
use agentboard::tasks::TaskService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ServerConfig::from_env();

    eprintln!("agentboard server v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Listen:   {}", config.listen_addr);
    eprintln!("   Database: {}", config.database_path);

    let store: Arc<dyn Store> = Arc::new(if config.database_path == ":memory:" {
        LibSqlStore::open_memory().await?
    } else {
        LibSqlStore::open(Path::new(&config.database_path)).await?
    });

    let bus = Arc::new(EventBus::new());
    let automation = Arc::new(AutomationEngine::new(Arc::clone(&store), Arc::clone(&bus)));
    let tasks = Arc::new(TaskService::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&automation),
    ));
    let registry = Arc::new(WorkerRegistry::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        config.worker_directives,
    ));

    let sweeper_handle = sweeper::spawn(
        Arc::clone(&registry),
        Arc::clone(&tasks),
        config.sweep_interval,
    );

    let state = AppState {
        store,
        bus,
        registry,
        tasks,
        automation,
        auth: Arc::new(StaticTokenAuth::from_env()),
    };

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "Server listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    sweeper_handle.abort();
    Ok(())
}
