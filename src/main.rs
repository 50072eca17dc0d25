use tracing::info;
use tracing_subscriber::EnvFilter;

use railway_conflict_engine::config::EngineConfig;
use railway_conflict_engine::synthetic::{seed_if_empty, SyntheticConfig};
use railway_conflict_engine::{build_router, Engine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::var("CONFIG_PATH") {
        Ok(path) => EngineConfig::from_file(path)?,
        Err(_) => EngineConfig::from_env()?,
    };
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    info!("🚆 starting railway conflict engine");

    let engine = Engine::start(config.clone()).await?;
    let state = engine.state();
    info!("✅ domain store ready at {}", config.store.path);

    if std::env::var("SEED_DEMO_NETWORK").is_ok_and(|v| v == "1" || v == "true") {
        if seed_if_empty(&state.store, &SyntheticConfig::default()).await? {
            info!("🧪 demo network seeded");
        }
    }

    let bind_address = config.server_bind_address();
    let app = build_router(state);
    info!("🚀 listening on {}", bind_address);
    info!("📊 metrics at http://{}/metrics", bind_address);
    info!("🔌 event stream at ws://{}/ws", bind_address);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    engine.shutdown().await;
    Ok(())
}
