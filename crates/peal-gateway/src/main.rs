use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use peal_core::{store, CallService};
use peal_gateway::{auth, build_router, spawn_ring_timeout_sweeper, ws, AppState};

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}

fn check_public_bind_allowed(addr: SocketAddr) -> anyhow::Result<()> {
    if addr.ip().is_loopback() {
        return Ok(());
    }
    if env_bool("PEAL_ALLOW_PUBLIC_BIND", false) {
        return Ok(());
    }
    Err(anyhow::anyhow!(
        "refusing non-loopback bind without PEAL_ALLOW_PUBLIC_BIND=1"
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "peal_gateway=info,peal_core=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenv::dotenv().ok();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:peal.db?mode=rwc".to_string());

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("failed to connect to database");
    tracing::info!("connected to signaling database");

    store::init_schema(&pool).await.expect("failed to create call schema");
    auth::init_schema(&pool).await.expect("failed to create session schema");

    let ring_timeout = env_secs("PEAL_RING_TIMEOUT_SECS", 30);
    let sweep_interval = env_secs("PEAL_SWEEP_INTERVAL_SECS", 5);

    let service = Arc::new(CallService::with_ring_timeout(pool.clone(), ring_timeout));
    let connections: ws::ConnectionMap = Arc::new(RwLock::new(HashMap::new()));

    spawn_ring_timeout_sweeper(service.clone(), sweep_interval);
    tokio::spawn(ws::run_feed_dispatcher(
        service.clone(),
        connections.clone(),
    ));

    let app_state = AppState {
        pool,
        service,
        connections,
    };
    let app = build_router(app_state);

    let bind_addr =
        std::env::var("PEAL_GATEWAY_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3400".to_string());
    let addr: SocketAddr = bind_addr.parse()?;
    check_public_bind_allowed(addr)?;

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("gateway listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
