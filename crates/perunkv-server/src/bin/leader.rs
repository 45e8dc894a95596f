//! PerunKV leader: accepts writes, ships the log to followers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use perunkv_core::NodeConfig;
use perunkv_server::{build_leader_router, AppState, NodeRole};

/// PerunKV leader - write endpoint of a replicated key-value store
#[derive(Parser, Debug)]
#[command(name = "perunkv-leader")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data directory for WAL segments
    #[arg(short, long, default_value = "./data/leader", env = "PERUNKV_DATA_DIR")]
    data_dir: PathBuf,

    /// Host address to bind to
    #[arg(long, default_value = "0.0.0.0", env = "PERUNKV_HOST")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "8000", env = "PERUNKV_PORT")]
    port: u16,

    /// Identity used in heartbeats and status payloads
    #[arg(long, default_value = "leader", env = "PERUNKV_SERVER_ID")]
    server_id: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    tracing::info!("Starting PerunKV leader...");

    let mut config = NodeConfig::load()?;
    config.wal_path = args.data_dir.join("wal.log");
    tracing::info!("WAL path: {}", config.wal_path.display());

    let state = AppState::build(NodeRole::Leader, args.server_id, config)?;

    // Background duties: peer liveness both ways, periodic compaction.
    state.heartbeat.start_monitoring();
    state.heartbeat.start_sending();
    state.compaction.start();

    let app = build_leader_router(Arc::clone(&state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("PerunKV leader listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
