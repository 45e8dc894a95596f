//! PerunKV follower: serves reads and replays the leader's log.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use perunkv_core::NodeConfig;
use perunkv_server::{build_follower_router, AppState, NodeRole};

/// PerunKV follower - read replica of a PerunKV leader
#[derive(Parser, Debug)]
#[command(name = "perunkv-follower")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data directory for WAL segments
    #[arg(short, long, default_value = "./data/follower-1", env = "PERUNKV_DATA_DIR")]
    data_dir: PathBuf,

    /// Host address to bind to
    #[arg(long, default_value = "0.0.0.0", env = "PERUNKV_HOST")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "8001", env = "PERUNKV_PORT")]
    port: u16,

    /// Identity this follower registers under
    #[arg(long, default_value = "follower-1", env = "PERUNKV_FOLLOWER_ID")]
    follower_id: String,

    /// Leader base URL (falls back to the config file)
    #[arg(long, env = "PERUNKV_LEADER_URL")]
    leader_url: Option<String>,

    /// Externally reachable URL of this follower (falls back to the config
    /// file)
    #[arg(long, env = "PERUNKV_FOLLOWER_URL")]
    follower_url: Option<String>,
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
    tracing::info!("Starting PerunKV follower {}...", args.follower_id);

    let mut config = NodeConfig::load()?;
    config.wal_path = args.data_dir.join("wal.log");
    let leader_url = args
        .leader_url
        .or_else(|| config.leader_url.clone())
        .unwrap_or_else(|| "http://localhost:8000".to_string());
    let follower_url = args
        .follower_url
        .or_else(|| config.follower_url.clone())
        .unwrap_or_else(|| format!("http://localhost:{}", args.port));
    config.leader_url = Some(leader_url.clone());
    config.follower_id = Some(args.follower_id.clone());
    config.follower_url = Some(follower_url.clone());
    tracing::info!("WAL path: {}", config.wal_path.display());
    tracing::info!("Leader: {leader_url}");

    let heartbeat_interval = config.heartbeat_interval();
    let state = AppState::build(NodeRole::Follower, args.follower_id.clone(), config)?;

    // The leader is our only heartbeat peer; send/monitor both ways.
    state.heartbeat.register_peer("leader", &leader_url);
    state.heartbeat.start_monitoring();
    state.heartbeat.start_sending();
    state.compaction.start();

    // Register with the leader and pull whatever this log is missing. A
    // failure is not fatal: keep retrying in the background so the follower
    // still serves whatever it already has.
    {
        let state = Arc::clone(&state);
        let follower_id = args.follower_id.clone();
        tokio::spawn(async move {
            loop {
                let synced = state
                    .replication
                    .sync_with_leader(&state.storage, &leader_url, &follower_id, &follower_url)
                    .await;
                match synced {
                    Ok(last_applied_id) => {
                        tracing::info!(
                            "registered with leader, last_applied_id={last_applied_id}"
                        );
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "failed to register with leader at {leader_url}: {e}; retrying"
                        );
                        tokio::time::sleep(heartbeat_interval).await;
                    }
                }
            }
        });
    }

    let app = build_follower_router(Arc::clone(&state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("PerunKV follower listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
