use std::{net::SocketAddr, sync::Arc};

use clap::Parser;
use pricebot::{
    api::{router, AppState},
    providers::{agent_builder::AgentBuilder, AgentPlatform},
    leaderboard::{HttpLeaderboard, LeaderboardStore},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "pricebot-server", about = "Relay for the grocery price game")]
struct Args {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "PORT", default_value_t = 3002)]
    port: u16,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,pricebot=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let platform: Option<Arc<dyn AgentPlatform>> = match AgentBuilder::from_env() {
        Ok(platform) => Some(Arc::new(platform)),
        Err(err) => {
            tracing::warn!(error = %err, "agent platform disabled");
            None
        }
    };

    let leaderboard: Option<Arc<dyn LeaderboardStore>> = match HttpLeaderboard::from_env() {
        Ok(store) => Some(Arc::new(store)),
        Err(err) => {
            tracing::warn!(error = %err, "leaderboard disabled");
            None
        }
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(Arc::new(AppState::new(platform, leaderboard)))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app).await
}
