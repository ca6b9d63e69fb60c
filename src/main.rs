use std::{env, net::SocketAddr};

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,assistant_gateway=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state = assistant_gateway::build_state()?;
    let app = assistant_gateway::build_app(state);

    let port = env::var("PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(5001);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "assistant gateway listening");

    axum::serve(listener, app).await?;
    Ok(())
}
