//! Standalone gateway binary

use mcpstream_gateway::{init_tracing, GatewayConfig, GatewayServer};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let config = GatewayConfig::from_env();
    let _guard = init_tracing(&config.log);

    info!(version = env!("CARGO_PKG_VERSION"), "[Gateway] mcpstream gateway");
    GatewayServer::new(config).run().await
}
