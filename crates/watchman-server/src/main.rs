use anyhow::Result;
use tracing::{error, info};
use watchman_channel::{ChannelManager, FsCredentialStore, WsGatewayTransport};

mod auth;
mod config;
mod db;
mod dispatch;
mod server;
mod telemetry;

pub use config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize telemetry
    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        telemetry::init().map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;
    } else {
        telemetry::init_local()
            .map_err(|e| anyhow::anyhow!("Failed to init local telemetry: {}", e))?;
    }

    info!("Watchman Server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let server_config = ServerConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load server configuration: {}", e))?;
    server_config.log_config();

    // Initialize database
    let pool = db::connect(server_config.db_path.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize database: {}", e))?;
    db::run_migrations(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;
    info!("Database initialized and migrations complete");

    // Start the messaging channel session
    let transport = WsGatewayTransport::new(server_config.gateway_url.clone());
    let store = FsCredentialStore::new(&server_config.credentials_dir);
    let (channel, session) = ChannelManager::spawn(transport, store);

    // Run the HTTP server and the channel session side by side. The session
    // task only exits on an unrecoverable fault, which must take the whole
    // process down rather than leave a server that silently drops messages.
    tokio::select! {
        result = server::start(pool, channel, server_config) => {
            result?;
        }
        result = session => {
            match result {
                Ok(Ok(())) => info!("Channel session stopped"),
                Ok(Err(e)) => {
                    error!(error = %e, "Channel session failed");
                    telemetry::shutdown();
                    return Err(anyhow::anyhow!("channel session failed: {}", e));
                }
                Err(e) => {
                    error!(error = %e, "Channel session task panicked");
                    telemetry::shutdown();
                    return Err(anyhow::anyhow!("channel session task panicked: {}", e));
                }
            }
        }
    }

    telemetry::shutdown();

    Ok(())
}
