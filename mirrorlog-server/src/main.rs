use anyhow::Result;
use mirrorlog_server::{HaService, MemoryCommitLog, ServerConfig};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    info!("Starting mirrorlog server v{}", env!("CARGO_PKG_VERSION"));

    let log = Arc::new(MemoryCommitLog::new());
    let service = HaService::new(config.ha, log);
    service.start()?;

    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received");
    service.shutdown();

    Ok(())
}
