//! PLC Gateway Service entry point

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use common::sqlite::SqliteClient;
use gateway_rtdb::{RedisRtdb, Rtdb};
use tracing::{error, info};

use plcsrv::protocol::S7Connector;
use plcsrv::{AppConfig, ConfigStore, DeviceTagService, RtdbConfigStore, SqliteStore, TagCache};

#[derive(Debug, Parser)]
#[command(name = "plcsrv", version, about = "PLC gateway service")]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "PLCSRV_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    let _log_guard = common::logging::init_logging("plcsrv", &config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialise logging: {}", e))?;

    info!("Starting plcsrv v{}", env!("CARGO_PKG_VERSION"));

    let sqlite = Arc::new(SqliteClient::new(&config.database.path).await?);
    let durable: Arc<dyn ConfigStore> = Arc::new(SqliteStore::bootstrap(sqlite).await?);
    info!("Durable store ready: {}", config.database.path);

    let rtdb: Arc<dyn Rtdb> = Arc::new(
        RedisRtdb::with_config(config.redis.clone())
            .await
            .context("Failed to connect to Redis")?,
    );
    let fast: Arc<dyn ConfigStore> = Arc::new(RtdbConfigStore::new(
        Arc::clone(&rtdb),
        config.cache.key_prefix.clone(),
    ));
    let cache = Arc::new(TagCache::new(rtdb, &config.cache));
    info!("Redis ready: {}", config.redis.url);

    let service = DeviceTagService::new(
        durable,
        fast,
        cache,
        Arc::new(S7Connector::new()),
        &config,
    );
    if let Err(e) = service.start_monitoring().await {
        error!("Failed to start monitoring: {}", e);
        service.stop_monitoring().await;
        return Err(e.into());
    }

    let health = service.check_health().await;
    info!("Startup health: {:?}", health.status);

    common::shutdown::shutdown_token().cancelled().await;
    info!("Draining devices and sync");
    service.stop_monitoring().await;
    info!("plcsrv stopped");
    Ok(())
}
