use clap::Parser;
use driftmq::{BrokerConfig, BrokerServer, Persistence, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "driftmq")]
#[command(about = "Topic-based publish/subscribe broker with offset resume")]
struct Args {
    /// Config file (TOML, YAML or JSON); DRIFTMQ_* environment variables apply on top
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to accept client connections on
    #[arg(long)]
    listen: Option<String>,

    /// Where topic logs are kept: memory or file
    #[arg(long)]
    persistence: Option<Persistence>,

    /// Root directory for file-backed topics
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Segment roll size in bytes
    #[arg(long)]
    segment_size: Option<u64>,

    /// Interval between background flushes of file-backed topics
    #[arg(long)]
    flush_interval_ms: Option<u64>,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// CLI flags override file and environment settings
    fn apply(self, mut config: BrokerConfig) -> BrokerConfig {
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(persistence) = self.persistence {
            config.persistence = persistence;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(segment_size) = self.segment_size {
            config.segment_size = segment_size;
        }
        if let Some(flush_interval_ms) = self.flush_interval_ms {
            config.flush_interval_ms = flush_interval_ms;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(&args.log_level))
        .init();

    let config = BrokerConfig::load(args.config.as_ref())?;
    let config = args.apply(config);
    config.validate().map_err(driftmq::DriftError::Config)?;

    info!("Starting DriftMQ broker on {}", config.listen_addr);
    info!("Persistence: {:?}", config.persistence);
    if config.persistence == Persistence::File {
        info!("Data directory: {}", config.data_dir.display());
        info!("Flush interval: {}ms", config.flush_interval_ms);
    }
    info!("Segment size: {} bytes", config.segment_size);

    let server = Arc::new(BrokerServer::new(config)?);

    // Spawn the server task
    let running = Arc::clone(&server);
    let mut server_handle = tokio::spawn(async move { running.run().await });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            server.shutdown();
            match (&mut server_handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server error during shutdown: {}", e),
                Err(e) => error!("Server task failed: {}", e),
            }
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Server task completed"),
                Ok(Err(e)) => {
                    error!("Server error: {}", e);
                    return Err(e);
                }
                Err(e) => error!("Server task failed: {}", e),
            }
        }
    }

    info!("{}", server.metrics().snapshot().to_json().unwrap_or_default());
    info!("DriftMQ shut down successfully");
    Ok(())
}

fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            warn!("Invalid log level '{}', defaulting to 'info'", level);
            tracing::Level::INFO
        }
    }
}
