use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use voicerelay::config::{watch_config_async, Config};
use voicerelay::server::shutdown_signal;
use voicerelay::{metrics, RelayService, SessionDirectory, StaticDirectory};

#[derive(Parser, Debug)]
#[command(name = "voicerelay")]
#[command(about = "Multiplexes one public UDP port across many backend voice servers")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "voicerelay.yaml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = if args.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Loading configuration from {:?}", args.config);

    let config = Config::load(&args.config)?;

    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    if let Some(ref metrics_config) = config.metrics {
        info!("Starting Prometheus metrics server on {}", metrics_config.address);
        if let Err(e) = metrics::start_metrics_server(&metrics_config.address) {
            warn!("Failed to start metrics server: {}. Continuing without metrics.", e);
        }
    }

    let directory = Arc::new(StaticDirectory::from_config(&config));
    let mut service = RelayService::new(
        config.relay.bind_address()?,
        Arc::clone(&directory) as Arc<dyn SessionDirectory>,
    );
    if let Some(max_bridges) = config.relay.max_bridges {
        service = service.with_max_bridges(max_bridges);
    }
    let service = Arc::new(service);

    service.start().await?;

    // Sessions that moved or left in the new config lose their bridge
    let reload_service = Arc::clone(&service);
    let watcher = watch_config_async(args.config.clone(), move |new_config| {
        for event in directory.reload(new_config.session_table()) {
            reload_service.handle_event(event);
        }
    });

    let failed = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping voice relay");
            false
        }
        _ = service.stopped() => true,
    };

    watcher.abort();
    service.shutdown().await;

    if failed {
        anyhow::bail!("Voice relay stopped after a fatal error");
    }

    Ok(())
}
