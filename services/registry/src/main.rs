//! Relay Mesh registry - main entry point

use anyhow::Result;
use clap::{Arg, Command};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use service_registry::{RegistryConfig, start_server};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "service_registry=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let matches = Command::new("service-registry")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Relay Mesh service registry")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("registry.toml"),
        )
        .get_matches();

    let default_config = "registry.toml".to_string();
    let config_path = matches
        .get_one::<String>("config")
        .unwrap_or(&default_config);
    let config = match RegistryConfig::from_file(config_path) {
        Ok(config) => {
            info!("Loaded configuration from: {}", config_path);
            config
        }
        Err(e) => {
            error!("Failed to load config from {}: {}", config_path, e);
            info!("Using default configuration");
            RegistryConfig::default()
        }
    };

    info!(
        "Starting registry v{} on {}",
        env!("CARGO_PKG_VERSION"),
        config.server_address()
    );
    info!(
        "Heartbeat miss {}s, evict {}s, probe every {}s",
        config.health.miss_seconds, config.health.evict_seconds, config.health.probe_seconds
    );

    if let Err(e) = start_server(config).await {
        error!("Registry error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
