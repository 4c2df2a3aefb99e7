//! Relay Mesh proxy - main entry point

use anyhow::Result;
use clap::{Arg, Command};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mesh_proxy::{ProxyConfig, start_server};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mesh_proxy=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let matches = Command::new("mesh-proxy")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Relay Mesh dynamic reverse proxy")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("proxy.toml"),
        )
        .get_matches();

    let default_config = "proxy.toml".to_string();
    let config_path = matches
        .get_one::<String>("config")
        .unwrap_or(&default_config);
    let config = match ProxyConfig::from_file(config_path) {
        Ok(config) => {
            info!("Loaded configuration from: {}", config_path);
            config
        }
        Err(e) => {
            error!("Failed to load config from {}: {}", config_path, e);
            info!("Using default configuration");
            ProxyConfig::default()
        }
    };

    info!(
        "Starting proxy v{} on {}",
        env!("CARGO_PKG_VERSION"),
        config.server_address()
    );
    info!("Registry: {}", config.registry_url);
    info!("Prefixes: {}", config.prefixes.join(", "));
    info!("Balancer: {:?}", config.balancer);

    if let Err(e) = start_server(config).await {
        error!("Proxy error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
