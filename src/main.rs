//! Thin external wrapper: reads a config file path from argv, loads and
//! parses it, initializes logging, and hands off to the core (spec §1
//! "configuration file loading... treated as a typed configuration record
//! supplied to the core").

use oi7500_gateway::config::GatewayConfig;
use oi7500_gateway::error::ConfigError;
use tracing_subscriber::EnvFilter;

fn load_config(path: &str) -> Result<GatewayConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_string(),
        source,
    })
}

fn init_logging(console: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if console {
        subscriber.init();
    } else {
        subscriber.with_writer(std::io::stderr).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "gateway.json".to_string());
    let config = load_config(&path)?;
    init_logging(config.logging.console);

    tracing::info!(path, "loaded configuration");
    oi7500_gateway::run(config).await
}
