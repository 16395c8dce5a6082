// src/main.rs

//! The entry point of the chunkstore daemon.

use anyhow::Result;
use chunkstore::config::Config;
use chunkstore::server;
use std::env;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("chunkstore version {VERSION}");
        return Ok(());
    }

    // Defaults to "config.toml" when --config is absent.
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");

    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level.
    let initial_log_level =
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(true),
        )
        .init();

    if let Err(e) = server::run(config, config_path.to_string(), Arc::new(reload_handle)).await {
        error!("Server runtime error: {}", e);
        return Err(e);
    }
    Ok(())
}
