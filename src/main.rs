//! `relayframe` binary: runs a load balancer or a proxy from a TOML file.

mod cli;

use std::{process::ExitCode, sync::Arc};

use clap::Parser;
use cli::{Cli, Command, LogLevel};
use relayframe::{
    config::Config,
    discovery::{Discovery, MemoryDiscovery, Topology},
    server::{self, ServerError},
};
use tracing::Level;

fn max_level(level: LogLevel) -> Level {
    match level {
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(max_level(cli.log_level))
        .init();

    let config = match load(&cli.command) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    install_metrics(&config);

    match run(&cli.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "relayframe failed");
            ExitCode::FAILURE
        }
    }
}

fn load(command: &Command) -> Result<Config, relayframe::config::ConfigError> {
    let config = Config::load(command.config())?;
    match command {
        Command::Lb { .. } => config.check_lb()?,
        Command::Proxy { .. } => config.check_proxy()?,
    }
    Ok(config)
}

async fn run(command: &Command, config: &Config) -> Result<(), ServerError> {
    let discovery = registry(config)?;
    match command {
        Command::Lb { .. } => {
            server::lb::run(discovery, config.lb_options(), server::shutdown_signal()).await
        }
        Command::Proxy { .. } => {
            server::proxy::run(discovery, config.proxy_options(), server::shutdown_signal()).await
        }
    }
}

/// The in-memory registry, seeded with the configured static endpoints.
fn registry(config: &Config) -> Result<Arc<dyn Discovery>, ServerError> {
    if !config.stand_alone {
        tracing::warn!(
            zk = %config.zk,
            "no coordination service client built in, serving from the static endpoint table"
        );
    }
    let discovery = MemoryDiscovery::new(Topology::new(config.product.clone()));
    discovery.seed(&config.endpoints)?;
    Ok(Arc::new(discovery))
}

#[cfg(feature = "metrics")]
fn install_metrics(config: &Config) {
    if let Some(addr) = config.metrics_address
        && let Err(e) = relayframe::metrics::install_exporter(addr)
    {
        tracing::warn!(%addr, error = %e, "metrics exporter not installed");
    }
}

#[cfg(not(feature = "metrics"))]
fn install_metrics(config: &Config) {
    if config.metrics_address.is_some() {
        tracing::warn!("metrics_address ignored, built without the metrics feature");
    }
}
