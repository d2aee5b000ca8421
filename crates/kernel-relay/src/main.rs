//! kernel-relay CLI entry point.
//!
//! Attaches to running Jupyter kernels by connection file and serves their
//! channels to browsers over WebSockets.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kernel_relay::config::{resolve_connection_file, KernelEntry, RelayConfig};
use kernel_relay::kernel_manager::KernelRegistry;
use kernel_relay::server::{self, AppState};
use kernel_relay::transport::ZmqConnector;
use log::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kernel-relay")]
#[command(about = "Share Jupyter kernel connections across browser WebSockets")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay (default if no command specified)
    Run {
        /// Config file (default: ~/.config/kernel-relay/config.toml, if present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Address to listen on, overriding the config file
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Kernel to attach, as ID=CONNECTION_FILE (repeatable)
        #[arg(long = "kernel", value_parser = parse_kernel_arg)]
        kernels: Vec<KernelEntry>,
    },

    /// Validate a config file and print the effective configuration
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn parse_kernel_arg(arg: &str) -> Result<KernelEntry, String> {
    let (id, path) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected ID=CONNECTION_FILE, got {}", arg))?;
    if id.is_empty() || path.is_empty() {
        return Err(format!("expected ID=CONNECTION_FILE, got {}", arg));
    }
    Ok(KernelEntry {
        id: id.to_string(),
        connection_file: PathBuf::from(path),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match cli.command {
        None => run(None, None, Vec::new()).await,
        Some(Commands::Run {
            config,
            bind,
            kernels,
        }) => run(config, bind, kernels).await,
        Some(Commands::CheckConfig { config }) => check_config(config),
    }
}

async fn run(
    config_path: Option<PathBuf>,
    bind: Option<SocketAddr>,
    extra_kernels: Vec<KernelEntry>,
) -> anyhow::Result<()> {
    info!("kernel-relay starting...");

    let mut config = RelayConfig::load_or_default(config_path.as_deref())?;
    if let Some(bind) = bind {
        config.bind = bind;
    }
    config.kernels.extend(extra_kernels);

    let client_config = config.client.to_client_config()?;
    let filter = config.websocket.filter()?;

    info!("Configuration:");
    info!("  Bind: {}", config.bind);
    info!("  Default protocol: {}", config.default_protocol);
    info!("  Kernels: {}", config.kernels.len());

    let registry = Arc::new(KernelRegistry::new(Arc::new(ZmqConnector::new()), client_config));

    for kernel in &config.kernels {
        let path = resolve_connection_file(&kernel.connection_file);
        match registry.attach_connection_file(&kernel.id, &path).await {
            Ok(_) => info!("Attached kernel {}", kernel.id),
            Err(e) => error!("Failed to attach kernel {}: {}", kernel.id, e),
        }
    }

    let state = AppState {
        registry: registry.clone(),
        default_protocol: config.default_protocol,
        filter,
    };
    let result = server::serve(config.bind, state).await;

    registry.shutdown_all().await;
    info!("kernel-relay stopped");
    result
}

fn check_config(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = RelayConfig::load_or_default(config_path.as_deref())?;
    let rendered = toml::to_string_pretty(&config).context("failed to render config")?;
    println!("{}", rendered);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_arg() {
        let entry = parse_kernel_arg("py=kernel-1.json").unwrap();
        assert_eq!(entry.id, "py");
        assert_eq!(entry.connection_file, PathBuf::from("kernel-1.json"));

        assert!(parse_kernel_arg("missing-separator").is_err());
        assert!(parse_kernel_arg("=file.json").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "kernel-relay",
            "--log-level",
            "debug",
            "run",
            "--bind",
            "127.0.0.1:9000",
            "--kernel",
            "a=a.json",
            "--kernel",
            "b=/tmp/b.json",
        ])
        .unwrap();
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Some(Commands::Run { bind, kernels, .. }) => {
                assert_eq!(bind.map(|b| b.port()), Some(9000));
                assert_eq!(kernels.len(), 2);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
