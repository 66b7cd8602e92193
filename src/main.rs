mod bridge;

use bridge::Bridge;
use bridge_core::config::Config;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "bridge", about = "Universal REST-to-gRPC gateway")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway.
    Run {
        /// Path to configuration file (TOML or JSON)
        #[arg(short, long, env = "BRIDGE_CONFIG", default_value = "/etc/bridge/bridge.toml")]
        config: PathBuf,
        /// Override the listen host
        #[arg(long)]
        host: Option<String>,
        /// Override the listen port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Probe a running bridge's health endpoint.
    Health {
        /// Base URL, e.g. http://127.0.0.1:8080
        #[arg(long)]
        addr: String,
    },
    /// Configuration utilities.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Validate a configuration file.
    Validate { file: PathBuf },
    /// Print a default configuration.
    Generate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, host, port } => run(config, host, port).await,
        Command::Health { addr } => health(addr).await,
        Command::Config { command } => match command {
            ConfigCommand::Validate { file } => validate(file),
            ConfigCommand::Generate => {
                print!("{}", Config::generate_default());
                ExitCode::SUCCESS
            }
        },
    }
}

async fn run(config_path: PathBuf, host: Option<String>, port: Option<u16>) -> ExitCode {
    let mut config = match Config::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::from(2);
        }
    };
    if let Some(host) = host {
        config.frontend.host = host;
    }
    if let Some(port) = port {
        config.frontend.port = port;
    }

    init_logging(&config);
    info!(config = %config_path.display(), "starting bridge");

    let running = match Bridge::new(config).start().await {
        Ok(running) => running,
        Err(e) => {
            error!("startup failed: {e:#}");
            return if bridge::is_config_error(&e) {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            };
        }
    };

    if tokio::signal::ctrl_c().await.is_err() {
        error!("failed to listen for shutdown signal");
        running.shutdown().await;
        return ExitCode::from(1);
    }
    info!("interrupt received, shutting down");
    running.shutdown().await;
    ExitCode::from(130)
}

async fn health(addr: String) -> ExitCode {
    let url = format!("{}/health", addr.trim_end_matches('/'));
    let client = match reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            eprintln!("health check failed: {e}");
            return ExitCode::from(1);
        }
    };

    match client.get(&url).send().await {
        Ok(response) => {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let status = body
                .get("status")
                .and_then(|s| s.as_str())
                .unwrap_or("unknown");
            println!("{status}");
            if matches!(status, "healthy" | "degraded") {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(e) => {
            eprintln!("health check failed: {e}");
            ExitCode::from(1)
        }
    }
}

fn validate(file: PathBuf) -> ExitCode {
    match Config::from_file(&file) {
        Ok(config) => {
            println!(
                "OK: {} cluster(s), registry backend {:?}",
                config.clusters.len(),
                config.mcp.registry_backend
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            ExitCode::from(2)
        }
    }
}

fn init_logging(config: &Config) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .init();
        }
    }
}
