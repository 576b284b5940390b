use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use agentbridge::cli::{run_client, ClientOptions};
use agentbridge::config;
use agentbridge::connector::run_connector;
use agentbridge::gateway::GatewayError;
use agentbridge::logging::{init_logging, LogConfig, LogFormat};
use agentbridge::relay::{run_relay, RelayConfig};

#[derive(Parser)]
#[command(name = "agentbridge", version, about = "Relay-based bridge to a NAT-bound agent gateway")]
struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server.
    Relay {
        /// Listen address.
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: SocketAddr,
    },
    /// Run the connector.
    Connector {
        /// Path to the connector config file.
        #[arg(long)]
        config: PathBuf,
        /// Echo user messages back instead of talking to a gateway.
        #[arg(long)]
        echo: bool,
    },
    /// Interactive client session.
    Client {
        /// Relay client WebSocket URL.
        #[arg(long, default_value = "ws://127.0.0.1:8080/client")]
        relay_url: String,
        /// Access code shared with the connector.
        #[arg(long)]
        access_code: String,
        /// Max wait per prompt before timing out, in seconds.
        #[arg(long, default_value_t = 45)]
        response_timeout_seconds: u64,
        /// Auto reconnect when the relay connection is lost.
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        reconnect: bool,
        /// Delay between reconnect attempts, in seconds.
        #[arg(long, default_value_t = 2)]
        reconnect_delay_seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Plaintext
    };
    init_logging(LogConfig {
        format,
        ..LogConfig::default()
    })?;

    match cli.command {
        Command::Relay { addr } => {
            let handle = run_relay(RelayConfig {
                bind_address: addr,
                ..RelayConfig::default()
            })
            .await?;
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            handle.shutdown().await;
            Ok(())
        }

        Command::Connector { config, echo } => {
            let cfg = config::load(&config)?;

            let shutdown = CancellationToken::new();
            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    signal_token.cancel();
                }
            });

            match run_connector(cfg, echo, shutdown).await {
                Ok(()) => Ok(()),
                Err(err @ GatewayError::AuthFailed(_)) => {
                    // Distinct exit so operators notice the non-retryable case.
                    error!(error = %err, "gateway auth failed");
                    std::process::exit(2);
                }
                Err(err) => Err(err.into()),
            }
        }

        Command::Client {
            relay_url,
            access_code,
            response_timeout_seconds,
            reconnect,
            reconnect_delay_seconds,
        } => {
            run_client(ClientOptions {
                relay_url,
                access_code,
                response_timeout: Duration::from_secs(response_timeout_seconds.max(1)),
                reconnect,
                reconnect_delay: Duration::from_secs(reconnect_delay_seconds.max(1)),
            })
            .await
        }
    }
}
