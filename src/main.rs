use std::time::Duration;

use clap::{Parser, ValueEnum};
use plate_server::config::{parse_origins, DEFAULT_PORT};
use plate_server::ServerConfig;
use plate_telemetry::{LogFormat, TelemetryConfig};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogStyle {
    Json,
    Pretty,
}

/// Pairing relay for the remote keypad.
#[derive(Debug, Parser)]
#[command(name = "remote-plate", version)]
struct Cli {
    /// Address to bind.
    #[arg(long, env = "BIND_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Comma-separated browser origins allowed to connect (default: any).
    #[arg(long = "allowed-origins", env = "ALLOWED_ORIGINS")]
    allowed_origins: Option<String>,

    /// Outbound queue length per connection before events are dropped.
    #[arg(long, default_value_t = 256)]
    max_send_queue: usize,

    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

    /// Close connections silent for longer than this.
    #[arg(long, default_value_t = 90)]
    client_timeout_secs: u64,

    #[arg(long, value_enum, env = "LOG_FORMAT", default_value = "json")]
    log_format: LogStyle,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            allowed_origins: self
                .allowed_origins
                .as_deref()
                .map(parse_origins)
                .unwrap_or_default(),
            max_send_queue: self.max_send_queue,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            client_timeout: Duration::from_secs(self.client_timeout_secs),
            ..ServerConfig::default()
        }
    }

    fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            format: match self.log_format {
                LogStyle::Json => LogFormat::Json,
                LogStyle::Pretty => LogFormat::Pretty,
            },
            ..TelemetryConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    plate_telemetry::init_telemetry(&cli.telemetry_config())?;

    tracing::info!("Starting remote-plate relay");

    let handle = plate_server::start(cli.server_config()).await?;
    tracing::info!(port = handle.port(), "Relay ready");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}
