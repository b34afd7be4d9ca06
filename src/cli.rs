use std::{path::PathBuf, sync::OnceLock};

use clap::Parser;

/// Relay live container logs to WebSocket clients.
#[derive(Parser, Debug, Default)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file.
    #[arg(short, long, default_value = "log-streamer.toml")]
    pub config: PathBuf,

    /// Port the HTTP/WebSocket server listens on.
    #[arg(short, long, env = "LOG_STREAMER_PORT")]
    pub port: Option<u16>,

    /// Default log filter (overridden by RUST_LOG).
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Maximum number of concurrent subscriptions per connection.
    #[arg(long, env = "LOG_STREAMER_MAX_SUBSCRIPTIONS")]
    pub max_subscriptions: Option<usize>,

    /// Number of outbound events buffered per connection.
    #[arg(long, env = "LOG_STREAMER_OUTBOUND_BUFFER")]
    pub outbound_buffer: Option<usize>,

    /// How many historical lines to send when a subscription starts.
    #[arg(long, env = "LOG_STREAMER_TAIL")]
    pub log_tail: Option<String>,

    /// Allowed CORS origin.
    #[arg(long, env = "LOG_STREAMER_CORS_ORIGIN")]
    pub cors_origin: Option<String>,
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}
