use std::{process::ExitCode, sync::Arc};

use config::RelayConfig;
use runtime::DockerRuntime;

mod cli;
mod config;
mod demux;
mod handler;
mod middleware;
mod protocol;
mod runtime;
mod server;
mod subscription;

#[tokio::main]
async fn main() -> ExitCode {
    // Must run before the CLI is parsed so .env values reach clap
    let _ = dotenv::dotenv();

    let config = match RelayConfig::try_init(cli::get_cli_args()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Unable to load config: {err}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize the logger
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.as_str()),
    )
    .init();

    let runtime = match DockerRuntime::connect(config.log_tail.clone()) {
        Ok(runtime) => Arc::new(runtime),
        Err(err) => {
            log::error!("Failed to create docker client: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = server::run(config, runtime).await {
        log::error!("Server error: {err}");
        return ExitCode::FAILURE;
    }

    log::info!("Server exited gracefully");
    ExitCode::SUCCESS
}
