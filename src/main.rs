use carreton_core::SessionExit;
use carreton_relay::{init_logging, run, Cli, RelayConfig};
use clap::Parser;
use log::error;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = match RelayConfig::resolve(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("[relay] {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(SessionExit::LoggedOut | SessionExit::Shutdown) => ExitCode::SUCCESS,
        Ok(SessionExit::QueueClosed) => ExitCode::FAILURE,
        Err(e) => {
            error!("[relay] Fatal: {}", e);
            ExitCode::FAILURE
        }
    }
}
