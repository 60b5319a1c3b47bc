use std::process::ExitCode;

use clap::Parser;
use mimalloc::MiMalloc;
use raspi_live::cli::{Cli, Commands};
use raspi_live::pipeline::{self, ShutdownConfig, Termination};
use raspi_live::{logging, panic_hook, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let logging_options = cli.logging_options();

    let _log_guard = match logging::init_logging(&logging_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    panic_hook::install(logging_options.log_dir.as_deref());

    let stop = CancellationToken::new();
    signal::spawn_signal_listener(stop.clone());
    if let Some(log_dir) = logging_options.log_dir.clone() {
        logging::spawn_retention_cleanup(log_dir, stop.child_token());
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting raspi-live");

    let result = match cli.command {
        Commands::Dash(dash) => {
            let configs = dash.into_configs(&cli.video);
            pipeline::run(
                configs.stream,
                configs.mux,
                configs.server,
                ShutdownConfig::default(),
                stop,
            )
            .await
        }
    };

    match result {
        Ok(Termination::StopRequested) => {
            info!("Stopped");
            ExitCode::SUCCESS
        }
        Ok(Termination::ComponentExited(component)) => {
            info!(%component, "Stream ended");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "{}", e.diagnostic());
            ExitCode::FAILURE
        }
    }
}
