//! virtwork CLI
//!
//! Creates KubeVirt VMs running continuous synthetic workloads, and cleans
//! them up again.

use std::process::ExitCode;

use clap::Parser;
use tracing::warn;

use virtwork::config::Config;
use virtwork::{telemetry, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Installed first so config file loading is logged
    let log_filter = telemetry::init(cli.global.verbose);

    let config = match Config::resolve(&cli.global) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = log_filter.apply(&config) {
        warn!(error = %e, "Keeping the startup log level");
    }

    match cli.run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
