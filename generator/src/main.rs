use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;

mod config;
mod logging;
mod output;
mod run;
mod signal;

use config::Cli;

/// Exit code for a rejected configuration.
const EXIT_INVALID_CONFIG: u8 = 2;

fn main() -> ExitCode {
    logging::init();

    let cli = Cli::parse();
    let config = match config::resolve(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("run with --help for the full option list");
            return ExitCode::from(EXIT_INVALID_CONFIG);
        }
    };

    let settings = &config.settings;
    tracing::info!(
        role = ?settings.role,
        protocol = ?settings.protocol,
        pattern = ?settings.pattern,
        transfer = settings.transfer_size,
        connections = settings.connection_limit,
        "starting"
    );
    if let Some(rate) = settings.bytes_per_second {
        tracing::info!(
            bytes_per_second = rate,
            quantum_ms = settings.quantum_ms,
            "send throttling enabled"
        );
    }

    let protocol = settings.protocol;
    let start = Instant::now();

    if let Err(e) = run::run(&config) {
        tracing::error!("run failed: {e}");
        return ExitCode::from(EXIT_INVALID_CONFIG);
    }

    output::print_summary(protocol, start.elapsed().as_millis());

    // the exit code is the total error count, saturated
    let errors = output::exit_code();
    ExitCode::from(errors.clamp(0, u8::MAX as i32) as u8)
}
