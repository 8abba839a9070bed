//! MQTT Tracer - record MQTT traffic during a time window
//!
//! Subscribes to a set of topic filters on a broker profile from
//! `~/.emqutiti/config.toml`, stores every message received between `--start`
//! and `--end` under the trace key, and prints how many messages each filter
//! matched.
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success (including interrupt and any failure after the trace started) |
//! | 1 | Configuration/argument error |
//! | 2 | Connection/authentication error |
//! | 3 | Trace store error before the trace started |
//! | 4 | Any other failure before the trace started |

use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use mqtt_tracer::cli::Args;
use mqtt_tracer::error::TracerError;
use mqtt_tracer::headless::{self, Driver, Phase, EXIT_SUCCESS};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse_normalized();
    let request = match args.to_request() {
        Ok(request) => request,
        Err(e) => {
            eprintln!("{}: {}", Phase::Config, e);
            eprintln!("  Hint: Use --help for usage information");
            return ExitCode::from(headless::exit_code(&e));
        }
    };

    match Driver::default().run(&request, wait_for_shutdown_signal()).await {
        Ok(summary) => {
            for line in summary.lines() {
                println!("{}", line);
            }
            ExitCode::from(EXIT_SUCCESS)
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

/// Completes on SIGINT (Ctrl+C) or SIGTERM.
///
/// If the handlers cannot be installed the future never completes, so the
/// trace still runs to its end time.
async fn wait_for_shutdown_signal() {
    if let Err(e) = shutdown_signal().await {
        tracing::warn!(error = %e, "cannot listen for shutdown signals");
        std::future::pending::<()>().await;
    }
}

async fn shutdown_signal() -> Result<(), TracerError> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                eprintln!("\nReceived SIGINT (Ctrl+C), stopping trace...");
            }
            _ = sigterm.recv() => {
                eprintln!("\nReceived SIGTERM, stopping trace...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        eprintln!("\nReceived Ctrl+C, stopping trace...");
    }

    Ok(())
}
