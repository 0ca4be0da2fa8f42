use attendance_beacon::app::{self, Options, RunError};
use attendance_beacon::ReaderError;
use attendance_beacon::controller::log_reader_fault;
use clap::Parser;
use std::panic::{self, PanicHookInfo};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

/// Install the log subscriber. `RUST_LOG` wins over `--verbose`.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Cancel `shutdown` on Ctrl+C, or SIGTERM on unix (systemd stop).
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "SIGTERM handler unavailable, only Ctrl+C stops the beacon");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        let _ = tokio::signal::ctrl_c().await;

        tracing::info!("Shutdown requested, finishing current step");
        shutdown.cancel();
    });
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_tracing(options.verbose);

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    match app::run(options, shutdown).await {
        Ok(_) => std::process::exit(EXIT_SUCCESS),
        Err(RunError::Reader(why)) if !matches!(why, ReaderError::Init(_)) => {
            log_reader_fault(&why);
            std::process::exit(EXIT_ERROR);
        }
        Err(why) => {
            tracing::error!(error = %why, "Startup failed");
            std::process::exit(EXIT_ERROR);
        }
    }
}
