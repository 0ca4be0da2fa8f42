//! Process wiring for `attendance-beacon`.
//!
//! This module turns command-line/environment configuration into a reader, a
//! reporter and a [`ScanLoop`], runs the loop, and releases everything when it
//! stops. It is kept free of process exit codes so it can be driven from tests.

use crate::controller::{DEFAULT_MAX_TRANSIENT_ERRORS, LoopConfig, LoopStats, ScanLoop};
use crate::pacing::{Pacing, parse_duration, parse_timeout};
use crate::reader::{self, Backend, ReaderError, TagReader};
use crate::report::Reporter;
use crate::report::postgrest::{DEFAULT_RPC_FUNCTION, HttpTransport, ReportError, RpcReporter};
use clap::Parser;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Configuration, loaded once at startup.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Base URL of the attendance service gateway, e.g. https://<project>.supabase.co
    #[arg(long, env = "ATTENDANCE_URL")]
    pub endpoint: String,

    /// API key sent with every call
    #[arg(long, env = "ATTENDANCE_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Identifier of this reader device, sent with every scan
    #[arg(long, env = "ATTENDANCE_READER_ID")]
    pub reader_id: Option<String>,

    /// Remote procedure that records a scan
    #[arg(long, default_value = DEFAULT_RPC_FUNCTION)]
    pub rpc_function: String,

    /// Wait between polls that found no tag.
    /// Accepts duration with suffix: 200ms, 0.5s, 1m.
    #[arg(long, default_value = "200ms", value_parser = parse_duration)]
    pub poll_interval: Duration,

    /// Upper bound for a single read attempt
    #[arg(long, default_value = "500ms", value_parser = parse_timeout)]
    pub read_timeout: Duration,

    /// Settle delay after every detection, whatever the outcome
    #[arg(long, default_value = "500ms", value_parser = parse_duration)]
    pub cooldown: Duration,

    /// Timeout for one call to the attendance service
    #[arg(long, default_value = "10s", value_parser = parse_timeout)]
    pub rpc_timeout: Duration,

    /// Stop after this many consecutive transient reader errors (0 = never)
    #[arg(long, default_value_t = DEFAULT_MAX_TRANSIENT_ERRORS)]
    pub max_transient_errors: u32,

    /// Tag reader backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// Reader device: a path or '-' for stdin (line), a reader name (pcsc)
    #[arg(long)]
    pub device: Option<String>,

    /// Verbose output, log every detection step
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Options {
    /// Reader identity, with a blank value treated as unset.
    pub fn reader_identity(&self) -> Option<&str> {
        self.reader_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            pacing: Pacing {
                poll_interval: self.poll_interval,
                read_timeout: self.read_timeout,
                cooldown: self.cooldown,
            },
            reader_id: self.reader_identity().map(str::to_string),
            max_transient_errors: self.max_transient_errors,
        }
    }
}

/// Errors that end the process.
#[derive(Error, Debug)]
pub enum RunError {
    /// Reader could not start, or failed while running
    #[error(transparent)]
    Reader(#[from] ReaderError),
    /// Reporter could not be configured
    #[error(transparent)]
    Report(#[from] ReportError),
}

/// Run the scan loop with already-initialized collaborators.
///
/// Both handles are borrowed for the whole run and are free to be dropped by
/// the caller once this returns.
pub async fn run_with(
    reader: &mut dyn TagReader,
    reporter: &dyn Reporter,
    config: LoopConfig,
    shutdown: &CancellationToken,
) -> Result<LoopStats, RunError> {
    let stats = ScanLoop::new(reader, reporter, config).run(shutdown).await?;
    Ok(stats)
}

/// Initialize reader and reporter from `options`, then scan until `shutdown`.
///
/// Initialization failures are returned before any polling starts.
pub async fn run(options: Options, shutdown: CancellationToken) -> Result<LoopStats, RunError> {
    info!(backend = %options.backend, "Initializing tag reader");
    let mut reader = reader::open(options.backend, options.device.as_deref()).await?;
    info!(reader = %reader.describe(), "Tag reader ready");

    info!(endpoint = %options.endpoint, "Initializing attendance client");
    let transport = HttpTransport::new(&options.endpoint, &options.api_key, options.rpc_timeout)?;
    transport.rpc_url(&options.rpc_function)?;
    let reporter = RpcReporter::new(transport, options.rpc_function.clone());

    let config = options.loop_config();
    info!(
        function = reporter.function(),
        reader_id = config.reader_id.as_deref().unwrap_or("not set"),
        poll_interval_ms = config.pacing.poll_interval.as_millis() as u64,
        cooldown_ms = config.pacing.cooldown.as_millis() as u64,
        "Ready to read tags"
    );

    let result = run_with(reader.as_mut(), &reporter, config, &shutdown).await;

    drop(reporter);
    drop(reader);
    info!("Reader and client released");

    result
}
