//! Tag reader abstraction.
//!
//! The scan loop only needs one capability from the hardware: "try to read a
//! present tag within a bounded time". Each backend wraps a concrete reader
//! behind [`TagReader`] and sorts its failures into benign outcomes
//! ([`ReadOutcome::NoTag`], [`ReadOutcome::Unreadable`],
//! [`ReadOutcome::Transient`]) or a fatal [`ReaderError`].

#[cfg(feature = "line")]
pub mod line;

#[cfg(feature = "pcsc")]
pub mod pcsc;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Result of a single read attempt that did not hit a fatal fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Raw UID bytes of a presented tag, in reader order.
    Tag(Vec<u8>),
    /// No tag was presented within the timeout.
    NoTag,
    /// A card is in the field but could not be read (mute, unsupported, pulled
    /// mid-read). The reader itself is fine, so this never counts as a fault.
    Unreadable(String),
    /// A reader-level glitch (garbled line, I/O hiccup, link error).
    Transient(String),
}

/// Non-recoverable reader faults.
#[derive(Error, Debug)]
pub enum ReaderError {
    /// The reader could not be brought up at startup
    #[error("Reader initialization failed: {0}")]
    Init(String),
    /// The reader went away while the loop was running
    #[error("Reader disconnected: {0}")]
    Disconnected(String),
    /// Any other fault the backend cannot recover from
    #[error("Reader fault: {0}")]
    Fatal(String),
    /// Too many transient errors in a row to keep trusting the hardware
    #[error("Reader reported {count} consecutive transient errors (last: {last})")]
    FaultStreak { count: u32, last: String },
}

/// Boxed future returned by [`TagReader::try_read`].
pub type ReadFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ReadOutcome, ReaderError>> + Send + 'a>>;

/// A tag reader the scan loop can poll.
///
/// Implementations must return within roughly `timeout` and must be cancel
/// safe: dropping the future before completion loses no tag that a later
/// call could still report.
pub trait TagReader: Send {
    fn try_read(&mut self, timeout: Duration) -> ReadFuture<'_>;

    /// Human-readable description of the underlying device, for logs.
    fn describe(&self) -> String;
}

/// Available reader backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// One hex UID per line from a device node or stdin (keyboard-wedge and serial readers)
    #[cfg(feature = "line")]
    #[value(aliases = ["stdin", "serial"])]
    Line,
    /// PC/SC smart card service (USB NFC readers)
    #[cfg(feature = "pcsc")]
    #[value(alias = "pcsclite")]
    Pcsc,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "line")]
        return Backend::Line;
        #[cfg(all(feature = "pcsc", not(feature = "line")))]
        return Backend::Pcsc;
        #[cfg(not(any(feature = "line", feature = "pcsc")))]
        compile_error!("At least one reader backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "line")]
            Backend::Line => write!(f, "line"),
            #[cfg(feature = "pcsc")]
            Backend::Pcsc => write!(f, "pcsc"),
            #[cfg(not(any(feature = "line", feature = "pcsc")))]
            _ => unreachable!("Backend enum has no variants when no backend features are enabled"),
        }
    }
}

/// Initialize the reader for the selected backend.
///
/// `device` is backend specific: a path (or `-` for stdin) for `line`, a
/// reader name substring for `pcsc`. Failure here is a startup error and is
/// never retried.
pub async fn open(backend: Backend, device: Option<&str>) -> Result<Box<dyn TagReader>, ReaderError> {
    match backend {
        #[cfg(feature = "line")]
        Backend::Line => Ok(Box::new(line::open(device).await?)),
        #[cfg(feature = "pcsc")]
        Backend::Pcsc => Ok(Box::new(pcsc::PcscReader::open(device)?)),
    }
}

/// Tracks consecutive transient read errors.
///
/// A reader that only ever glitches is indistinguishable from an idle one
/// unless someone counts. Once `limit` transient reads arrive back to back the
/// streak escalates to [`ReaderError::FaultStreak`]. A limit of zero disables
/// escalation.
#[derive(Debug, Clone)]
pub struct TransientStreak {
    limit: u32,
    count: u32,
}

impl TransientStreak {
    pub fn new(limit: u32) -> Self {
        Self { limit, count: 0 }
    }

    /// Current number of consecutive transient reads.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Feed one read outcome into the streak.
    pub fn record(&mut self, outcome: &ReadOutcome) -> Result<(), ReaderError> {
        match outcome {
            ReadOutcome::Transient(reason) => {
                self.count = self.count.saturating_add(1);
                if self.limit > 0 && self.count >= self.limit {
                    return Err(ReaderError::FaultStreak {
                        count: self.count,
                        last: reason.clone(),
                    });
                }
                Ok(())
            }
            ReadOutcome::Tag(_) | ReadOutcome::NoTag | ReadOutcome::Unreadable(_) => {
                self.count = 0;
                Ok(())
            }
        }
    }
}
