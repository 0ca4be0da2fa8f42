//! `attendance-beacon` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logging setup,
//! signals and process exit codes. The scan-and-report loop lives in
//! [`crate::controller`] where it can be tested deterministically with an
//! injected reader and reporter.

pub mod app;
pub mod controller;
pub mod pacing;
pub mod reader;
pub mod report;
pub mod tag;

// Re-export commonly used types at the crate root
pub use controller::{LoopConfig, LoopStats, ScanLoop};
pub use pacing::{Pacing, parse_duration, parse_timeout};
pub use reader::{Backend, ReadOutcome, ReaderError, TagReader, TransientStreak};
pub use report::postgrest::{HttpTransport, RpcReporter, RpcTransport};
pub use report::{DeliveryError, Reporter, ScanOutcome, ScanReport, decode_verdict};
pub use tag::{TagError, TagIdentifier, normalize, parse_hex};
