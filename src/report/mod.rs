//! Delivery of scans to the remote attendance service.
//!
//! A [`Reporter`] turns one [`ScanReport`] into one [`ScanOutcome`]. It never
//! fails: transport faults, error statuses and malformed replies all come back
//! as [`ScanOutcome::DeliveryFailed`], so the scan loop can log them and keep
//! going. The service owns every business decision, including debouncing.

pub mod postgrest;

use crate::tag::TagIdentifier;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// One detected tap, built right before delivery and dropped right after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport<'a> {
    pub tag: &'a TagIdentifier,
    pub reader_id: Option<&'a str>,
}

impl<'a> ScanReport<'a> {
    pub fn new(tag: &'a TagIdentifier, reader_id: Option<&'a str>) -> Self {
        Self { tag, reader_id }
    }
}

/// Why a scan never received a verdict from the service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Connection, TLS or protocol failure
    #[error("transport error: {0}")]
    Transport(String),
    /// The call did not complete within the client timeout
    #[error("request timed out: {0}")]
    Timeout(String),
    /// The service answered with a non-success status
    #[error("service returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    /// The service answered, but not with a boolean verdict
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Result of reporting one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Logged, or intentionally debounced, by the service.
    Accepted,
    /// Declined by the service, e.g. no active session.
    Rejected,
    /// No verdict could be obtained.
    DeliveryFailed(DeliveryError),
}

impl ScanOutcome {
    /// `true` when the service rendered a verdict, either way.
    pub fn is_verdict(&self) -> bool {
        !matches!(self, ScanOutcome::DeliveryFailed(_))
    }
}

impl fmt::Display for ScanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanOutcome::Accepted => write!(f, "accepted"),
            ScanOutcome::Rejected => write!(f, "rejected"),
            ScanOutcome::DeliveryFailed(e) => write!(f, "delivery failed: {e}"),
        }
    }
}

/// Boxed future returned by [`Reporter::report`].
pub type ReportFuture<'a> = Pin<Box<dyn Future<Output = ScanOutcome> + Send + 'a>>;

/// Delivers scans to the attendance service.
///
/// Exactly one outbound call per invocation, no retries.
pub trait Reporter: Send + Sync {
    fn report<'a>(&'a self, report: ScanReport<'a>) -> ReportFuture<'a>;
}

/// Decode a response body into a verdict.
///
/// The remote procedure returns a bare JSON boolean. Anything else, including
/// `null`, a wrapped value or invalid JSON, is a delivery failure.
pub fn decode_verdict(body: &str) -> ScanOutcome {
    match serde_json::from_str::<bool>(body) {
        Ok(true) => ScanOutcome::Accepted,
        Ok(false) => ScanOutcome::Rejected,
        Err(e) => ScanOutcome::DeliveryFailed(DeliveryError::Malformed(format!(
            "expected boolean verdict, got {} ({e})",
            truncate(body, 120)
        ))),
    }
}

/// Shorten a body for log output without splitting a UTF-8 character.
pub(crate) fn truncate(body: &str, max: usize) -> &str {
    let body = body.trim();
    if body.len() <= max {
        return body;
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
