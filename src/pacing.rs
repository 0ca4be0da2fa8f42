//! Timing discipline for the scan loop.
//!
//! The loop is paced by three durations: how long a single read may wait for
//! a tag, how long to idle between empty polls, and how long to settle after
//! a detection so a tag held against the reader is not reported repeatedly.

use std::time::Duration;

/// Default wait between polls that found no tag.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Default upper bound for a single read attempt.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);
/// Default settle delay after any detection.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(500);

/// Durations that drive the polling state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub poll_interval: Duration,
    pub read_timeout: Duration,
    pub cooldown: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            read_timeout: DEFAULT_READ_TIMEOUT,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

/// Parse a duration from a human-readable string.
///
/// Accepts an optional unit suffix: `ms`, `s`, `m` or `h`. A bare number is
/// seconds. Fractional values are allowed, so `0.5` and `500ms` are equal.
///
/// # Examples
/// ```
/// use attendance_beacon::pacing::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("200ms").unwrap(), Duration::from_millis(200));
/// assert_eq!(parse_duration("0.5").unwrap(), Duration::from_millis(500));
/// assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let split = src
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(src.len());
    let (number, unit) = src.split_at(split);

    let nanos_per_unit = match unit.trim() {
        "" | "s" => 1e9,
        "ms" => 1e6,
        "m" => 60e9,
        "h" => 3600e9,
        other => return Err(format!("unknown duration unit '{}' in: {}", other, src)),
    };

    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {}", src))?;

    let nanos = (value * nanos_per_unit).round();
    if !nanos.is_finite() || nanos > u64::MAX as f64 {
        return Err(format!("duration out of range: {}", src));
    }
    Ok(Duration::from_nanos(nanos as u64))
}

/// Like [`parse_duration`], but rejects zero.
///
/// Used for timeouts, where zero would make every attempt fail.
pub fn parse_timeout(src: &str) -> Result<Duration, String> {
    let timeout = parse_duration(src)?;
    if timeout.is_zero() {
        return Err(format!("timeout must be greater than zero: {}", src.trim()));
    }
    Ok(timeout)
}
