//! Scan loop controller.
//!
//! Drives the reader, normalizer and reporter strictly in sequence:
//!
//! ```text
//!            no tag / glitch: wait poll interval
//!              ┌──────┐
//!              ▼      │
//!  ──────►  Polling ──┘
//!            │    ▲
//!  tag read, │    │ settle delay elapsed
//!  reported  ▼    │
//!           Cooldown
//!
//!  any state ── cancellation ──► Stopped
//! ```
//!
//! Reads and sleeps race against cancellation. A report that has started is
//! always allowed to finish, and no report starts once cancellation is seen.

use crate::pacing::Pacing;
use crate::reader::{ReadOutcome, ReaderError, TagReader, TransientStreak};
use crate::report::{Reporter, ScanOutcome, ScanReport};
use crate::tag::{TagIdentifier, normalize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// Default number of back-to-back transient reads before the reader is
/// considered broken.
pub const DEFAULT_MAX_TRANSIENT_ERRORS: u32 = 50;

/// States of the scan loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Polling,
    Cooldown,
    Stopped,
}

/// Settings the loop needs beyond its collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    pub pacing: Pacing,
    /// Identity of this device, sent with every report when set.
    pub reader_id: Option<String>,
    /// Escalate after this many consecutive transient reads; zero disables.
    pub max_transient_errors: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            pacing: Pacing::default(),
            reader_id: None,
            max_transient_errors: DEFAULT_MAX_TRANSIENT_ERRORS,
        }
    }
}

/// Counters accumulated over a run, returned when the loop stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub polls: u64,
    pub detections: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub delivery_failed: u64,
    pub transient_errors: u64,
    /// Polls that saw a card in the field but could not read it.
    pub unreadable: u64,
}

impl LoopStats {
    fn record(&mut self, outcome: &ScanOutcome) {
        match outcome {
            ScanOutcome::Accepted => self.accepted += 1,
            ScanOutcome::Rejected => self.rejected += 1,
            ScanOutcome::DeliveryFailed(_) => self.delivery_failed += 1,
        }
    }
}

/// The process-wide scan loop. Owns nothing but borrows the reader and
/// reporter for its whole run.
pub struct ScanLoop<'a> {
    reader: &'a mut dyn TagReader,
    reporter: &'a dyn Reporter,
    config: LoopConfig,
    streak: TransientStreak,
    stats: LoopStats,
    state: LoopState,
}

impl<'a> ScanLoop<'a> {
    pub fn new(reader: &'a mut dyn TagReader, reporter: &'a dyn Reporter, config: LoopConfig) -> Self {
        let streak = TransientStreak::new(config.max_transient_errors);
        Self {
            reader,
            reporter,
            config,
            streak,
            stats: LoopStats::default(),
            state: LoopState::Polling,
        }
    }

    /// Run until `shutdown` is cancelled or the reader fails fatally.
    ///
    /// Delivery failures never end the loop. Reader faults do: they are the
    /// only errors that escape, and the loop stops rather than keep polling
    /// hardware in an unknown state.
    pub async fn run(mut self, shutdown: &CancellationToken) -> Result<LoopStats, ReaderError> {
        while !shutdown.is_cancelled() {
            self.state = match self.state {
                LoopState::Polling => self.poll(shutdown).await?,
                LoopState::Cooldown => self.cool_down(shutdown).await,
                LoopState::Stopped => break,
            };
        }

        self.state = LoopState::Stopped;
        info!(
            polls = self.stats.polls,
            detections = self.stats.detections,
            accepted = self.stats.accepted,
            rejected = self.stats.rejected,
            delivery_failed = self.stats.delivery_failed,
            unreadable = self.stats.unreadable,
            "Scan loop stopped"
        );
        Ok(self.stats)
    }

    /// One `Polling` step. Returns the next state.
    async fn poll(&mut self, shutdown: &CancellationToken) -> Result<LoopState, ReaderError> {
        self.stats.polls += 1;
        trace!(poll = self.stats.polls, "Polling reader");

        let read = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(LoopState::Stopped),
            read = self.reader.try_read(self.config.pacing.read_timeout) => read?,
        };

        self.streak.record(&read)?;

        let tag = match read {
            ReadOutcome::Tag(raw) => match normalize(&raw) {
                Ok(tag) => Some(tag),
                Err(e) => {
                    debug!(error = %e, "Discarding unusable read");
                    None
                }
            },
            ReadOutcome::NoTag => None,
            ReadOutcome::Unreadable(reason) => {
                self.stats.unreadable += 1;
                debug!(%reason, "Card in field could not be read");
                None
            }
            ReadOutcome::Transient(reason) => {
                self.stats.transient_errors += 1;
                debug!(
                    %reason,
                    streak = self.streak.count(),
                    "Transient reader error"
                );
                None
            }
        };

        let Some(tag) = tag else {
            return Ok(self.idle(shutdown, self.config.pacing.poll_interval).await);
        };

        self.stats.detections += 1;
        if shutdown.is_cancelled() {
            info!(tag = %tag, "Tag detected during shutdown, not reporting");
            return Ok(LoopState::Stopped);
        }

        self.report(&tag).await;
        Ok(LoopState::Cooldown)
    }

    async fn report(&mut self, tag: &TagIdentifier) {
        let reader_id = self.config.reader_id.as_deref();
        info!(tag = %tag, reader_id = reader_id.unwrap_or("-"), "Tag detected, reporting");

        let outcome = self.reporter.report(ScanReport::new(tag, reader_id)).await;
        match &outcome {
            ScanOutcome::Accepted => {
                info!(tag = %tag, "Scan acknowledged (logged or debounced)");
            }
            ScanOutcome::Rejected => {
                info!(tag = %tag, "Scan rejected by service (no active session or other condition)");
            }
            ScanOutcome::DeliveryFailed(e) => {
                error!(tag = %tag, error = %e, "Scan could not be delivered");
            }
        }
        self.stats.record(&outcome);
    }

    /// The `Cooldown` step: settle, then go back to polling.
    async fn cool_down(&mut self, shutdown: &CancellationToken) -> LoopState {
        debug!(cooldown_ms = self.config.pacing.cooldown.as_millis() as u64, "Cooling down");
        match self.idle(shutdown, self.config.pacing.cooldown).await {
            LoopState::Stopped => LoopState::Stopped,
            _ => LoopState::Polling,
        }
    }

    /// Sleep for `delay`, waking early on cancellation.
    async fn idle(&self, shutdown: &CancellationToken, delay: Duration) -> LoopState {
        if delay.is_zero() {
            return LoopState::Polling;
        }
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => LoopState::Stopped,
            _ = tokio::time::sleep(delay) => LoopState::Polling,
        }
    }
}

/// Log a reader fault that ended the loop.
pub fn log_reader_fault(err: &ReaderError) {
    match err {
        ReaderError::FaultStreak { .. } => {
            error!(error = %err, "Reader kept failing, giving up");
        }
        _ => {
            error!(error = %err, "Unexpected reader fault, stopping scan loop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::ReadFuture;
    use crate::report::{DeliveryError, ReportFuture};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    /// Reader that replays a script, then reports no tag forever.
    struct ScriptedReader {
        script: VecDeque<Result<ReadOutcome, ReaderError>>,
        reads: Arc<Mutex<u32>>,
        /// Cancel this token once the script runs out.
        stop_when_done: Option<CancellationToken>,
    }

    impl ScriptedReader {
        fn new(script: Vec<Result<ReadOutcome, ReaderError>>) -> Self {
            Self {
                script: script.into(),
                reads: Arc::new(Mutex::new(0)),
                stop_when_done: None,
            }
        }

        fn stopping(mut self, token: &CancellationToken) -> Self {
            self.stop_when_done = Some(token.clone());
            self
        }
    }

    impl TagReader for ScriptedReader {
        fn try_read(&mut self, timeout: Duration) -> ReadFuture<'_> {
            *self.reads.lock().unwrap() += 1;
            let next = self.script.pop_front();
            if next.is_none()
                && let Some(token) = &self.stop_when_done
            {
                token.cancel();
            }
            Box::pin(async move {
                match next {
                    Some(step) => step,
                    None => {
                        tokio::time::sleep(timeout).await;
                        Ok(ReadOutcome::NoTag)
                    }
                }
            })
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    /// Reporter that records each call and answers from a fixed list.
    #[derive(Clone)]
    struct RecordingReporter {
        answers: Arc<Mutex<VecDeque<ScanOutcome>>>,
        calls: Arc<Mutex<Vec<(String, Option<String>, Instant)>>>,
        delay: Duration,
    }

    impl RecordingReporter {
        fn new(answers: Vec<ScanOutcome>) -> Self {
            Self {
                answers: Arc::new(Mutex::new(answers.into())),
                calls: Arc::new(Mutex::new(Vec::new())),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> Vec<(String, Option<String>, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Reporter for RecordingReporter {
        fn report<'a>(&'a self, report: ScanReport<'a>) -> ReportFuture<'a> {
            self.calls.lock().unwrap().push((
                report.tag.to_string(),
                report.reader_id.map(str::to_string),
                Instant::now(),
            ));
            let outcome = self
                .answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ScanOutcome::Accepted);
            let delay = self.delay;
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                outcome
            })
        }
    }

    fn tag(bytes: &[u8]) -> Result<ReadOutcome, ReaderError> {
        Ok(ReadOutcome::Tag(bytes.to_vec()))
    }

    fn no_tag() -> Result<ReadOutcome, ReaderError> {
        Ok(ReadOutcome::NoTag)
    }

    fn config(reader_id: Option<&str>) -> LoopConfig {
        LoopConfig {
            reader_id: reader_id.map(str::to_string),
            ..LoopConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn detected_tag_is_reported_and_accepted() {
        let shutdown = CancellationToken::new();
        let mut reader = ScriptedReader::new(vec![tag(&[0x04, 0xA3, 0x2B])]).stopping(&shutdown);
        let reporter = RecordingReporter::new(vec![ScanOutcome::Accepted]);

        let stats = ScanLoop::new(&mut reader, &reporter, config(Some("Office")))
            .run(&shutdown)
            .await
            .unwrap();

        let calls = reporter.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "04A32B");
        assert_eq!(calls[0].1.as_deref(), Some("Office"));
        assert_eq!(stats.detections, 1);
        assert_eq!(stats.accepted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_polls_never_report() {
        let shutdown = CancellationToken::new();
        let mut reader = ScriptedReader::new((0..10).map(|_| no_tag()).collect()).stopping(&shutdown);
        let reporter = RecordingReporter::new(vec![]);

        let stats = ScanLoop::new(&mut reader, &reporter, config(None))
            .run(&shutdown)
            .await
            .unwrap();

        assert!(reporter.calls().is_empty());
        assert_eq!(stats.detections, 0);
        assert!(stats.polls >= 10);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_polls_wait_one_poll_interval() {
        let shutdown = CancellationToken::new();
        let mut reader = ScriptedReader::new((0..10).map(|_| no_tag()).collect()).stopping(&shutdown);
        let reporter = RecordingReporter::new(vec![]);
        let started = Instant::now();

        ScanLoop::new(&mut reader, &reporter, config(None))
            .run(&shutdown)
            .await
            .unwrap();

        assert!(started.elapsed() >= Pacing::default().poll_interval * 10);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_scan_still_cools_down() {
        let shutdown = CancellationToken::new();
        let mut reader =
            ScriptedReader::new(vec![tag(&[0x00]), tag(&[0x00])]).stopping(&shutdown);
        let reporter = RecordingReporter::new(vec![ScanOutcome::Rejected, ScanOutcome::Rejected]);

        let stats = ScanLoop::new(&mut reader, &reporter, config(None))
            .run(&shutdown)
            .await
            .unwrap();

        let calls = reporter.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "00");
        assert!(calls[1].2 - calls[0].2 >= Pacing::default().cooldown);
        assert_eq!(stats.rejected, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn held_tag_is_reported_at_most_once_per_cooldown() {
        let shutdown = CancellationToken::new();
        let held: Vec<_> = (0..20).map(|_| tag(&[0xDE, 0xAD, 0xBE, 0xEF])).collect();
        let mut reader = ScriptedReader::new(held).stopping(&shutdown);
        let reporter = RecordingReporter::new(vec![]);
        let pacing = Pacing {
            cooldown: Duration::from_secs(2),
            ..Pacing::default()
        };
        let config = LoopConfig {
            pacing,
            ..LoopConfig::default()
        };

        ScanLoop::new(&mut reader, &reporter, config)
            .run(&shutdown)
            .await
            .unwrap();

        let calls = reporter.calls();
        assert_eq!(calls.len(), 20);
        for pair in calls.windows(2) {
            assert!(pair[1].2 - pair[0].2 >= pacing.cooldown);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_failure_cools_down_and_keeps_polling() {
        let shutdown = CancellationToken::new();
        let mut reader = ScriptedReader::new(vec![tag(&[0x04, 0xA3, 0x2B]), no_tag(), tag(&[0x01])])
            .stopping(&shutdown);
        let reporter = RecordingReporter::new(vec![
            ScanOutcome::DeliveryFailed(DeliveryError::Timeout("10s".into())),
            ScanOutcome::Accepted,
        ]);

        let stats = ScanLoop::new(&mut reader, &reporter, config(None))
            .run(&shutdown)
            .await
            .unwrap();

        let calls = reporter.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].2 - calls[0].2 >= Pacing::default().cooldown);
        assert_eq!(stats.delivery_failed, 1);
        assert_eq!(stats.accepted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_while_polling_stops_within_one_interval() {
        let shutdown = CancellationToken::new();
        let mut reader = ScriptedReader::new(vec![]);
        let reads = reader.reads.clone();
        let reporter = RecordingReporter::new(vec![]);

        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        ScanLoop::new(&mut reader, &reporter, config(None))
            .run(&shutdown)
            .await
            .unwrap();

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed <= Duration::from_secs(3) + Pacing::default().poll_interval);
        assert!(*reads.lock().unwrap() > 0);
        assert!(reporter.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tag_read_after_cancellation_is_not_reported() {
        let shutdown = CancellationToken::new();
        struct CancelOnRead(CancellationToken);
        impl TagReader for CancelOnRead {
            fn try_read(&mut self, _timeout: Duration) -> ReadFuture<'_> {
                let token = self.0.clone();
                Box::pin(async move {
                    token.cancel();
                    Ok(ReadOutcome::Tag(vec![0x01, 0x02]))
                })
            }
            fn describe(&self) -> String {
                "cancel-on-read".to_string()
            }
        }

        let mut reader = CancelOnRead(shutdown.clone());
        let reporter = RecordingReporter::new(vec![]);
        let stats = ScanLoop::new(&mut reader, &reporter, config(None))
            .run(&shutdown)
            .await
            .unwrap();

        assert!(reporter.calls().is_empty());
        assert_eq!(stats.detections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_report_completes_before_stop() {
        let shutdown = CancellationToken::new();
        let mut reader = ScriptedReader::new(vec![tag(&[0x0A])]);
        let mut reporter = RecordingReporter::new(vec![ScanOutcome::Accepted]);
        reporter.delay = Duration::from_secs(5);

        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let stats = ScanLoop::new(&mut reader, &reporter, config(None))
            .run(&shutdown)
            .await
            .unwrap();

        assert_eq!(reporter.calls().len(), 1);
        assert_eq!(stats.accepted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reader_fault_terminates_loop() {
        let shutdown = CancellationToken::new();
        let mut reader = ScriptedReader::new(vec![
            no_tag(),
            Err(ReaderError::Disconnected("usb unplugged".into())),
        ]);
        let reporter = RecordingReporter::new(vec![]);

        let err = ScanLoop::new(&mut reader, &reporter, config(None))
            .run(&shutdown)
            .await
            .unwrap_err();

        assert!(matches!(err, ReaderError::Disconnected(_)));
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_streak_escalates() {
        let shutdown = CancellationToken::new();
        let glitches = (0..5)
            .map(|i| Ok(ReadOutcome::Transient(format!("glitch {i}"))))
            .collect();
        let mut reader = ScriptedReader::new(glitches).stopping(&shutdown);
        let reporter = RecordingReporter::new(vec![]);
        let config = LoopConfig {
            max_transient_errors: 3,
            ..LoopConfig::default()
        };

        let err = ScanLoop::new(&mut reader, &reporter, config)
            .run(&shutdown)
            .await
            .unwrap_err();

        assert!(matches!(err, ReaderError::FaultStreak { count: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn interleaved_glitches_do_not_escalate() {
        let shutdown = CancellationToken::new();
        let script = (0..10)
            .flat_map(|_| [Ok(ReadOutcome::Transient("crc".into())), no_tag()])
            .collect();
        let mut reader = ScriptedReader::new(script).stopping(&shutdown);
        let reporter = RecordingReporter::new(vec![]);
        let config = LoopConfig {
            max_transient_errors: 2,
            ..LoopConfig::default()
        };

        let stats = ScanLoop::new(&mut reader, &reporter, config)
            .run(&shutdown)
            .await
            .unwrap();

        assert_eq!(stats.transient_errors, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn mute_card_resting_on_reader_keeps_loop_running() {
        let shutdown = CancellationToken::new();
        let mute = (0..200)
            .map(|_| Ok(ReadOutcome::Unreadable("Card is unresponsive".into())))
            .collect();
        let mut reader = ScriptedReader::new(mute).stopping(&shutdown);
        let reporter = RecordingReporter::new(vec![]);

        let stats = ScanLoop::new(&mut reader, &reporter, LoopConfig::default())
            .run(&shutdown)
            .await
            .unwrap();

        assert!(reporter.calls().is_empty());
        assert_eq!(stats.unreadable, 200);
        assert_eq!(stats.transient_errors, 0);
        assert_eq!(stats.detections, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_card_breaks_a_transient_streak() {
        let shutdown = CancellationToken::new();
        let script = (0..10)
            .flat_map(|_| {
                [
                    Ok(ReadOutcome::Transient("crc".into())),
                    Ok(ReadOutcome::Unreadable("reset".into())),
                ]
            })
            .collect();
        let mut reader = ScriptedReader::new(script).stopping(&shutdown);
        let reporter = RecordingReporter::new(vec![]);
        let config = LoopConfig {
            max_transient_errors: 2,
            ..LoopConfig::default()
        };

        let stats = ScanLoop::new(&mut reader, &reporter, config)
            .run(&shutdown)
            .await
            .unwrap();

        assert_eq!(stats.transient_errors, 10);
        assert_eq!(stats.unreadable, 10);
    }
}
