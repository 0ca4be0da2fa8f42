//! Line-oriented reader backend.
//!
//! Many inexpensive readers present themselves as a serial port or a USB
//! keyboard and emit each tag UID as a line of hex text. This backend reads
//! those lines from a device node, a FIFO, or stdin.

use super::{ReadFuture, ReadOutcome, ReaderError, TagReader};
use crate::tag::parse_hex;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

/// Path that selects stdin instead of a file.
pub const STDIN_PATH: &str = "-";

/// Longest line kept in memory. Anything past it is dropped up to the next
/// newline and the line is reported as a transient error.
pub const MAX_LINE_LEN: usize = 256;

enum Line {
    Text(String),
    Overlong,
}

/// Reader that turns text lines into tag reads.
pub struct LineReader<R> {
    input: R,
    pending: Vec<u8>,
    overlong: bool,
    source: String,
}

impl<R> LineReader<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(input: R, source: impl Into<String>) -> Self {
        Self {
            input,
            pending: Vec::with_capacity(64),
            overlong: false,
            source: source.into(),
        }
    }

    /// Next complete line, or `None` at end of input.
    ///
    /// Cancel safe: buffered bytes only move into `pending` together with the
    /// matching `consume`, with no await in between.
    async fn next_line(&mut self) -> io::Result<Option<Line>> {
        loop {
            let chunk = self.input.fill_buf().await?;
            if chunk.is_empty() {
                if self.pending.is_empty() && !self.overlong {
                    return Ok(None);
                }
                return Ok(Some(self.take_line()));
            }

            let (used, content, complete) = match chunk.iter().position(|&b| b == b'\n') {
                Some(i) => (i + 1, i, true),
                None => (chunk.len(), chunk.len(), false),
            };
            let room = MAX_LINE_LEN - self.pending.len();
            if content > room {
                self.overlong = true;
            }
            self.pending.extend_from_slice(&chunk[..content.min(room)]);
            self.input.consume(used);

            if complete {
                return Ok(Some(self.take_line()));
            }
        }
    }

    fn take_line(&mut self) -> Line {
        let bytes = std::mem::take(&mut self.pending);
        if std::mem::take(&mut self.overlong) {
            return Line::Overlong;
        }
        let bytes = bytes.strip_suffix(b"\r").unwrap_or(&bytes);
        Line::Text(String::from_utf8_lossy(bytes).into_owned())
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<ReadOutcome, ReaderError> {
        let line = match tokio::time::timeout(timeout, self.next_line()).await {
            Err(_elapsed) => return Ok(ReadOutcome::NoTag),
            Ok(Err(e)) => return Ok(ReadOutcome::Transient(format!("read error: {e}"))),
            Ok(Ok(None)) => {
                return Err(ReaderError::Disconnected(format!(
                    "end of input on {}",
                    self.source
                )));
            }
            Ok(Ok(Some(Line::Overlong))) => {
                return Ok(ReadOutcome::Transient(format!(
                    "line longer than {MAX_LINE_LEN} bytes discarded"
                )));
            }
            Ok(Ok(Some(Line::Text(line)))) => line,
        };

        match parse_hex(&line) {
            Ok(bytes) if bytes.is_empty() => Ok(ReadOutcome::NoTag),
            Ok(bytes) => Ok(ReadOutcome::Tag(bytes)),
            Err(e) => Ok(ReadOutcome::Transient(format!("unreadable line {line:?}: {e}"))),
        }
    }
}

impl<R> TagReader for LineReader<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    fn try_read(&mut self, timeout: Duration) -> ReadFuture<'_> {
        Box::pin(self.read_line(timeout))
    }

    fn describe(&self) -> String {
        format!("line reader on {}", self.source)
    }
}

/// Open the line reader on `path`, or stdin when `path` is `None` or `-`.
pub async fn open(
    path: Option<&str>,
) -> Result<LineReader<Box<dyn AsyncBufRead + Unpin + Send>>, ReaderError> {
    match path {
        None | Some(STDIN_PATH) => {
            let input: Box<dyn AsyncBufRead + Unpin + Send> =
                Box::new(BufReader::new(tokio::io::stdin()));
            Ok(LineReader::new(input, "stdin"))
        }
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|e| ReaderError::Init(format!("cannot open {path}: {e}")))?;
            let input: Box<dyn AsyncBufRead + Unpin + Send> = Box::new(BufReader::new(file));
            Ok(LineReader::new(input, path))
        }
    }
}
