//! PC/SC reader backend.
//!
//! Talks to `pcscd` through the `pcsc` crate, which covers the common USB NFC
//! readers (including PN532-based ones). The PC/SC API is blocking, so each
//! read runs on the blocking thread pool.
//!
//! Requires the `pcsc` feature and a running PC/SC daemon.

use super::{ReadFuture, ReadOutcome, ReaderError, TagReader};
use pcsc::{Context, Error, Protocols, ReaderState, Scope, ShareMode, State};
use std::ffi::CString;
use std::time::Duration;

/// PC/SC pseudo-APDU: GET DATA, UID of the card in the field.
const GET_UID_APDU: [u8; 5] = [0xFF, 0xCA, 0x00, 0x00, 0x00];

/// Status word for a successful APDU.
const SW_SUCCESS: [u8; 2] = [0x90, 0x00];

/// A single PC/SC reader, selected at startup.
pub struct PcscReader {
    context: Context,
    reader: CString,
}

impl PcscReader {
    /// Establish a PC/SC context and pick a reader.
    ///
    /// With `name` set, the first reader whose name contains it is used;
    /// otherwise the first reader reported by the service.
    pub fn open(name: Option<&str>) -> Result<Self, ReaderError> {
        let context = Context::establish(Scope::User)
            .map_err(|e| ReaderError::Init(format!("PC/SC service unavailable: {e}")))?;

        let readers = context
            .list_readers_owned()
            .map_err(|e| ReaderError::Init(format!("cannot list PC/SC readers: {e}")))?;

        let reader = readers
            .into_iter()
            .find(|r| name.is_none_or(|wanted| r.to_string_lossy().contains(wanted)))
            .ok_or_else(|| match name {
                Some(wanted) => ReaderError::Init(format!("no PC/SC reader matching '{wanted}'")),
                None => ReaderError::Init("no PC/SC readers connected".to_string()),
            })?;

        Ok(Self { context, reader })
    }
}

impl TagReader for PcscReader {
    fn try_read(&mut self, timeout: Duration) -> ReadFuture<'_> {
        let context = self.context.clone();
        let reader = self.reader.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || read_uid(&context, reader, timeout))
                .await
                .map_err(|e| ReaderError::Fatal(format!("PC/SC read task failed: {e}")))?
        })
    }

    fn describe(&self) -> String {
        format!("PC/SC reader {}", self.reader.to_string_lossy())
    }
}

fn read_uid(context: &Context, reader: CString, timeout: Duration) -> Result<ReadOutcome, ReaderError> {
    // Starting from EMPTY makes the call return at once when a card is
    // already in the field, and wait up to `timeout` otherwise.
    let mut states = [ReaderState::new(reader.clone(), State::EMPTY)];
    match context.get_status_change(timeout, &mut states) {
        Ok(()) => {}
        Err(Error::Timeout) => return Ok(ReadOutcome::NoTag),
        Err(e) => return classify(e),
    }

    if !states[0].event_state().contains(State::PRESENT) {
        return Ok(ReadOutcome::NoTag);
    }

    let card = match context.connect(&reader, ShareMode::Shared, Protocols::ANY) {
        Ok(card) => card,
        Err(e) => return classify(e),
    };

    let mut buf = [0u8; pcsc::MAX_BUFFER_SIZE];
    let response = match card.transmit(&GET_UID_APDU, &mut buf) {
        Ok(response) => response,
        Err(e) => return classify(e),
    };

    match response.split_last_chunk::<2>() {
        Some((uid, status)) if *status == SW_SUCCESS => Ok(ReadOutcome::Tag(uid.to_vec())),
        Some((_, status)) => Ok(ReadOutcome::Unreadable(format!(
            "GET UID rejected with status {:02X}{:02X}",
            status[0], status[1]
        ))),
        None => Ok(ReadOutcome::Unreadable("short GET UID response".to_string())),
    }
}

/// Sort PC/SC errors into card-level trouble, reader glitches and reader loss.
///
/// A card resting in the field keeps failing the same way on every poll, so
/// card-level errors must not feed the transient streak.
fn classify(err: Error) -> Result<ReadOutcome, ReaderError> {
    match err {
        Error::Timeout | Error::NoSmartcard | Error::RemovedCard => Ok(ReadOutcome::NoTag),
        Error::ResetCard
        | Error::UnresponsiveCard
        | Error::UnpoweredCard
        | Error::UnsupportedCard
        | Error::SharingViolation
        | Error::ProtoMismatch => Ok(ReadOutcome::Unreadable(err.to_string())),
        Error::CommError => Ok(ReadOutcome::Transient(err.to_string())),
        Error::ReaderUnavailable | Error::UnknownReader | Error::NoReadersAvailable => {
            Err(ReaderError::Disconnected(err.to_string()))
        }
        other => Err(ReaderError::Fatal(other.to_string())),
    }
}
