//! Ordered buffer of commands awaiting dispatch, and the socket reader that
//! fills it.

use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::net::TcpStream;

use thiserror::Error;
use tracing::debug;

use crate::codec::{CodecError, Decoded, MAX_STRING_LEN, decode_command};
use crate::command::{Command, CommandKind, Origin};
use crate::registry::ServerConnection;

const QUEUE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::queue");

/// FIFO of commands awaiting a cycle.
#[derive(Debug, Default)]
pub struct CommandQueue {
    pending: VecDeque<Command>,
}

impl CommandQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a command.
    pub fn enqueue(&mut self, command: Command) {
        self.pending.push_back(command);
    }

    /// Places a command ahead of everything already queued.
    pub fn enqueue_front(&mut self, command: Command) {
        self.pending.push_front(command);
    }

    /// Removes the oldest command.
    pub fn dequeue(&mut self) -> Option<Command> {
        self.pending.pop_front()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of queued commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Discards every queued command, returning how many were dropped.
    pub fn drain(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Iterates the queued commands oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.pending.iter()
    }
}

/// Errors raised while reading commands off a secondary socket.
///
/// Each of these means the connection must be rebuilt.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The server closed the connection.
    #[error("server closed the command connection")]
    Closed,
    /// A record was malformed or the socket failed mid-read.
    #[error("failed to decode command: {source}")]
    Decode {
        /// Underlying codec error.
        #[source]
        source: CodecError,
    },
    /// Switching the socket mode or peeking failed.
    #[error("command socket error: {source}")]
    Socket {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

enum LookAhead {
    Nothing,
    Discarded(Command),
    Closed,
}

/// Reads the command a readiness event announced, then looks ahead once.
///
/// The first record is read blocking. A second record already buffered in
/// full behind it is read and discarded: the cycle for the first command
/// sees the current server state anyway. A partial second record is left on
/// the socket for the next readiness event. If the look-ahead finds the peer gone, the
/// first command is dropped too and the connection reported closed.
pub fn read_one_or_more(
    connection: &mut ServerConnection,
    queue: &mut CommandQueue,
) -> Result<(), ReadError> {
    let origin = Origin::Server(connection.id());
    let stream = connection.secondary_mut();
    let record = match decode_command(stream) {
        Ok(Decoded::Record(record)) => record,
        Ok(Decoded::Eof) => return Err(ReadError::Closed),
        Err(source) => return Err(ReadError::Decode { source }),
    };
    let command = Command::from_record(record, origin);

    match look_ahead(stream, origin)? {
        LookAhead::Nothing => {}
        LookAhead::Discarded(extra) => {
            debug!(
                target: QUEUE_TARGET,
                origin = ?origin,
                command = %extra.kind(),
                job_id = extra.job_id().unwrap_or_default(),
                "discarded look-ahead command"
            );
        }
        LookAhead::Closed => return Err(ReadError::Closed),
    }

    queue.enqueue(command);
    Ok(())
}

fn look_ahead(stream: &mut TcpStream, origin: Origin) -> Result<LookAhead, ReadError> {
    stream
        .set_nonblocking(true)
        .map_err(|source| ReadError::Socket { source })?;
    let buffered = buffered_record(stream);
    stream
        .set_nonblocking(false)
        .map_err(|source| ReadError::Socket { source })?;

    match buffered.map_err(|source| ReadError::Socket { source })? {
        Buffered::Incomplete => Ok(LookAhead::Nothing),
        Buffered::Closed => Ok(LookAhead::Closed),
        Buffered::Complete => match decode_command(stream) {
            Ok(Decoded::Record(record)) => {
                Ok(LookAhead::Discarded(Command::from_record(record, origin)))
            }
            Ok(Decoded::Eof) => Ok(LookAhead::Closed),
            Err(source) => Err(ReadError::Decode { source }),
        },
    }
}

enum Buffered {
    Incomplete,
    Complete,
    Closed,
}

const CODE_LEN: usize = 4;
const JOB_HEADER_LEN: usize = 8;

/// Peeks at the receive buffer of a non-blocking socket to tell whether a
/// whole record is waiting, so decoding it cannot block.
///
/// A record whose header is already invalid counts as complete: decoding it
/// fails without waiting for more bytes.
fn buffered_record(stream: &TcpStream) -> io::Result<Buffered> {
    let mut header = [0_u8; JOB_HEADER_LEN];
    let available = match peek(stream, &mut header)? {
        Some(0) => return Ok(Buffered::Closed),
        Some(available) => available,
        None => return Ok(Buffered::Incomplete),
    };
    if available < CODE_LEN {
        return Ok(Buffered::Incomplete);
    }
    let [c0, c1, c2, c3, l0, l1, l2, l3] = header;
    let carries_job_id = CommandKind::from_code(i32::from_be_bytes([c0, c1, c2, c3]))
        .is_some_and(CommandKind::carries_job_id);
    if !carries_job_id {
        return Ok(Buffered::Complete);
    }
    if available < JOB_HEADER_LEN {
        return Ok(Buffered::Incomplete);
    }
    let Some(length) = usize::try_from(u32::from_be_bytes([l0, l1, l2, l3]))
        .ok()
        .filter(|length| *length <= MAX_STRING_LEN)
    else {
        return Ok(Buffered::Complete);
    };
    let needed = JOB_HEADER_LEN + length;
    let mut record = vec![0_u8; needed];
    match peek(stream, &mut record)? {
        Some(peeked) if peeked >= needed => Ok(Buffered::Complete),
        _ => Ok(Buffered::Incomplete),
    }
}

/// Peeks without consuming. `None` means nothing is buffered yet.
fn peek(stream: &TcpStream, buf: &mut [u8]) -> io::Result<Option<usize>> {
    match stream.peek(buf) {
        Ok(read) => Ok(Some(read)),
        Err(error) if matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
            Ok(None)
        }
        Err(error) => Err(error),
    }
}
