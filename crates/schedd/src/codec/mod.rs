//! Byte-level codec for the scheduler command channel.
//!
//! Integers travel as 32-bit big-endian two's complement values. Strings are
//! a 32-bit big-endian byte count followed by UTF-8 text. A command record is
//! the command code, followed by the job id only when the code is
//! [`CommandKind::Ajob`]. After each cycle the scheduler answers with a single
//! zero integer.
//!
//! Decoding tells a clean end of stream, where the peer closed the connection
//! between records, apart from a record cut short or malformed. Callers
//! reconnect in both cases but only the latter is a protocol fault.

mod handshake;

use std::io::{self, Read, Write};
use std::str::Utf8Error;

use thiserror::Error;

use crate::command::{CommandKind, CommandRecord};

pub use handshake::HandshakeError;
pub(crate) use handshake::{RegistrationReply, read_registration_reply, write_registration_request};
#[cfg(test)]
pub(crate) use handshake::{read_registration_request, write_registration_reply};

/// Largest string the codec accepts.
pub const MAX_STRING_LEN: usize = 64 * 1024;

/// Value written after every completed cycle.
pub const CYCLE_END_MARKER: i32 = 0;

/// Outcome of reading one record from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete record.
    Record(CommandRecord),
    /// The peer closed the stream on a record boundary.
    Eof,
}

/// Errors raised while encoding or decoding records.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The underlying stream failed.
    #[error("stream error while {operation}: {source}")]
    Io {
        /// What the codec was doing.
        operation: &'static str,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The stream ended part way through a record.
    #[error("stream closed mid-record while reading {field}")]
    Truncated {
        /// Field being read when the stream ended.
        field: &'static str,
    },
    /// A string length was negative or over [`MAX_STRING_LEN`].
    #[error("invalid string length {length} for {field}")]
    InvalidLength {
        /// Field being read.
        field: &'static str,
        /// Length as received.
        length: i64,
    },
    /// The command code is not one the scheduler understands.
    #[error("unknown command code {code}")]
    UnknownCommand {
        /// Code as received.
        code: i32,
    },
    /// String bytes were not UTF-8.
    #[error("{field} is not valid UTF-8: {source}")]
    InvalidUtf8 {
        /// Field being read.
        field: &'static str,
        /// Underlying conversion error.
        #[source]
        source: Utf8Error,
    },
}

impl CodecError {
    /// Whether the failure is a non-blocking read finding no data.
    #[must_use]
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::WouldBlock)
    }

    fn io(operation: &'static str, source: io::Error) -> Self {
        Self::Io { operation, source }
    }
}

/// Reads one command record.
///
/// Returns [`Decoded::Eof`] when the stream ends before the first byte of a
/// record. Any later end of stream is [`CodecError::Truncated`].
pub fn decode_command<R: Read>(reader: &mut R) -> Result<Decoded, CodecError> {
    let mut code_bytes = [0_u8; 4];
    if !fill_or_eof(reader, &mut code_bytes, "command code")? {
        return Ok(Decoded::Eof);
    }
    let code = i32::from_be_bytes(code_bytes);
    let kind = CommandKind::from_code(code).ok_or(CodecError::UnknownCommand { code })?;
    let job_id = if kind.carries_job_id() {
        Some(read_string(reader, "job id")?)
    } else {
        None
    };
    Ok(Decoded::Record(CommandRecord { kind, job_id }))
}

/// Writes one command record. Used by test servers and tooling.
pub fn encode_command<W: Write>(writer: &mut W, record: &CommandRecord) -> Result<(), CodecError> {
    write_i32(writer, record.kind.code())?;
    if record.kind.carries_job_id() {
        write_string(writer, record.job_id.as_deref().unwrap_or_default())?;
    }
    writer
        .flush()
        .map_err(|source| CodecError::io("flushing command", source))
}

/// Writes the cycle completion marker and flushes.
pub fn write_cycle_end<W: Write>(writer: &mut W) -> Result<(), CodecError> {
    write_i32(writer, CYCLE_END_MARKER)?;
    writer
        .flush()
        .map_err(|source| CodecError::io("flushing cycle marker", source))
}

pub(crate) fn read_i32<R: Read>(reader: &mut R, field: &'static str) -> Result<i32, CodecError> {
    let mut bytes = [0_u8; 4];
    if fill_or_eof(reader, &mut bytes, field)? {
        Ok(i32::from_be_bytes(bytes))
    } else {
        Err(CodecError::Truncated { field })
    }
}

pub(crate) fn read_string<R: Read>(
    reader: &mut R,
    field: &'static str,
) -> Result<String, CodecError> {
    let mut len_bytes = [0_u8; 4];
    if !fill_or_eof(reader, &mut len_bytes, field)? {
        return Err(CodecError::Truncated { field });
    }
    let raw_length = u32::from_be_bytes(len_bytes);
    let length = usize::try_from(raw_length)
        .ok()
        .filter(|len| *len <= MAX_STRING_LEN)
        .ok_or(CodecError::InvalidLength {
            field,
            length: i64::from(raw_length),
        })?;
    let mut bytes = vec![0_u8; length];
    if length > 0 && !fill_or_eof(reader, &mut bytes, field)? {
        return Err(CodecError::Truncated { field });
    }
    String::from_utf8(bytes).map_err(|error| CodecError::InvalidUtf8 {
        field,
        source: error.utf8_error(),
    })
}

pub(crate) fn write_i32<W: Write>(writer: &mut W, value: i32) -> Result<(), CodecError> {
    writer
        .write_all(&value.to_be_bytes())
        .map_err(|source| CodecError::io("writing integer", source))
}

pub(crate) fn write_string<W: Write>(writer: &mut W, value: &str) -> Result<(), CodecError> {
    let length = u32::try_from(value.len())
        .ok()
        .filter(|_| value.len() <= MAX_STRING_LEN)
        .ok_or_else(|| CodecError::InvalidLength {
            field: "outgoing string",
            length: i64::try_from(value.len()).unwrap_or(i64::MAX),
        })?;
    writer
        .write_all(&length.to_be_bytes())
        .and_then(|()| writer.write_all(value.as_bytes()))
        .map_err(|source| CodecError::io("writing string", source))
}

/// Fills `buf` completely.
///
/// Returns `Ok(false)` if the stream ended before any byte arrived and
/// [`CodecError::Truncated`] if it ended part way through.
fn fill_or_eof<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    field: &'static str,
) -> Result<bool, CodecError> {
    let mut filled = 0;
    while let Some(rest) = buf.get_mut(filled..).filter(|rest| !rest.is_empty()) {
        match reader.read(rest) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(CodecError::Truncated { field }),
            Ok(read) => filled += read,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(source) => return Err(CodecError::io("reading", source)),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests;
