//! Registration exchange performed once on the primary socket.

use std::io::{Read, Write};

use thiserror::Error;

use super::{CodecError, read_i32, read_string, write_i32, write_string};

/// Request code naming the scheduler registration operation.
pub(crate) const REGISTER_SCHEDULER_REQUEST: i32 = 70;

const NO_EXTENSION: i32 = 0;

/// Reply envelope returned by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RegistrationReply {
    pub(crate) status: i32,
    pub(crate) aux: i32,
    pub(crate) message: String,
}

impl RegistrationReply {
    #[cfg(test)]
    pub(crate) fn accepted() -> Self {
        Self {
            status: 0,
            aux: 0,
            message: String::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn rejected(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            aux: 0,
            message: message.into(),
        }
    }

    pub(crate) const fn is_accepted(&self) -> bool {
        self.status == 0
    }
}

/// Errors raised while exchanging registration messages.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Sending the request failed.
    #[error("failed to send registration request: {source}")]
    Send {
        /// Underlying codec error.
        #[source]
        source: CodecError,
    },
    /// Reading the reply failed.
    #[error("failed to read registration reply: {source}")]
    Receive {
        /// Underlying codec error.
        #[source]
        source: CodecError,
    },
    /// The peer sent something other than a registration request.
    #[error("unexpected request code {code}")]
    UnexpectedRequest {
        /// Code as received.
        code: i32,
    },
}

pub(crate) fn write_registration_request<W: Write>(
    writer: &mut W,
    user: &str,
    scheduler_name: &str,
) -> Result<(), HandshakeError> {
    let send = |writer: &mut W| -> Result<(), CodecError> {
        write_i32(writer, REGISTER_SCHEDULER_REQUEST)?;
        write_string(writer, user)?;
        write_string(writer, scheduler_name)?;
        write_i32(writer, NO_EXTENSION)?;
        writer
            .flush()
            .map_err(|source| CodecError::io("flushing registration", source))
    };
    send(writer).map_err(|source| HandshakeError::Send { source })
}

pub(crate) fn read_registration_reply<R: Read>(
    reader: &mut R,
) -> Result<RegistrationReply, HandshakeError> {
    let receive = |reader: &mut R| -> Result<RegistrationReply, CodecError> {
        let status = read_i32(reader, "reply status")?;
        let aux = read_i32(reader, "reply auxiliary code")?;
        let message = read_string(reader, "reply message")?;
        Ok(RegistrationReply {
            status,
            aux,
            message,
        })
    };
    receive(reader).map_err(|source| HandshakeError::Receive { source })
}

/// Server half of the exchange; returns the user and scheduler name.
#[cfg(test)]
pub(crate) fn read_registration_request<R: Read>(
    reader: &mut R,
) -> Result<(String, String), HandshakeError> {
    let code = read_i32(reader, "request code").map_err(|source| HandshakeError::Receive { source })?;
    if code != REGISTER_SCHEDULER_REQUEST {
        return Err(HandshakeError::UnexpectedRequest { code });
    }
    let receive = |reader: &mut R| -> Result<(String, String), CodecError> {
        let user = read_string(reader, "user")?;
        let scheduler_name = read_string(reader, "scheduler name")?;
        read_i32(reader, "request extension")?;
        Ok((user, scheduler_name))
    };
    receive(reader).map_err(|source| HandshakeError::Receive { source })
}

/// Server half of the exchange.
#[cfg(test)]
pub(crate) fn write_registration_reply<W: Write>(
    writer: &mut W,
    reply: &RegistrationReply,
) -> Result<(), HandshakeError> {
    let send = |writer: &mut W| -> Result<(), CodecError> {
        write_i32(writer, reply.status)?;
        write_i32(writer, reply.aux)?;
        write_string(writer, &reply.message)?;
        writer
            .flush()
            .map_err(|source| CodecError::io("flushing registration reply", source))
    };
    send(writer).map_err(|source| HandshakeError::Send { source })
}
