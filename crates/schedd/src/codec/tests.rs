//! Unit tests for the command codec.

use std::io::{self, Cursor, Read};

use rstest::rstest;

use super::*;

fn bytes_for(records: &[CommandRecord]) -> Vec<u8> {
    let mut buffer = Vec::new();
    for record in records {
        encode_command(&mut buffer, record).expect("encode record");
    }
    buffer
}

#[test]
fn decodes_plain_command() {
    let mut stream = Cursor::new(5_i32.to_be_bytes().to_vec());
    let decoded = decode_command(&mut stream).expect("decode");
    assert_eq!(decoded, Decoded::Record(CommandRecord::new(CommandKind::Cmd)));
}

#[test]
fn decodes_ajob_with_job_id() {
    let mut wire = 12_i32.to_be_bytes().to_vec();
    wire.extend_from_slice(&5_u32.to_be_bytes());
    wire.extend_from_slice(b"1.srv");
    let decoded = decode_command(&mut Cursor::new(wire)).expect("decode");
    assert_eq!(decoded, Decoded::Record(CommandRecord::for_job("1.srv")));
}

#[test]
fn reads_consecutive_records_then_eof() {
    let wire = bytes_for(&[
        CommandRecord::for_job("7.srv"),
        CommandRecord::new(CommandKind::Term),
    ]);
    let mut stream = Cursor::new(wire);
    assert_eq!(
        decode_command(&mut stream).expect("first"),
        Decoded::Record(CommandRecord::for_job("7.srv"))
    );
    assert_eq!(
        decode_command(&mut stream).expect("second"),
        Decoded::Record(CommandRecord::new(CommandKind::Term))
    );
    assert_eq!(decode_command(&mut stream).expect("eof"), Decoded::Eof);
}

#[test]
fn empty_stream_is_clean_eof() {
    let decoded = decode_command(&mut Cursor::new(Vec::new())).expect("decode");
    assert_eq!(decoded, Decoded::Eof);
}

#[rstest]
#[case::partial_code(vec![0, 0])]
#[case::missing_job_id(12_i32.to_be_bytes().to_vec())]
#[case::partial_length({
    let mut wire = 12_i32.to_be_bytes().to_vec();
    wire.extend_from_slice(&[0, 0, 0]);
    wire
})]
#[case::short_job_id({
    let mut wire = 12_i32.to_be_bytes().to_vec();
    wire.extend_from_slice(&9_u32.to_be_bytes());
    wire.extend_from_slice(b"1.s");
    wire
})]
fn truncated_records_are_protocol_errors(#[case] wire: Vec<u8>) {
    let error = decode_command(&mut Cursor::new(wire)).expect_err("should fail");
    assert!(
        matches!(error, CodecError::Truncated { .. }),
        "unexpected error: {error:?}"
    );
}

#[test]
fn oversized_string_is_rejected() {
    let mut wire = 12_i32.to_be_bytes().to_vec();
    wire.extend_from_slice(&u32::MAX.to_be_bytes());
    let error = decode_command(&mut Cursor::new(wire)).expect_err("should fail");
    assert!(matches!(
        error,
        CodecError::InvalidLength {
            length: 4_294_967_295,
            ..
        }
    ));
}

#[rstest]
#[case(6)]
#[case(18)]
#[case(-3)]
fn unknown_codes_are_rejected(#[case] code: i32) {
    let error = decode_command(&mut Cursor::new(code.to_be_bytes().to_vec())).expect_err("fail");
    assert!(matches!(error, CodecError::UnknownCommand { code: seen } if seen == code));
}

#[test]
fn invalid_utf8_job_id_is_rejected() {
    let mut wire = 12_i32.to_be_bytes().to_vec();
    wire.extend_from_slice(&2_u32.to_be_bytes());
    wire.extend_from_slice(&[0xff, 0xfe]);
    let error = decode_command(&mut Cursor::new(wire)).expect_err("should fail");
    assert!(matches!(error, CodecError::InvalidUtf8 { .. }));
}

#[test]
fn cycle_end_marker_is_single_zero() {
    let mut buffer = Vec::new();
    write_cycle_end(&mut buffer).expect("write marker");
    assert_eq!(buffer, vec![0, 0, 0, 0]);
}

struct InterruptOnce {
    inner: Cursor<Vec<u8>>,
    interrupted: bool,
}

impl Read for InterruptOnce {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.interrupted {
            self.interrupted = true;
            return Err(io::Error::from(io::ErrorKind::Interrupted));
        }
        self.inner.read(buf)
    }
}

#[test]
fn interrupted_reads_are_retried() {
    let mut stream = InterruptOnce {
        inner: Cursor::new(3_i32.to_be_bytes().to_vec()),
        interrupted: false,
    };
    let decoded = decode_command(&mut stream).expect("decode");
    assert_eq!(decoded, Decoded::Record(CommandRecord::new(CommandKind::Time)));
}

#[test]
fn would_block_is_recognised() {
    let error = CodecError::Io {
        operation: "reading",
        source: io::Error::from(io::ErrorKind::WouldBlock),
    };
    assert!(error.is_would_block());
    assert!(!CodecError::Truncated { field: "x" }.is_would_block());
}

#[test]
fn registration_exchange_round_trips() {
    let mut request = Vec::new();
    write_registration_request(&mut request, "pbsadmin", "fifo").expect("request");
    assert_eq!(request.get(..4), Some(&70_i32.to_be_bytes()[..]));
    let (user, name) = read_registration_request(&mut Cursor::new(request)).expect("parse");
    assert_eq!(user, "pbsadmin");
    assert_eq!(name, "fifo");

    let mut reply = Vec::new();
    write_registration_reply(&mut reply, &RegistrationReply::rejected(15, "unknown scheduler"))
        .expect("reply");
    let parsed = read_registration_reply(&mut Cursor::new(reply)).expect("parse reply");
    assert!(!parsed.is_accepted());
    assert_eq!(parsed.status, 15);
    assert_eq!(parsed.message, "unknown scheduler");
}

#[test]
fn truncated_reply_is_a_receive_error() {
    let error = read_registration_reply(&mut Cursor::new(vec![0, 0, 0, 0])).expect_err("fail");
    assert!(matches!(
        error,
        HandshakeError::Receive {
            source: CodecError::Truncated { .. }
        }
    ));
}
