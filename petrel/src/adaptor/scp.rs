//! Interactive copy-receiver byte protocol.
//!
//! Wire format (upload direction, remote runs `scp -t`): every control line
//! is answered with a single response byte: `0` ok, `1` error, `2` fatal
//! error, the latter two followed by a newline-terminated message. The
//! sender transmits an optional `T<mtime> 0 <atime> 0` line, then
//! `C0644 <size> <basename>`, then exactly `<size>` raw bytes and a single
//! `0x00` terminator, reading an acknowledgement after each step. Download
//! (remote runs `scp -f`) mirrors it: the receiver sends `0x00` to start,
//! parses the `C`-prefixed header, streams the declared byte count, consumes
//! the trailing acknowledgement and sends a `0x00` continuation.
//!
//! The implementation is a pure state machine over [`Read`]/[`Write`] so a
//! mock byte stream exercises every handshake position without a live
//! remote endpoint. It must stay bit-exact: the peer is an unmodified
//! remote copy utility.

use std::io::{Read, Write};

use crate::adaptor::AdaptorError;

const ACK_OK: u8 = 0;
const ACK_ERROR: u8 = 1;
const ACK_FATAL: u8 = 2;

/// Transfer buffer size, matching the remote utility's chunking.
const CHUNK: usize = 1024;

/// Position in the transfer handshake, used to label protocol failures.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandshakeStep {
    /// Initial acknowledgement after opening the receiver.
    Connect,
    /// After the `T` modification-time line.
    Timestamp,
    /// After the `C` file header (or while expecting one).
    Header,
    /// After the file bytes and `0x00` terminator.
    Payload,
}

impl std::fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HandshakeStep::Connect => "connect",
            HandshakeStep::Timestamp => "timestamp",
            HandshakeStep::Header => "header",
            HandshakeStep::Payload => "payload",
        };
        f.write_str(name)
    }
}

/// Header of a received file.
#[derive(Clone, Debug)]
pub struct ReceivedFile {
    pub name: String,
    pub size: u64,
    pub mode: String,
}

fn protocol(step: HandshakeStep, reason: impl Into<String>) -> AdaptorError {
    AdaptorError::Protocol {
        step,
        reason: reason.into(),
    }
}

/// Read one response byte. `None` means the stream ended. Error bytes
/// consume their trailing message line and become protocol errors.
fn read_marker<R: Read>(remote: &mut R, step: HandshakeStep) -> Result<Option<u8>, AdaptorError> {
    let mut byte = [0u8; 1];
    if remote.read(&mut byte)? == 0 {
        return Ok(None);
    }
    match byte[0] {
        ACK_ERROR | ACK_FATAL => {
            let message = read_line(remote)?;
            let severity = if byte[0] == ACK_FATAL {
                "fatal error"
            } else {
                "error"
            };
            Err(protocol(
                step,
                format!("remote {severity}: {}", message.trim_end()),
            ))
        }
        value => Ok(Some(value)),
    }
}

fn read_response<R: Read>(remote: &mut R, step: HandshakeStep) -> Result<u8, AdaptorError> {
    read_marker(remote, step)?.ok_or_else(|| protocol(step, "stream closed"))
}

fn read_ack<R: Read>(remote: &mut R, step: HandshakeStep) -> Result<(), AdaptorError> {
    match read_response(remote, step)? {
        ACK_OK => Ok(()),
        other => Err(protocol(
            step,
            format!("unexpected response byte {other:#04x}"),
        )),
    }
}

fn read_line<R: Read>(remote: &mut R) -> Result<String, AdaptorError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if remote.read(&mut byte)? == 0 || byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// `"0644 <size> <name>"` with the leading `C` already consumed.
fn parse_header(header: &str) -> Result<(String, u64, String), AdaptorError> {
    let malformed = || protocol(HandshakeStep::Header, format!("malformed header {header:?}"));
    let (mode, rest) = header.split_once(' ').ok_or_else(malformed)?;
    let (size, name) = rest.split_once(' ').ok_or_else(malformed)?;
    let size: u64 = size.parse().map_err(|_| malformed())?;
    if name.is_empty() {
        return Err(malformed());
    }
    Ok((mode.to_string(), size, name.to_string()))
}

fn copy_exact<R: Read, W: Write>(
    from: &mut R,
    to: &mut W,
    size: u64,
) -> Result<(), AdaptorError> {
    let mut remaining = size;
    let mut buf = [0u8; CHUNK];
    while remaining > 0 {
        let want = remaining.min(CHUNK as u64) as usize;
        let read = from.read(&mut buf[..want])?;
        if read == 0 {
            return Err(protocol(
                HandshakeStep::Payload,
                format!("stream ended {remaining} bytes short of the declared size"),
            ));
        }
        to.write_all(&buf[..read])?;
        remaining -= read as u64;
    }
    Ok(())
}

/// Drive a remote copy receiver (`scp -p -t <path>`) through one upload.
///
/// `size` is the byte count declared in the header; the source must yield
/// exactly that many bytes. Any non-zero acknowledgement aborts before
/// further bytes are written.
pub fn send_file<S: Read, T: Read + Write>(
    source: &mut S,
    size: u64,
    basename: &str,
    mtime_secs: Option<u64>,
    remote: &mut T,
) -> Result<(), AdaptorError> {
    read_ack(remote, HandshakeStep::Connect)?;

    if let Some(mtime) = mtime_secs {
        // The access time is not tracked locally; the modification time
        // stands in for both fields.
        remote.write_all(format!("T{mtime} 0 {mtime} 0\n").as_bytes())?;
        remote.flush()?;
        read_ack(remote, HandshakeStep::Timestamp)?;
    }

    remote.write_all(format!("C0644 {size} {basename}\n").as_bytes())?;
    remote.flush()?;
    read_ack(remote, HandshakeStep::Header)?;

    copy_exact(source, remote, size)?;
    remote.write_all(&[ACK_OK])?;
    remote.flush()?;
    read_ack(remote, HandshakeStep::Payload)?;
    Ok(())
}

/// Drive a remote copy source (`scp -f <path>`) through one download,
/// streaming the declared byte count into `sink`.
pub fn receive_file<T: Read + Write, S: Write>(
    remote: &mut T,
    sink: &mut S,
) -> Result<ReceivedFile, AdaptorError> {
    remote.write_all(&[ACK_OK])?;
    remote.flush()?;

    let marker = read_response(remote, HandshakeStep::Header)?;
    if marker != b'C' {
        return Err(protocol(
            HandshakeStep::Header,
            format!("expected file header, got byte {marker:#04x}"),
        ));
    }
    let header = read_line(remote)?;
    let (mode, size, name) = parse_header(&header)?;

    remote.write_all(&[ACK_OK])?;
    remote.flush()?;

    copy_exact(remote, sink, size)?;
    read_ack(remote, HandshakeStep::Payload)?;

    // Continuation byte releases the source for its next header or EOF.
    remote.write_all(&[ACK_OK])?;
    remote.flush()?;

    Ok(ReceivedFile { name, size, mode })
}

/// Splice a copy source (`scp -f`) into a copy receiver (`scp -t`) without
/// buffering whole files, for resource-to-resource transfers. Returns the
/// number of files relayed. `ignore_empty` permits zero-byte files; when
/// false they abort the transfer.
pub fn relay<A: Read + Write, B: Read + Write>(
    source: &mut A,
    dest: &mut B,
    ignore_empty: bool,
) -> Result<u64, AdaptorError> {
    read_ack(dest, HandshakeStep::Connect)?;
    source.write_all(&[ACK_OK])?;
    source.flush()?;

    let mut relayed = 0u64;
    loop {
        let Some(marker) = read_marker(source, HandshakeStep::Header)? else {
            break;
        };
        if marker == b'E' {
            break;
        }
        if marker != b'C' {
            return Err(protocol(
                HandshakeStep::Header,
                format!("unexpected directive byte {marker:#04x}"),
            ));
        }
        let header = read_line(source)?;
        let (mode, size, name) = parse_header(&header)?;
        if size == 0 {
            if !ignore_empty {
                return Err(protocol(
                    HandshakeStep::Header,
                    format!("refusing to relay empty file {name}"),
                ));
            }
            tracing::warn!(file = %name, "relaying zero-byte file");
        }

        dest.write_all(format!("C{mode} {size} {name}\n").as_bytes())?;
        dest.flush()?;
        read_ack(dest, HandshakeStep::Header)?;

        source.write_all(&[ACK_OK])?;
        source.flush()?;
        copy_exact(source, dest, size)?;

        dest.write_all(&[ACK_OK])?;
        dest.flush()?;
        read_ack(dest, HandshakeStep::Payload)?;
        read_ack(source, HandshakeStep::Payload)?;
        source.write_all(&[ACK_OK])?;
        source.flush()?;
        relayed += 1;
    }
    Ok(relayed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Byte-level stand-in for an exec channel: reads are served from a
    /// script, writes are captured.
    struct MockChannel {
        incoming: Cursor<Vec<u8>>,
        outgoing: Vec<u8>,
    }

    impl MockChannel {
        fn new(incoming: Vec<u8>) -> Self {
            Self {
                incoming: Cursor::new(incoming),
                outgoing: Vec::new(),
            }
        }
    }

    impl Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.incoming.read(buf)
        }
    }

    impl Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outgoing.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    const CONTENT: &[u8] = b"science gateway payload";

    fn upload(acks: Vec<u8>, mtime: Option<u64>) -> (Result<(), AdaptorError>, Vec<u8>) {
        let mut source = Cursor::new(CONTENT.to_vec());
        let mut channel = MockChannel::new(acks);
        let result = send_file(
            &mut source,
            CONTENT.len() as u64,
            "input.dat",
            mtime,
            &mut channel,
        );
        (result, channel.outgoing)
    }

    #[test]
    fn test_upload_wire_format() {
        let (result, wire) = upload(vec![0, 0, 0, 0], Some(1394150280));
        result.unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(b"T1394150280 0 1394150280 0\n");
        expected.extend_from_slice(format!("C0644 {} input.dat\n", CONTENT.len()).as_bytes());
        expected.extend_from_slice(CONTENT);
        expected.push(0);
        assert_eq!(wire, expected);
    }

    #[test]
    fn test_upload_without_timestamp_skips_t_line() {
        let (result, wire) = upload(vec![0, 0, 0], None);
        result.unwrap();
        assert!(wire.starts_with(b"C0644 "));
    }

    #[test]
    fn test_round_trip_preserves_bytes_and_size() {
        let (result, wire) = upload(vec![0, 0, 0], None);
        result.unwrap();

        // What the sender produced (header, payload, terminator) is exactly
        // what a copy source emits; the terminator doubles as the trailing
        // acknowledgement.
        let mut channel = MockChannel::new(wire);
        let mut sink = Vec::new();
        let received = receive_file(&mut channel, &mut sink).unwrap();

        assert_eq!(sink, CONTENT);
        assert_eq!(received.size, CONTENT.len() as u64);
        assert_eq!(received.name, "input.dat");
        assert_eq!(received.mode, "0644");
        // Initial go-ahead, header ack, continuation.
        assert_eq!(channel.outgoing, vec![0, 0, 0]);
    }

    #[test]
    fn test_error_ack_aborts_at_each_handshake_step() {
        let failure = |position: usize| {
            let mut acks = vec![0u8; position];
            acks.extend_from_slice(b"\x01scp: permission denied\n");
            acks
        };

        for (position, step) in [
            (0, HandshakeStep::Connect),
            (1, HandshakeStep::Timestamp),
            (2, HandshakeStep::Header),
            (3, HandshakeStep::Payload),
        ] {
            let (result, wire) = upload(failure(position), Some(1));
            match result {
                Err(AdaptorError::Protocol { step: got, reason }) => {
                    assert_eq!(got, step, "failure injected at position {position}");
                    assert!(reason.contains("permission denied"));
                }
                other => panic!("expected protocol error at {step}, got {other:?}"),
            }
            // Nothing may be written past the failed step.
            match step {
                HandshakeStep::Connect => assert!(wire.is_empty()),
                HandshakeStep::Timestamp => assert!(wire.ends_with(b" 0\n")),
                HandshakeStep::Header => assert!(wire.ends_with(b"input.dat\n")),
                HandshakeStep::Payload => assert!(wire.ends_with(&[0])),
            }
        }
    }

    #[test]
    fn test_fatal_ack_reports_message() {
        let mut acks = vec![0u8, 0];
        acks.extend_from_slice(b"\x02scp: disk full\n");
        let (result, _) = upload(acks, None);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("fatal error"));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_download_rejects_malformed_header() {
        let mut channel = MockChannel::new(b"Cgarbage-without-fields\n".to_vec());
        let mut sink = Vec::new();
        let err = receive_file(&mut channel, &mut sink).unwrap_err();
        assert!(matches!(
            err,
            AdaptorError::Protocol {
                step: HandshakeStep::Header,
                ..
            }
        ));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_download_short_stream_is_protocol_error() {
        let mut incoming = b"C0644 100 truncated.dat\n".to_vec();
        incoming.extend_from_slice(b"only a few bytes");
        let mut channel = MockChannel::new(incoming);
        let mut sink = Vec::new();
        let err = receive_file(&mut channel, &mut sink).unwrap_err();
        assert!(matches!(
            err,
            AdaptorError::Protocol {
                step: HandshakeStep::Payload,
                ..
            }
        ));
    }

    #[test]
    fn test_source_shorter_than_declared_size_aborts() {
        let mut source = Cursor::new(b"short".to_vec());
        let mut channel = MockChannel::new(vec![0, 0, 0]);
        let err = send_file(&mut source, 1024, "f.dat", None, &mut channel).unwrap_err();
        assert!(matches!(
            err,
            AdaptorError::Protocol {
                step: HandshakeStep::Payload,
                ..
            }
        ));
    }

    #[test]
    fn test_relay_splices_source_into_dest() {
        // Source side: header, payload, trailing ack; then EOF.
        let mut source_bytes = format!("C0644 {} relayed.dat\n", CONTENT.len()).into_bytes();
        source_bytes.extend_from_slice(CONTENT);
        source_bytes.push(0);
        let mut source = MockChannel::new(source_bytes);
        // Dest side acks: connect, header, payload.
        let mut dest = MockChannel::new(vec![0, 0, 0]);

        let relayed = relay(&mut source, &mut dest, false).unwrap();
        assert_eq!(relayed, 1);

        let mut expected = format!("C0644 {} relayed.dat\n", CONTENT.len()).into_bytes();
        expected.extend_from_slice(CONTENT);
        expected.push(0);
        assert_eq!(dest.outgoing, expected);
        // Source got the initial go-ahead, the post-header release, and the
        // continuation byte.
        assert_eq!(source.outgoing, vec![0, 0, 0]);
    }

    #[test]
    fn test_relay_refuses_empty_file_unless_permitted() {
        let source_bytes = b"C0644 0 empty.dat\n\x00".to_vec();
        let mut source = MockChannel::new(source_bytes.clone());
        let mut dest = MockChannel::new(vec![0, 0, 0]);
        let err = relay(&mut source, &mut dest, false).unwrap_err();
        assert!(err.to_string().contains("empty.dat"));

        let mut source = MockChannel::new(source_bytes);
        let mut dest = MockChannel::new(vec![0, 0, 0]);
        assert_eq!(relay(&mut source, &mut dest, true).unwrap(), 1);
    }
}
