//! Multipart JPEG framing.
//!
//! The same framing is read from remote network cameras and written to
//! viewers. One part on the wire:
//!
//! ```text
//! --myboundary\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: <decimal length>\r\n
//! \r\n
//! <payload>\r\n
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use std::io::{self, BufRead, Read, Write};
use thiserror::Error;

/// Boundary line separating parts.
pub const BOUNDARY: &str = "--myboundary";

/// Header line naming the payload type.
pub const CONTENT_TYPE_LINE: &str = "Content-Type: image/jpeg";

/// Label preceding the decimal payload length.
pub const CONTENT_LENGTH_LABEL: &str = "Content-Length: ";

/// Value for the HTTP `Content-Type` header of a multipart response.
pub const RESPONSE_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=--myboundary";

/// Longest header line accepted while reading.
const MAX_LINE_LEN: u64 = 1024;

/// Upper bound on a single payload. Anything larger is treated as a corrupt
/// length field.
const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("stream ended before a boundary line")]
    MissingBoundary,
    #[error("invalid content length {0:?}")]
    InvalidLength(String),
    #[error("short payload: expected {expected} bytes, received {received}")]
    ShortPayload { expected: usize, received: usize },
    #[error("header line longer than {MAX_LINE_LEN} bytes")]
    LineTooLong,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn part_header(len: usize) -> String {
    format!("{BOUNDARY}\r\n{CONTENT_TYPE_LINE}\r\n{CONTENT_LENGTH_LABEL}{len}\r\n\r\n")
}

/// Write one part carrying `payload`.
pub fn write_part<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(part_header(payload.len()).as_bytes())?;
    writer.write_all(payload)?;
    writer.write_all(b"\r\n")
}

/// Encode one part carrying `payload` into a single buffer.
pub fn encode_part(payload: &[u8]) -> Bytes {
    let header = part_header(payload.len());
    let mut buf = BytesMut::with_capacity(header.len() + payload.len() + 2);
    buf.put_slice(header.as_bytes());
    buf.put_slice(payload);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Pulls successive payloads out of a multipart byte stream.
pub struct MjpegReader<R> {
    inner: R,
    line: Vec<u8>,
}

impl<R: BufRead> MjpegReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: Vec::with_capacity(128),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read the next part's payload.
    ///
    /// Everything before the next boundary line is discarded. The two header
    /// lines are expected in their fixed order; only the length digits are
    /// parsed. No payload is returned unless exactly the advertised number of
    /// bytes was read.
    pub fn read_part(&mut self) -> Result<Bytes, ProtocolError> {
        self.skip_to_boundary()?;

        // Content-Type line plus terminator
        self.discard(CONTENT_TYPE_LINE.len() + 2)?;
        self.discard(CONTENT_LENGTH_LABEL.len())?;

        let digits = self.read_line()?;
        let digits = String::from_utf8_lossy(trim_line_end(digits)).trim().to_string();
        let expected: usize = digits
            .parse()
            .map_err(|_| ProtocolError::InvalidLength(digits.clone()))?;
        if expected > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::InvalidLength(digits));
        }

        // Blank separator line
        self.discard(2)?;

        let mut payload = vec![0u8; expected];
        let mut received = 0;
        while received < expected {
            match self.inner.read(&mut payload[received..]) {
                Ok(0) => return Err(ProtocolError::ShortPayload { expected, received }),
                Ok(n) => received += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Bytes::from(payload))
    }

    fn skip_to_boundary(&mut self) -> Result<(), ProtocolError> {
        loop {
            self.line.clear();
            let n = (&mut self.inner)
                .take(MAX_LINE_LEN)
                .read_until(b'\n', &mut self.line)?;
            if n == 0 {
                return Err(ProtocolError::MissingBoundary);
            }
            if trim_line_end(&self.line) == BOUNDARY.as_bytes() {
                return Ok(());
            }
        }
    }

    fn read_line(&mut self) -> Result<&[u8], ProtocolError> {
        self.line.clear();
        let n = (&mut self.inner)
            .take(MAX_LINE_LEN)
            .read_until(b'\n', &mut self.line)?;
        if n as u64 == MAX_LINE_LEN && self.line.last() != Some(&b'\n') {
            return Err(ProtocolError::LineTooLong);
        }
        Ok(&self.line)
    }

    fn discard(&mut self, count: usize) -> Result<(), ProtocolError> {
        let copied = io::copy(&mut (&mut self.inner).take(count as u64), &mut io::sink())?;
        if copied < count as u64 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        Ok(())
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encode_part_layout() {
        let part = encode_part(b"abc");
        assert_eq!(
            &part[..],
            b"--myboundary\r\nContent-Type: image/jpeg\r\nContent-Length: 3\r\n\r\nabc\r\n"
        );
    }

    #[test]
    fn test_write_part_matches_encode_part() {
        let payload = [0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9];
        let mut written = Vec::new();
        write_part(&mut written, &payload).unwrap();
        assert_eq!(written, encode_part(&payload).to_vec());
    }

    #[test]
    fn test_reads_back_written_payload() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let wire = encode_part(&payload);

        let mut reader = MjpegReader::new(Cursor::new(wire.to_vec()));
        let parsed = reader.read_part().unwrap();
        assert_eq!(parsed.len(), payload.len());
        assert_eq!(&parsed[..], &payload[..]);
    }

    #[test]
    fn test_payload_containing_boundary_text() {
        let payload = b"--myboundary\r\ninside";
        let mut wire = encode_part(payload).to_vec();
        wire.extend_from_slice(&encode_part(b"next"));

        let mut reader = MjpegReader::new(Cursor::new(wire));
        assert_eq!(&reader.read_part().unwrap()[..], payload);
        assert_eq!(&reader.read_part().unwrap()[..], b"next");
    }

    #[test]
    fn test_skips_preamble_and_reads_consecutive_parts() {
        let mut wire = b"HTTP junk\r\nmore junk\r\n".to_vec();
        wire.extend_from_slice(&encode_part(b"first"));
        wire.extend_from_slice(&encode_part(b"second"));

        let mut reader = MjpegReader::new(Cursor::new(wire));
        assert_eq!(&reader.read_part().unwrap()[..], b"first");
        assert_eq!(&reader.read_part().unwrap()[..], b"second");
        assert!(matches!(
            reader.read_part(),
            Err(ProtocolError::MissingBoundary)
        ));
    }

    #[test]
    fn test_non_numeric_length() {
        let wire = b"--myboundary\r\nContent-Type: image/jpeg\r\nContent-Length: 12x\r\n\r\n".to_vec();
        let mut reader = MjpegReader::new(Cursor::new(wire));
        assert!(matches!(
            reader.read_part(),
            Err(ProtocolError::InvalidLength(s)) if s == "12x"
        ));
    }

    #[test]
    fn test_short_payload() {
        let wire = b"--myboundary\r\nContent-Type: image/jpeg\r\nContent-Length: 10\r\n\r\nabcd".to_vec();
        let mut reader = MjpegReader::new(Cursor::new(wire));
        match reader.read_part() {
            Err(ProtocolError::ShortPayload { expected, received }) => {
                assert_eq!(expected, 10);
                assert_eq!(received, 4);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_empty_stream() {
        let mut reader = MjpegReader::new(Cursor::new(Vec::new()));
        assert!(matches!(
            reader.read_part(),
            Err(ProtocolError::MissingBoundary)
        ));
    }

    #[test]
    fn test_length_line_too_long() {
        let mut wire = b"--myboundary\r\nContent-Type: image/jpeg\r\nContent-Length: ".to_vec();
        wire.extend(std::iter::repeat(b'1').take(2000));
        let mut reader = MjpegReader::new(Cursor::new(wire));
        assert!(matches!(reader.read_part(), Err(ProtocolError::LineTooLong)));
    }
}
