//! Packet framing over a byte stream.
//!
//! A logical packet is a sequence of frames; every frame but the last has
//! a payload of exactly [`MAX_PACKET_SIZE`] bytes. A payload whose length
//! is an exact multiple of the maximum is terminated by an empty frame.

use std::io::{self, Read, Write};

use mariadb_core::error::{ConnectionError, ConnectionErrorKind, Error, Result};

use crate::protocol::{MAX_PACKET_SIZE, PacketHeader};

/// Default `max_allowed_packet` until the session reports its own.
pub const DEFAULT_MAX_ALLOWED_PACKET: usize = 16 * 1024 * 1024;

/// Frame reader/writer owning the stream and the sequence counter.
#[derive(Debug)]
pub struct PacketIo<S> {
    stream: S,
    sequence: u8,
    max_allowed_packet: usize,
    trace: bool,
    max_trace_bytes: usize,
    /// Scratch buffer for outgoing frames
    out: Vec<u8>,
}

impl<S: Read + Write> PacketIo<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            sequence: 0,
            max_allowed_packet: DEFAULT_MAX_ALLOWED_PACKET,
            trace: false,
            max_trace_bytes: 1024,
            out: Vec::new(),
        }
    }

    /// Enable hex tracing of every frame, truncated to `max_bytes`.
    pub fn with_trace(mut self, enabled: bool, max_bytes: usize) -> Self {
        self.trace = enabled;
        self.max_trace_bytes = max_bytes;
        self
    }

    pub fn set_max_allowed_packet(&mut self, max: usize) {
        self.max_allowed_packet = max;
    }

    pub fn max_allowed_packet(&self) -> usize {
        self.max_allowed_packet
    }

    /// Start a new exchange: the next frame written carries sequence 0.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Replace the underlying stream (TLS upgrade), keeping the sequence.
    pub fn map_stream<T, F>(self, f: F) -> Result<PacketIo<T>>
    where
        T: Read + Write,
        F: FnOnce(S) -> Result<T>,
    {
        Ok(PacketIo {
            stream: f(self.stream)?,
            sequence: self.sequence,
            max_allowed_packet: self.max_allowed_packet,
            trace: self.trace,
            max_trace_bytes: self.max_trace_bytes,
            out: self.out,
        })
    }

    /// Read one logical packet into a freshly allocated buffer.
    pub fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        self.read_packet_into(&mut payload)?;
        Ok(payload)
    }

    /// Read one logical packet, reusing `payload`'s allocation.
    pub fn read_packet_into(&mut self, payload: &mut Vec<u8>) -> Result<()> {
        payload.clear();
        loop {
            let mut header_bytes = [0u8; PacketHeader::SIZE];
            self.fill(&mut header_bytes, payload.len())?;
            let header = PacketHeader::from_bytes(&header_bytes);
            self.sequence = header.sequence_id.wrapping_add(1);

            let frame_len = header.payload_length as usize;
            let start = payload.len();
            payload.resize(start + frame_len, 0);
            self.fill(&mut payload[start..], start)?;

            if self.trace {
                trace_frame("recv", header.sequence_id, &payload[start..], self.max_trace_bytes);
            }
            if frame_len < MAX_PACKET_SIZE {
                return Ok(());
            }
        }
    }

    /// Write one logical packet, fragmenting it into frames.
    ///
    /// Payloads larger than `max_allowed_packet` are rejected before any
    /// byte reaches the stream.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_allowed_packet {
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::PacketTooLarge,
                message: format!(
                    "packet of {} bytes exceeds max_allowed_packet ({} bytes)",
                    payload.len(),
                    self.max_allowed_packet
                ),
                source: None,
            }));
        }

        let mut offset = 0;
        loop {
            let chunk_len = (payload.len() - offset).min(MAX_PACKET_SIZE);
            let chunk = &payload[offset..offset + chunk_len];
            let header = PacketHeader {
                payload_length: chunk_len as u32,
                sequence_id: self.sequence,
            };
            self.out.clear();
            self.out.extend_from_slice(&header.to_bytes());
            self.out.extend_from_slice(chunk);
            if self.trace {
                trace_frame("send", self.sequence, chunk, self.max_trace_bytes);
            }
            self.stream.write_all(&self.out).map_err(io_error)?;
            self.sequence = self.sequence.wrapping_add(1);

            offset += chunk_len;
            if chunk_len < MAX_PACKET_SIZE {
                break;
            }
        }
        self.out.clear();
        if self.out.capacity() > 64 * 1024 {
            self.out.shrink_to(64 * 1024);
        }
        Ok(())
    }

    /// Start a new exchange and write a command payload.
    pub fn write_command(&mut self, payload: &[u8]) -> Result<()> {
        self.reset_sequence();
        self.write_packet(payload)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.stream.flush().map_err(io_error)
    }

    fn fill(&mut self, buf: &mut [u8], packet_bytes_read: usize) -> Result<()> {
        let mut read = 0;
        while read < buf.len() {
            match self.stream.read(&mut buf[read..]) {
                Ok(0) => {
                    return Err(Error::Connection(ConnectionError {
                        kind: ConnectionErrorKind::Disconnected,
                        message: format!(
                            "unexpected end of stream, read {} bytes of packet ({} of {} in current chunk)",
                            packet_bytes_read + read,
                            read,
                            buf.len()
                        ),
                        source: Some(Box::new(io::Error::from(io::ErrorKind::UnexpectedEof))),
                    }));
                }
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(io_error(e)),
            }
        }
        Ok(())
    }
}

/// Map a socket error into the transient connection error class.
pub fn io_error(e: io::Error) -> Error {
    let kind = match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ConnectionErrorKind::Timeout,
        _ => ConnectionErrorKind::Disconnected,
    };
    Error::Connection(ConnectionError {
        kind,
        message: format!("socket error: {}", e),
        source: Some(Box::new(e)),
    })
}

fn trace_frame(direction: &str, sequence: u8, payload: &[u8], max_bytes: usize) {
    tracing::trace!(
        sequence,
        len = payload.len(),
        "{} {}",
        direction,
        hex_excerpt(payload, max_bytes)
    );
}

/// Hex of at most `max_bytes` of `payload`, marked with `…` when cut.
fn hex_excerpt(payload: &[u8], max_bytes: usize) -> String {
    let shown = payload.len().min(max_bytes);
    let mut text = hex::encode(&payload[..shown]);
    if shown < payload.len() {
        text.push('…');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// In-memory stream: reads from `input`, collects writes in `output`.
    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Duplex {
        fn new(input: Vec<u8>) -> Self {
            Self {
                input: Cursor::new(input),
                output: Vec::new(),
            }
        }
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn roundtrip(len: usize) {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut writer = PacketIo::new(Duplex::new(Vec::new()));
        writer.set_max_allowed_packet(usize::MAX);
        writer.write_command(&payload).unwrap();
        let wire = writer.into_inner().output;

        let mut reader = PacketIo::new(Duplex::new(wire));
        let mut buf = Vec::new();
        reader.read_packet_into(&mut buf).unwrap();
        assert_eq!(buf.len(), len);
        assert!(buf == payload);
    }

    #[test]
    fn test_small_and_empty_payloads() {
        roundtrip(0);
        roundtrip(1);
        roundtrip(1000);
    }

    #[test]
    fn test_multi_frame_payloads() {
        roundtrip(MAX_PACKET_SIZE - 1);
        roundtrip(MAX_PACKET_SIZE);
        roundtrip(MAX_PACKET_SIZE + 1);
        roundtrip(2 * MAX_PACKET_SIZE + 10);
    }

    #[test]
    fn test_exact_multiple_gets_empty_terminator() {
        let payload = vec![7u8; MAX_PACKET_SIZE];
        let mut io = PacketIo::new(Duplex::new(Vec::new()));
        io.set_max_allowed_packet(usize::MAX);
        io.write_command(&payload).unwrap();
        assert_eq!(io.sequence(), 2);
        let wire = io.into_inner().output;
        assert_eq!(wire.len(), MAX_PACKET_SIZE + 2 * PacketHeader::SIZE);
        assert_eq!(&wire[wire.len() - 4..], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_sequence_follows_server() {
        let wire = vec![0x01, 0x00, 0x00, 0x05, 0xAA];
        let mut io = PacketIo::new(Duplex::new(wire));
        assert_eq!(io.read_packet().unwrap(), vec![0xAA]);
        assert_eq!(io.sequence(), 6);
        io.write_packet(b"x").unwrap();
        assert_eq!(io.into_inner().output, vec![0x01, 0x00, 0x00, 0x06, b'x']);
    }

    #[test]
    fn test_eof_mid_frame_reports_bytes_read() {
        let wire = vec![0x0A, 0x00, 0x00, 0x00, 1, 2, 3];
        let mut io = PacketIo::new(Duplex::new(wire));
        let err = io.read_packet().unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("read 3 bytes"), "{}", err);
    }

    #[test]
    fn test_oversized_packet_rejected_before_write() {
        let mut io = PacketIo::new(Duplex::new(Vec::new()));
        io.set_max_allowed_packet(16);
        let err = io.write_command(&[0u8; 17]).unwrap_err();
        match &err {
            Error::Connection(e) => assert_eq!(e.kind, ConnectionErrorKind::PacketTooLarge),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_transient());
        assert!(io.into_inner().output.is_empty());
    }

    #[test]
    fn test_trace_excerpt_marks_cut_payloads() {
        assert_eq!(hex_excerpt(&[0x03, 0xAB], 8), "03ab");
        assert_eq!(hex_excerpt(&[0x03, 0xAB, 0xFF], 2), "03ab…");
        assert_eq!(hex_excerpt(&[], 0), "");
    }
}
