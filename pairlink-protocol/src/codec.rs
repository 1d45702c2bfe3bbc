//! Line-delimited packet framing
//!
//! [`decode`] is a pure function over a byte buffer: it never consumes an
//! incomplete line, so the caller keeps the partial buffer and appends the
//! next read. [`PacketReader`] wraps that loop around an async byte stream and
//! applies the malformed-line policy.

use crate::{Packet, ProtocolError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, warn};

/// Maximum length of a single line (10MB)
pub const MAX_LINE_LENGTH: usize = 10 * 1024 * 1024;

/// Consecutive malformed lines tolerated before the stream is abandoned
pub const MAX_CONSECUTIVE_MALFORMED: u32 = 3;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Result of one decode step
#[derive(Debug, PartialEq)]
pub enum Decoded {
    /// A complete packet and the number of bytes it occupied, terminator included
    Packet { packet: Packet, consumed: usize },
    /// No terminator in the buffer yet; nothing was consumed
    NeedMoreData,
    /// A complete line that is not a valid packet
    Malformed { consumed: usize, reason: String },
}

/// Serialize a packet into exactly one terminated line
pub fn encode(packet: &Packet) -> Result<Vec<u8>> {
    packet.to_bytes()
}

/// Decode the first line of `buffer`
pub fn decode(buffer: &[u8]) -> Decoded {
    match find_newline(buffer) {
        Some(newline) => decode_line(&buffer[..newline + 1]),
        None => Decoded::NeedMoreData,
    }
}

fn find_newline(bytes: &[u8]) -> Option<usize> {
    bytes.iter().position(|b| *b == b'\n')
}

/// Decode one complete line, terminator included
fn decode_line(line: &[u8]) -> Decoded {
    let consumed = line.len();
    match Packet::from_bytes(line) {
        Ok(packet) => Decoded::Packet { packet, consumed },
        Err(ProtocolError::MalformedPacket(reason)) => Decoded::Malformed { consumed, reason },
        Err(e) => Decoded::Malformed {
            consumed,
            reason: e.to_string(),
        },
    }
}

/// Read one line from `stream` a byte at a time
///
/// Used before the TLS handshake: nothing past the terminator may be pulled
/// off the socket, or the peer's first TLS record would be lost.
pub async fn read_line_unbuffered<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(ProtocolError::Transport(if line.is_empty() {
                "connection closed before identity line".to_string()
            } else {
                "connection closed in the middle of a line".to_string()
            }));
        }

        line.push(byte[0]);
        if byte[0] == b'\n' {
            return Ok(line);
        }
        if line.len() > MAX_LINE_LENGTH {
            return Err(ProtocolError::PacketSizeExceeded(line.len(), MAX_LINE_LENGTH));
        }
    }
}

/// Buffered packet reader over an async byte stream
pub struct PacketReader<R> {
    inner: R,
    buffer: Vec<u8>,
    /// Length of the buffer prefix already searched for a terminator
    scanned: usize,
    consecutive_malformed: u32,
    max_consecutive_malformed: u32,
}

impl<R> PacketReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Create a reader with the default malformed-line threshold
    pub fn new(inner: R) -> Self {
        Self::with_threshold(inner, MAX_CONSECUTIVE_MALFORMED)
    }

    /// Create a reader with a custom malformed-line threshold
    pub fn with_threshold(inner: R, max_consecutive_malformed: u32) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            scanned: 0,
            consecutive_malformed: 0,
            max_consecutive_malformed,
        }
    }

    /// Read the next packet
    ///
    /// Returns `Ok(None)` on a clean end of stream. Isolated malformed lines
    /// are dropped with a warning; once more than the threshold arrive in a
    /// row, `MalformedPacket` is returned and the stream should be closed.
    ///
    /// Each received byte is searched for a terminator once, so reading a
    /// line is linear in its length.
    pub async fn read_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            let Some(offset) = find_newline(&self.buffer[self.scanned..]) else {
                self.scanned = self.buffer.len();
                if self.buffer.len() > MAX_LINE_LENGTH {
                    return Err(ProtocolError::PacketSizeExceeded(
                        self.buffer.len(),
                        MAX_LINE_LENGTH,
                    ));
                }

                let mut chunk = [0u8; READ_CHUNK_SIZE];
                let n = self.inner.read(&mut chunk).await?;
                if n == 0 {
                    if self.buffer.is_empty() {
                        return Ok(None);
                    }
                    return Err(ProtocolError::MalformedPacket(format!(
                        "stream ended with {} unterminated bytes",
                        self.buffer.len()
                    )));
                }
                self.buffer.extend_from_slice(&chunk[..n]);
                continue;
            };

            let end = self.scanned + offset + 1;
            let decoded = decode_line(&self.buffer[..end]);
            self.buffer.drain(..end);
            self.scanned = 0;

            match decoded {
                Decoded::Packet { packet, .. } => {
                    self.consecutive_malformed = 0;
                    return Ok(Some(packet));
                }
                Decoded::Malformed { reason, .. } => {
                    self.consecutive_malformed += 1;
                    warn!(
                        "Dropping malformed line ({} in a row): {}",
                        self.consecutive_malformed, reason
                    );
                    if self.consecutive_malformed > self.max_consecutive_malformed {
                        return Err(ProtocolError::MalformedPacket(format!(
                            "{} consecutive malformed lines, last: {}",
                            self.consecutive_malformed, reason
                        )));
                    }
                }
                Decoded::NeedMoreData => {}
            }
        }
    }

    /// Change the malformed-line threshold
    pub fn set_threshold(&mut self, max_consecutive_malformed: u32) {
        self.max_consecutive_malformed = max_consecutive_malformed;
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

/// Packet writer over an async byte stream
pub struct PacketWriter<W> {
    inner: W,
}

impl<W> PacketWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encode, write and flush one packet
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        let bytes = encode(packet)?;
        if bytes.len() > MAX_LINE_LENGTH {
            return Err(ProtocolError::PacketSizeExceeded(bytes.len(), MAX_LINE_LENGTH));
        }

        debug!("Writing packet '{}' ({} bytes)", packet.packet_type, bytes.len());
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write side of the stream
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Bidirectional packet stream used during handshake and pairing, before the
/// stream is split into a session's read loop and writer
pub struct PacketStream<S> {
    reader: PacketReader<S>,
}

impl<S> PacketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            reader: PacketReader::new(stream),
        }
    }

    pub async fn read_packet(&mut self) -> Result<Option<Packet>> {
        self.reader.read_packet().await
    }

    pub async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        let mut writer = PacketWriter::new(self.reader.get_mut());
        writer.write_packet(packet).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.reader.get_mut().shutdown().await?;
        Ok(())
    }

    pub fn get_ref(&self) -> &S {
        self.reader.get_ref()
    }

    pub fn get_mut(&mut self) -> &mut S {
        self.reader.get_mut()
    }

    /// Split into independent read and write halves, keeping any bytes that
    /// were already buffered
    pub fn into_split(self) -> (PacketReader<ReadHalf<S>>, PacketWriter<WriteHalf<S>>) {
        let PacketReader {
            inner,
            buffer,
            scanned,
            consecutive_malformed,
            max_consecutive_malformed,
        } = self.reader;
        let (read_half, write_half) = tokio::io::split(inner);

        (
            PacketReader {
                inner: read_half,
                buffer,
                scanned,
                consecutive_malformed,
                max_consecutive_malformed,
            },
            PacketWriter::new(write_half),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::duplex;

    fn ping(id: i64) -> Packet {
        Packet::with_id(id, "ping", json!({}))
    }

    #[test]
    fn test_decode_round_trip() {
        let packet = Packet::with_id(42, "pairlink.note", json!({ "text": "hello" }));
        let bytes = encode(&packet).unwrap();

        match decode(&bytes) {
            Decoded::Packet {
                packet: decoded,
                consumed,
            } => {
                assert_eq!(consumed, bytes.len());
                assert_eq!(decoded.id, packet.id);
                assert_eq!(decoded.packet_type, packet.packet_type);
                assert_eq!(decoded.body, packet.body);
            }
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn test_decode_two_packets_in_order() {
        let mut buffer = encode(&ping(1)).unwrap();
        buffer.extend(encode(&ping(2)).unwrap());

        let Decoded::Packet { packet, consumed } = decode(&buffer) else {
            panic!("first packet not decoded");
        };
        assert_eq!(packet.id, 1);

        let Decoded::Packet { packet, consumed: rest } = decode(&buffer[consumed..]) else {
            panic!("second packet not decoded");
        };
        assert_eq!(packet.id, 2);
        assert_eq!(consumed + rest, buffer.len());
    }

    #[test]
    fn test_decode_partial_needs_more_data() {
        let bytes = encode(&ping(5)).unwrap();
        let (head, tail) = bytes.split_at(bytes.len() - 1);

        assert_eq!(decode(head), Decoded::NeedMoreData);

        let mut buffer = head.to_vec();
        buffer.extend_from_slice(tail);
        assert!(matches!(decode(&buffer), Decoded::Packet { .. }));
    }

    #[test]
    fn test_decode_malformed_line_is_consumed() {
        let mut buffer = b"{\"id\":1}\n".to_vec();
        buffer.extend(encode(&ping(2)).unwrap());

        let Decoded::Malformed { consumed, .. } = decode(&buffer) else {
            panic!("expected malformed line");
        };
        assert_eq!(consumed, 9);
        assert!(matches!(decode(&buffer[consumed..]), Decoded::Packet { .. }));
    }

    #[tokio::test]
    async fn test_reader_handles_arbitrary_chunks() {
        let (mut client, server) = duplex(64);
        let mut reader = PacketReader::new(server);

        let mut wire = Vec::new();
        for id in 1..=3 {
            wire.extend(encode(&ping(id)).unwrap());
        }

        tokio::spawn(async move {
            for chunk in wire.chunks(7) {
                client.write_all(chunk).await.unwrap();
            }
        });

        for id in 1..=3 {
            let packet = reader.read_packet().await.unwrap().unwrap();
            assert_eq!(packet.id, id);
        }
        assert!(reader.read_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_is_linear_in_line_length() {
        let (mut client, server) = duplex(READ_CHUNK_SIZE);
        let mut reader = PacketReader::new(server);

        let blob = "x".repeat(9 * 1024 * 1024);
        let large = Packet::with_id(1, "pairlink.blob", json!({ "data": blob }));
        let wire = encode(&large).unwrap();
        assert!(wire.len() < MAX_LINE_LENGTH);

        tokio::spawn(async move {
            client.write_all(&wire).await.unwrap();
            client.write_all(&encode(&ping(2)).unwrap()).await.unwrap();
        });

        let started = std::time::Instant::now();
        let packet = reader.read_packet().await.unwrap().unwrap();
        assert_eq!(packet.id, 1);
        assert_eq!(reader.read_packet().await.unwrap().unwrap().id, 2);
        assert!(
            started.elapsed() < std::time::Duration::from_secs(10),
            "reading a 9 MiB line took {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn test_reader_drops_isolated_malformed_lines() {
        let (mut client, server) = duplex(1024);
        let mut reader = PacketReader::new(server);

        client.write_all(b"garbage\n").await.unwrap();
        client.write_all(&encode(&ping(1)).unwrap()).await.unwrap();
        client.write_all(b"{}\n{}\n{}\n").await.unwrap();
        client.write_all(&encode(&ping(2)).unwrap()).await.unwrap();
        drop(client);

        assert_eq!(reader.read_packet().await.unwrap().unwrap().id, 1);
        assert_eq!(reader.read_packet().await.unwrap().unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_reader_escalates_after_threshold() {
        let (mut client, server) = duplex(1024);
        let mut reader = PacketReader::new(server);

        for _ in 0..=MAX_CONSECUTIVE_MALFORMED {
            client.write_all(b"not a packet\n").await.unwrap();
        }

        let result = reader.read_packet().await;
        assert!(matches!(result, Err(ProtocolError::MalformedPacket(_))));
    }

    #[tokio::test]
    async fn test_reader_rejects_unterminated_tail() {
        let (mut client, server) = duplex(1024);
        let mut reader = PacketReader::new(server);

        let bytes = encode(&ping(1)).unwrap();
        client.write_all(&bytes[..bytes.len() - 1]).await.unwrap();
        drop(client);

        assert!(matches!(
            reader.read_packet().await,
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[tokio::test]
    async fn test_unbuffered_line_leaves_rest_on_stream() {
        let (mut client, mut server) = duplex(1024);

        client.write_all(&encode(&ping(1)).unwrap()).await.unwrap();
        client.write_all(b"trailing").await.unwrap();
        drop(client);

        let line = read_line_unbuffered(&mut server).await.unwrap();
        assert_eq!(Packet::from_bytes(&line).unwrap().id, 1);

        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"trailing");
    }

    #[tokio::test]
    async fn test_split_keeps_buffered_bytes() {
        let (mut client, server) = duplex(1024);
        let mut stream = PacketStream::new(server);

        let mut wire = encode(&ping(1)).unwrap();
        wire.extend(encode(&ping(2)).unwrap());
        client.write_all(&wire).await.unwrap();

        assert_eq!(stream.read_packet().await.unwrap().unwrap().id, 1);

        let (mut reader, mut writer) = stream.into_split();
        assert_eq!(reader.read_packet().await.unwrap().unwrap().id, 2);

        writer.write_packet(&ping(3)).await.unwrap();
        let mut echo = PacketReader::new(client);
        assert_eq!(echo.read_packet().await.unwrap().unwrap().id, 3);
    }
}
