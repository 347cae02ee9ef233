//! Implements the framed record layer used after the handshake.
//!
//! Every record is a (header, body) pair. Both parts travel as individual frames: a
//! big-endian u32 length followed by the payload in the negotiated codec. An empty
//! body is a zero-length frame, used for responses which only carry an error in the
//! header.
//!
//! The reader collects incoming bytes in a single buffer and only consumes them once a
//! complete record is present. This makes [read_record](FrameReader::read_record)
//! cancel safe: a read which is abandoned halfway (e.g. because it lost a `select!`
//! race against a shutdown check) leaves the buffered bytes untouched and the next
//! read continues exactly where the previous one left off.
//!
//! The writer assembles header and body frames into one buffer and pushes them onto
//! the wire with a single write, so that a record can never interleave with records
//! written by other tasks (callers still have to serialize writes, see the send mutex
//! in [server](crate::server) and [client](crate::client)).
use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::Header;

/// Pre-allocated buffer size for incoming records. Most records fit in here so that no
/// additional allocations are required on the hot path.
const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Upper bound for a single frame. Protects against absurd length prefixes produced by
/// corrupted or malicious peers.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Enumerates the codecs a connection can negotiate.
///
/// The set is closed on purpose: the handshake names one of these and everything else
/// is rejected during connection setup.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodecKind {
    /// Encodes headers and bodies as JSON documents.
    Json,
    /// Encodes headers and bodies via bincode.
    Bincode,
}

impl CodecKind {
    /// Resolves a codec from its wire name.
    pub fn from_name(name: &str) -> Option<CodecKind> {
        match name {
            "json" => Some(CodecKind::Json),
            "bincode" => Some(CodecKind::Bincode),
            _ => None,
        }
    }

    /// Returns the wire name of this codec.
    pub fn name(&self) -> &'static str {
        match self {
            CodecKind::Json => "json",
            CodecKind::Bincode => "bincode",
        }
    }

    /// Serializes the given value into a frame payload.
    pub fn encode<T: Serialize>(&self, value: &T) -> anyhow::Result<Vec<u8>> {
        match self {
            CodecKind::Json => Ok(serde_json::to_vec(value)?),
            CodecKind::Bincode => Ok(bincode::serialize(value)?),
        }
    }

    /// Deserializes a frame payload into the requested type.
    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> anyhow::Result<T> {
        match self {
            CodecKind::Json => Ok(serde_json::from_slice(payload)?),
            CodecKind::Bincode => Ok(bincode::deserialize(payload)?),
        }
    }
}

/// Reads (header, body) records from the receiving half of a connection.
pub struct FrameReader<R> {
    kind: CodecKind,
    io: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Creates a reader with an empty receive buffer.
    pub fn new(kind: CodecKind, io: R) -> Self {
        FrameReader::with_buffered(kind, io, BytesMut::with_capacity(DEFAULT_BUFFER_SIZE))
    }

    /// Creates a reader which starts out with already received bytes.
    ///
    /// This is used after the handshake, which may have read past the option record.
    pub fn with_buffered(kind: CodecKind, io: R, buffer: BytesMut) -> Self {
        FrameReader { kind, io, buffer }
    }

    /// Returns the codec this reader decodes with.
    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    /// Reads the next record, returning the decoded header and the raw body payload.
    ///
    /// Returns `Ok(None)` if the connection was closed cleanly at a record boundary.
    /// A close in the middle of a record is reported as an error.
    pub async fn read_record(&mut self) -> anyhow::Result<Option<(Header, Bytes)>> {
        loop {
            if let Some(record) = self.try_parse_record()? {
                return Ok(Some(record));
            }

            let at_boundary = self.buffer.is_empty();
            let read = self.io.read_buf(&mut self.buffer).await?;
            if read == 0 {
                return if at_boundary {
                    Ok(None)
                } else {
                    Err(anyhow!("connection closed in the middle of a record"))
                };
            }
        }
    }

    /// Consumes one record from the buffer, but only if it is complete.
    fn try_parse_record(&mut self) -> anyhow::Result<Option<(Header, Bytes)>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let header_len = read_frame_len(&self.buffer[0..4])?;

        if self.buffer.len() < 4 + header_len + 4 {
            return Ok(None);
        }
        let body_len = read_frame_len(&self.buffer[4 + header_len..4 + header_len + 4])?;

        if self.buffer.len() < 4 + header_len + 4 + body_len {
            return Ok(None);
        }

        self.buffer.advance(4);
        let header_payload = self.buffer.split_to(header_len);
        self.buffer.advance(4);
        let body = self.buffer.split_to(body_len).freeze();

        let header = self.kind.decode::<Header>(&header_payload)?;
        Ok(Some((header, body)))
    }
}

fn read_frame_len(prefix: &[u8]) -> anyhow::Result<usize> {
    let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(anyhow!(
            "frame of {} bytes exceeds the limit of {} bytes",
            len,
            MAX_FRAME_SIZE
        ));
    }

    Ok(len)
}

/// Writes (header, body) records onto the sending half of a connection.
#[derive(Debug)]
pub struct FrameWriter<W> {
    kind: CodecKind,
    io: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Creates a writer for the given codec.
    pub fn new(kind: CodecKind, io: W) -> Self {
        FrameWriter { kind, io }
    }

    /// Writes one record with a typed body.
    pub async fn write<B: Serialize>(&mut self, header: &Header, body: &B) -> anyhow::Result<()> {
        let header_payload = self.kind.encode(header)?;
        let body_payload = self.kind.encode(body)?;
        self.write_frames(&header_payload, &body_payload).await
    }

    /// Writes one record with an empty body, used for error-only responses.
    pub async fn write_empty(&mut self, header: &Header) -> anyhow::Result<()> {
        let header_payload = self.kind.encode(header)?;
        self.write_frames(&header_payload, &[]).await
    }

    async fn write_frames(&mut self, header: &[u8], body: &[u8]) -> anyhow::Result<()> {
        // One buffer, one write: the record reaches the socket in a single piece.
        let mut record = BytesMut::with_capacity(8 + header.len() + body.len());
        record.put_u32(header.len() as u32);
        record.put_slice(header);
        record.put_u32(body.len() as u32);
        record.put_slice(body);

        self.io.write_all(&record).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Shuts down the sending half of the connection.
    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{CodecKind, FrameReader, FrameWriter};
    use crate::protocol::Header;
    use tokio::io::AsyncWriteExt;

    fn request_header(seq: u64) -> Header {
        Header {
            service_method: "Group.Get".to_owned(),
            seq,
            error: String::new(),
        }
    }

    #[tokio::test]
    async fn records_round_trip_in_both_codecs() {
        for kind in [CodecKind::Json, CodecKind::Bincode] {
            let (client, server) = tokio::io::duplex(1024);
            let mut writer = FrameWriter::new(kind, client);
            let mut reader = FrameReader::new(kind, server);
            assert_eq!(reader.kind(), kind);

            writer
                .write(&request_header(1), &"Tom".to_owned())
                .await
                .unwrap();
            writer
                .write(&request_header(2), &["Tom".to_owned(), "630".to_owned()])
                .await
                .unwrap();

            let (header, body) = reader.read_record().await.unwrap().unwrap();
            assert_eq!(header.seq, 1);
            assert_eq!(header.service_method, "Group.Get");
            assert_eq!(kind.decode::<String>(&body).unwrap(), "Tom");

            let (header, body) = reader.read_record().await.unwrap().unwrap();
            assert_eq!(header.seq, 2);
            let args: [String; 2] = kind.decode(&body).unwrap();
            assert_eq!(args, ["Tom".to_owned(), "630".to_owned()]);
        }
    }

    #[tokio::test]
    async fn empty_bodies_are_zero_length_frames() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(CodecKind::Json, client);
        let mut reader = FrameReader::new(CodecKind::Json, server);

        let mut header = request_header(7);
        header.error = "rpc server: unknown method Group.Flush".to_owned();
        writer.write_empty(&header).await.unwrap();

        let (header, body) = reader.read_record().await.unwrap().unwrap();
        assert_eq!(header.error, "rpc server: unknown method Group.Flush");
        assert_eq!(body.len(), 0);
    }

    #[tokio::test]
    async fn a_fragmented_record_is_reassembled() {
        let kind = CodecKind::Json;
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(kind, server);

        // Encode a record manually and deliver it byte by byte...
        let header = kind.encode(&request_header(1)).unwrap();
        let body = kind.encode(&"Tom".to_owned()).unwrap();
        let mut record = Vec::new();
        record.extend_from_slice(&(header.len() as u32).to_be_bytes());
        record.extend_from_slice(&header);
        record.extend_from_slice(&(body.len() as u32).to_be_bytes());
        record.extend_from_slice(&body);

        let feeder = tokio::spawn(async move {
            for byte in record {
                client.write_all(&[byte]).await.unwrap();
                client.flush().await.unwrap();
            }
            client
        });

        let (header, body) = reader.read_record().await.unwrap().unwrap();
        assert_eq!(header.seq, 1);
        assert_eq!(kind.decode::<String>(&body).unwrap(), "Tom");
        let _ = feeder.await.unwrap();
    }

    #[tokio::test]
    async fn a_clean_close_at_a_record_boundary_yields_none() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(CodecKind::Json, client);
        let mut reader = FrameReader::new(CodecKind::Json, server);

        writer.write(&request_header(1), &"x".to_owned()).await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);

        assert_eq!(reader.read_record().await.unwrap().is_some(), true);
        assert_eq!(reader.read_record().await.unwrap().is_none(), true);
    }

    #[tokio::test]
    async fn a_close_inside_a_record_is_an_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(CodecKind::Json, server);

        // A length prefix announcing 100 bytes, followed by silence...
        client.write_all(&100u32.to_be_bytes()).await.unwrap();
        drop(client);

        assert_eq!(reader.read_record().await.is_err(), true);
    }

    #[test]
    fn codec_names_resolve_and_unknown_names_are_rejected() {
        assert_eq!(CodecKind::from_name("json"), Some(CodecKind::Json));
        assert_eq!(CodecKind::from_name("bincode"), Some(CodecKind::Bincode));
        assert_eq!(CodecKind::from_name("gob"), None);
        assert_eq!(CodecKind::Json.name(), "json");
    }
}
