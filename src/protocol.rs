//! Defines the wire-level records shared between RPC client and server.
//!
//! A connection starts with a single [HandshakeOption](HandshakeOption), JSON-encoded
//! without any framing. It carries a magic number identifying the protocol, the name of
//! the codec used for the rest of the connection and the timeout budgets. Afterwards
//! both directions exchange (header, body) record pairs in the negotiated codec, see
//! [codec](crate::codec).
//!
//! As the handshake arrives over the network it may be delivered in arbitrary pieces.
//! [parse_handshake](parse_handshake) therefore operates on a buffer and distinguishes
//! "not enough data yet" from "malformed data", so the caller can simply keep reading
//! until a verdict is reached.
use std::time::Duration;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};

/// Identifies the protocol; a connection sending anything else is dropped.
pub const MAGIC_NUMBER: u64 = 0x3bef5c;

/// The URL path used for the HTTP CONNECT upgrade.
pub const DEFAULT_RPC_PATH: &str = "/_geerpc_";

/// The (intentionally pre-HTTP/1.1) response line sent after a successful CONNECT.
pub const CONNECTED_RESPONSE: &str = "HTTP/1.0 200 Connected to Gee RPC\n\n";

/// The default budget for establishing a connection including the handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The first record on every connection, negotiating codec and timeouts.
///
/// Timeouts travel as integer nanoseconds. A value of 0 disables the respective
/// budget.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeOption {
    /// Must equal [MAGIC_NUMBER](MAGIC_NUMBER).
    #[serde(rename = "MagicNumber")]
    pub magic_number: u64,

    /// The name of the codec used for all subsequent records ("json" or "bincode").
    #[serde(rename = "CodecType")]
    pub codec_type: String,

    /// Bounds connection establishment (including this handshake) in nanoseconds.
    #[serde(rename = "ConnectTimeout")]
    pub connect_timeout_ns: u64,

    /// Bounds the server-side handling of each request in nanoseconds.
    #[serde(rename = "HandleTimeout")]
    pub handle_timeout_ns: u64,
}

impl Default for HandshakeOption {
    fn default() -> Self {
        HandshakeOption {
            magic_number: MAGIC_NUMBER,
            codec_type: crate::codec::CodecKind::Json.name().to_owned(),
            connect_timeout_ns: DEFAULT_CONNECT_TIMEOUT.as_nanos() as u64,
            handle_timeout_ns: 0,
        }
    }
}

impl HandshakeOption {
    /// Creates an option record for the given codec with default timeouts.
    pub fn new(codec: crate::codec::CodecKind) -> Self {
        HandshakeOption {
            codec_type: codec.name().to_owned(),
            ..HandshakeOption::default()
        }
    }

    /// Specifies the connect timeout to announce.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ns = timeout.as_nanos() as u64;
        self
    }

    /// Specifies the per-request handle timeout to announce.
    pub fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout_ns = timeout.as_nanos() as u64;
        self
    }

    /// Returns the connect timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_nanos(self.connect_timeout_ns)
    }

    /// Returns the handle timeout as a duration.
    pub fn handle_timeout(&self) -> Duration {
        Duration::from_nanos(self.handle_timeout_ns)
    }
}

/// Precedes every body on the wire and correlates requests with responses.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Header {
    /// Selects the operation, e.g. "Group.Get".
    #[serde(rename = "ServiceMethod")]
    pub service_method: String,

    /// The per-connection sequence number of the request, starting at 1.
    #[serde(rename = "Seq")]
    pub seq: u64,

    /// Carries an application level error; empty on success.
    #[serde(rename = "Error")]
    pub error: String,
}

/// Tries to parse a [HandshakeOption](HandshakeOption) from the given buffer.
///
/// Returns `Ok(None)` if the buffer only holds a partial record yet. On success, the
/// option and the number of consumed bytes are returned; any remaining bytes already
/// belong to the first framed record and must be carried over to the codec reader.
///
/// # Examples
///
/// ```
/// # use bytes::BytesMut;
/// # use ganymede::protocol::parse_handshake;
/// let buffer = BytesMut::from(r#"{"MagicNumber": 3927900, "CodecType": "json","#);
/// assert_eq!(parse_handshake(&buffer).unwrap().is_none(), true);
/// ```
pub fn parse_handshake(buffer: &BytesMut) -> anyhow::Result<Option<(HandshakeOption, usize)>> {
    let mut stream = serde_json::Deserializer::from_slice(buffer).into_iter::<HandshakeOption>();

    match stream.next() {
        Some(Ok(option)) => {
            let consumed = stream.byte_offset();
            Ok(Some((option, consumed)))
        }
        Some(Err(error)) if error.is_eof() => Ok(None),
        Some(Err(error)) => Err(error.into()),
        None => Ok(None),
    }
}

/// Returns the index just past the blank line terminating an HTTP preamble.
///
/// Both CRLF and bare LF line endings are accepted, as the CONNECT exchange
/// deliberately stays below a full HTTP implementation.
pub(crate) fn find_blank_line(buffer: &[u8]) -> Option<usize> {
    if let Some(position) = buffer.windows(4).position(|window| window == b"\r\n\r\n") {
        return Some(position + 4);
    }

    buffer
        .windows(2)
        .position(|window| window == b"\n\n")
        .map(|position| position + 2)
}

/// Splits a peer address of the form "protocol@host:port".
///
/// # Examples
///
/// ```
/// # use ganymede::protocol::parse_peer_addr;
/// let (protocol, addr) = parse_peer_addr("tcp@127.0.0.1:9010").unwrap();
/// assert_eq!(protocol, "tcp");
/// assert_eq!(addr, "127.0.0.1:9010");
///
/// assert_eq!(parse_peer_addr("127.0.0.1:9010").is_err(), true);
/// ```
pub fn parse_peer_addr(peer: &str) -> anyhow::Result<(&str, &str)> {
    match peer.split_once('@') {
        Some((protocol, addr)) if !protocol.is_empty() && !addr.is_empty() => {
            Ok((protocol, addr))
        }
        _ => Err(anyhow::anyhow!(
            "rpc client: wrong format '{}', expect protocol@addr",
            peer
        )),
    }
}
