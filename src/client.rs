//! Contains the RPC client used to talk to a cache node.
//!
//! A [Client](Client) owns one connection and multiplexes any number of concurrent
//! calls over it. Each call is assigned a per-connection sequence number (starting at
//! 1) and parked in a pending table; a background receiver task reads responses and
//! completes the matching call via a oneshot channel. Requests are written under a
//! send mutex so that their records never interleave on the wire - responses however
//! may arrive in any order.
//!
//! Once the receiver observes a read failure (or the server closes the connection),
//! the client is marked as shut down and every still-pending call fails with the same
//! error. There is no automatic reconnect or retry: callers decide what to do with a
//! failed call.
//!
//! # Example
//!
//! ```no_run
//! use ganymede::client::Client;
//! use ganymede::protocol::HandshakeOption;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = Client::dial_peer("tcp@127.0.0.1:9010", HandshakeOption::default()).await?;
//!
//!     let value: String = client.call("Group.Get", &"Tom".to_owned()).await?;
//!     println!("Tom -> {}", value);
//!
//!     client.close()
//! }
//! ```
use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use bytes::{Buf, Bytes, BytesMut};
use fnv::FnvHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::codec::{CodecKind, FrameReader, FrameWriter};
use crate::fmt::format_duration;
use crate::protocol::{
    find_blank_line, parse_peer_addr, HandshakeOption, Header, DEFAULT_RPC_PATH,
};
use crate::spawn;

/// The error reported when operating on a client which was closed or shut down.
const ERR_SHUTDOWN: &str = "connection is shut down";

/// The raw outcome of a call: the undecoded body payload or an error message.
///
/// The receiver task cannot know the reply type of a call, therefore it hands the raw
/// payload back to the caller which decodes it with its concrete type.
type CallOutcome = Result<Bytes, String>;

#[derive(Debug)]
struct ClientState {
    seq: u64,
    pending: FnvHashMap<u64, oneshot::Sender<CallOutcome>>,
    closing: bool,
    shutdown: bool,
}

/// A call which has been sent but not yet answered.
pub struct PendingCall {
    seq: u64,
    done: oneshot::Receiver<CallOutcome>,
}

impl PendingCall {
    /// Returns the sequence number assigned to this call.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// A connection to a cache node which multiplexes concurrent RPC calls.
#[derive(Debug)]
pub struct Client {
    kind: CodecKind,
    state: Mutex<ClientState>,
    writer: Arc<tokio::sync::Mutex<FrameWriter<OwnedWriteHalf>>>,
}

impl Client {
    /// Dials a node using the raw protocol.
    ///
    /// Establishing the connection (TCP connect plus handshake) is bounded by the
    /// connect timeout announced in the given option; a half-open connection is
    /// dropped once the budget is exceeded.
    pub async fn dial(
        protocol: &str,
        addr: &str,
        option: HandshakeOption,
    ) -> anyhow::Result<Arc<Client>> {
        if protocol != "tcp" {
            return Err(anyhow!(
                "rpc client: unsupported protocol '{}'",
                protocol
            ));
        }

        Client::connect(addr, option, false).await
    }

    /// Dials a node which sits behind an HTTP CONNECT upgrade.
    pub async fn dial_http(addr: &str, option: HandshakeOption) -> anyhow::Result<Arc<Client>> {
        Client::connect(addr, option, true).await
    }

    /// Dials a peer given as "protocol@host:port".
    pub async fn dial_peer(peer: &str, option: HandshakeOption) -> anyhow::Result<Arc<Client>> {
        let (protocol, addr) = parse_peer_addr(peer)?;
        match protocol {
            "http" => Client::dial_http(addr, option).await,
            other => Client::dial(other, addr, option).await,
        }
    }

    async fn connect(
        addr: &str,
        option: HandshakeOption,
        via_http: bool,
    ) -> anyhow::Result<Arc<Client>> {
        let budget = option.connect_timeout();
        if budget.is_zero() {
            return Client::connect_inner(addr, option, via_http).await;
        }

        match tokio::time::timeout(budget, Client::connect_inner(addr, option, via_http)).await {
            Ok(result) => result,
            // The half-open connection is dropped together with the abandoned future...
            Err(_) => Err(anyhow!(
                "rpc client: connect timeout: expect within {}",
                format_duration(budget)
            )),
        }
    }

    async fn connect_inner(
        addr: &str,
        option: HandshakeOption,
        via_http: bool,
    ) -> anyhow::Result<Arc<Client>> {
        let kind = CodecKind::from_name(&option.codec_type)
            .ok_or_else(|| anyhow!("rpc client: invalid codec type {}", option.codec_type))?;

        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        let (mut read_half, mut write_half) = stream.into_split();

        let mut leftover = BytesMut::with_capacity(256);
        if via_http {
            connect_upgrade(&mut read_half, &mut write_half, &mut leftover).await?;
        }

        // The option record travels as plain JSON, everything afterwards is framed in
        // the negotiated codec...
        let payload = serde_json::to_vec(&option)?;
        write_half.write_all(&payload).await?;
        write_half.flush().await?;

        let client = Arc::new(Client {
            kind,
            state: Mutex::new(ClientState {
                seq: 1,
                pending: FnvHashMap::default(),
                closing: false,
                shutdown: false,
            }),
            writer: Arc::new(tokio::sync::Mutex::new(FrameWriter::new(kind, write_half))),
        });

        let receiver = client.clone();
        let reader = FrameReader::with_buffered(kind, read_half, leftover);
        spawn!(async move {
            receiver.receive(reader).await;
        });

        Ok(client)
    }

    /// Reads responses and completes the matching pending calls.
    ///
    /// Three cases exist per response: the call is gone (canceled), the header carries
    /// an error, or the body holds the reply. On any read failure every pending call
    /// is failed with the same error and the client refuses further calls.
    async fn receive(self: Arc<Self>, mut reader: FrameReader<OwnedReadHalf>) {
        let reason = loop {
            match reader.read_record().await {
                Ok(Some((header, body))) => match self.remove_call(header.seq) {
                    Some(callback) => {
                        let outcome = if header.error.is_empty() {
                            Ok(body)
                        } else {
                            Err(header.error)
                        };
                        let _ = callback.send(outcome);
                    }
                    // The call was canceled in the meantime. The record is already
                    // fully consumed, so the stale body is simply dropped...
                    None => log::debug!("Discarding a response for unknown seq {}", header.seq),
                },
                Ok(None) => break ERR_SHUTDOWN.to_owned(),
                Err(error) => break error.to_string(),
            }
        };

        self.terminate_calls(&reason);
    }

    fn register_call(&self) -> anyhow::Result<(u64, oneshot::Receiver<CallOutcome>)> {
        let mut state = self.state.lock().unwrap();
        if state.closing || state.shutdown {
            return Err(anyhow!(ERR_SHUTDOWN));
        }

        let seq = state.seq;
        state.seq += 1;
        let (callback, done) = oneshot::channel();
        let _ = state.pending.insert(seq, callback);

        Ok((seq, done))
    }

    fn remove_call(&self, seq: u64) -> Option<oneshot::Sender<CallOutcome>> {
        self.state.lock().unwrap().pending.remove(&seq)
    }

    fn terminate_calls(&self, reason: &str) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        for (_, callback) in state.pending.drain() {
            let _ = callback.send(Err(reason.to_owned()));
        }
    }

    /// Enqueues an asynchronous call and returns a handle to its completion.
    ///
    /// The header is written under the send mutex, so concurrent calls are assigned
    /// strictly increasing sequence numbers which also appear in order on the wire.
    pub async fn go<A: Serialize>(&self, method: &str, args: &A) -> anyhow::Result<PendingCall> {
        // Lock order: send mutex first, then the state lock within register_call...
        let mut writer = self.writer.lock().await;
        let (seq, done) = self.register_call()?;

        let header = Header {
            service_method: method.to_owned(),
            seq,
            error: String::new(),
        };

        if let Err(error) = writer.write(&header, args).await {
            let _ = self.remove_call(seq);
            return Err(error);
        }

        Ok(PendingCall { seq, done })
    }

    /// Performs a call and waits for its completion.
    pub async fn call<A: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        args: &A,
    ) -> anyhow::Result<R> {
        let call = self.go(method, args).await?;
        let outcome = call.done.await;
        self.decode_outcome(outcome)
    }

    /// Performs a call which can be abandoned by the given cancellation signal.
    ///
    /// On cancellation the call is removed from the pending table and an error is
    /// returned; the receiver will later discard the delayed response as unknown.
    pub async fn call_with_cancel<A, R, C>(
        &self,
        method: &str,
        args: &A,
        cancel: C,
    ) -> anyhow::Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
        C: Future<Output = ()>,
    {
        let mut call = self.go(method, args).await?;
        tokio::pin!(cancel);

        tokio::select! {
            biased;
            _ = &mut cancel => {
                let _ = self.remove_call(call.seq);
                Err(anyhow!("rpc client: call failed: canceled"))
            }
            outcome = &mut call.done => self.decode_outcome(outcome),
        }
    }

    fn decode_outcome<R: DeserializeOwned>(
        &self,
        outcome: Result<CallOutcome, oneshot::error::RecvError>,
    ) -> anyhow::Result<R> {
        match outcome {
            Ok(Ok(body)) => self
                .kind
                .decode(&body)
                .map_err(|error| anyhow!("reading body: {}", error)),
            Ok(Err(message)) => Err(anyhow!(message)),
            Err(_) => Err(anyhow!(ERR_SHUTDOWN)),
        }
    }

    /// Determines if the client can still issue calls.
    pub fn is_available(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.closing && !state.shutdown
    }

    /// Closes the connection.
    ///
    /// A second close (or a close after the receiver shut the client down) fails with
    /// "connection is shut down".
    pub fn close(&self) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.closing {
                return Err(anyhow!(ERR_SHUTDOWN));
            }
            state.closing = true;
        }

        // Shutting down the send direction makes the server close its side, which in
        // turn ends the receiver task...
        let writer = self.writer.clone();
        spawn!(async move {
            let _ = writer.lock().await.shutdown().await;
        });

        Ok(())
    }
}

/// Sends the CONNECT preamble and awaits the acknowledging response line.
async fn connect_upgrade(
    read_half: &mut OwnedReadHalf,
    write_half: &mut OwnedWriteHalf,
    buffer: &mut BytesMut,
) -> anyhow::Result<()> {
    write_half
        .write_all(format!("CONNECT {} HTTP/1.0\r\n\r\n", DEFAULT_RPC_PATH).as_bytes())
        .await?;
    write_half.flush().await?;

    loop {
        if let Some(end) = find_blank_line(buffer) {
            let response = String::from_utf8_lossy(&buffer[..end]).into_owned();
            if !response.contains("200 Connected to Gee RPC") {
                return Err(anyhow!(
                    "rpc client: unexpected HTTP response: {}",
                    response.trim()
                ));
            }

            buffer.advance(end);
            return Ok(());
        }

        let read = read_half.read_buf(buffer).await?;
        if read == 0 {
            return Err(anyhow!("connection closed during the CONNECT handshake"));
        }
    }
}
