//! Direct TCP transport.
//!
//! The initiator binds an ephemeral listener and advertises it, together
//! with a one-time token, through the signaling bus; the responder dials it
//! and proves it read the offer by sending the token as its first frame.
//! Connections that fail the handshake are dropped and the listener keeps
//! waiting. Messages are framed as
//!
//! ```text
//! ┌──────────────┬─────────────────┐
//! │ u32 BE len   │ payload (len B) │
//! └──────────────┴─────────────────┘
//! ```
//!
//! One `send` is exactly one frame, so message boundaries survive the
//! stream. In keyed rooms the offer travels sealed, so only holders of the
//! room password can learn the token.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{PeerTransport, TransportError, TransportEvent, TransportFactory, TransportSink};
use crate::config::DEFAULT_CONNECT_TIMEOUT;

/// Frames larger than this are treated as a protocol violation.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Random bytes in an offer token.
const TOKEN_SIZE: usize = 16;

/// How long an accepted socket gets to present the token.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Creates TCP transports.
#[derive(Debug, Clone)]
pub struct TcpTransportFactory {
    /// Interface the initiator listens on.
    pub bind_host: String,
    /// Host placed in the offer for the responder to dial.
    pub advertise_host: String,
    /// Deadline for accepting or dialing the peer.
    pub connect_timeout: Duration,
}

impl Default for TcpTransportFactory {
    fn default() -> Self {
        Self::new("127.0.0.1", "127.0.0.1")
    }
}

impl TcpTransportFactory {
    pub fn new(bind_host: impl Into<String>, advertise_host: impl Into<String>) -> Self {
        Self {
            bind_host: bind_host.into(),
            advertise_host: advertise_host.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

impl TransportFactory for TcpTransportFactory {
    fn create(&self, initiator: bool, sink: TransportSink) -> Box<dyn PeerTransport> {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let mut transport = TcpTransport {
            sink,
            outgoing: Some(outgoing),
            pending_rx: Some(outgoing_rx),
            task: None,
            closed: false,
            connect_timeout: self.connect_timeout,
        };
        if initiator {
            transport.listen(&self.bind_host, &self.advertise_host);
        }
        Box::new(transport)
    }
}

struct TcpTransport {
    sink: TransportSink,
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    /// Outgoing queue, handed to the connection task once it starts.
    pending_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
    closed: bool,
    connect_timeout: Duration,
}

fn new_token() -> String {
    let mut bytes = [0u8; TOKEN_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

impl TcpTransport {
    fn listen(&mut self, bind_host: &str, advertise_host: &str) {
        let listener = match std::net::TcpListener::bind((bind_host, 0))
            .and_then(|l| l.set_nonblocking(true).map(|_| l))
            .and_then(TcpListener::from_std)
        {
            Ok(listener) => listener,
            Err(e) => {
                self.sink.emit(TransportEvent::Error(format!("bind failed: {e}")));
                return;
            }
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                self.sink.emit(TransportEvent::Error(format!("bind failed: {e}")));
                return;
            }
        };
        let Some(rx) = self.pending_rx.take() else {
            return;
        };

        let token = new_token();
        let sink = self.sink.clone();
        let deadline = self.connect_timeout;
        let expected = token.clone();
        self.task = Some(tokio::spawn(async move {
            match timeout(deadline, accept_peer(&listener, &expected)).await {
                Ok(Ok(stream)) => run_connection(stream, rx, sink).await,
                Ok(Err(e)) => {
                    sink.emit(TransportEvent::Error(format!("accept failed: {e}")));
                }
                Err(_) => {
                    sink.emit(TransportEvent::Error(format!(
                        "no peer connected within {deadline:?}"
                    )));
                }
            }
        }));
        self.sink.emit(TransportEvent::Signal(json!({
            "type": "offer",
            "addr": format!("{advertise_host}:{port}"),
            "token": token,
        })));
    }

    fn dial(&mut self, addr: String, token: String) {
        let Some(rx) = self.pending_rx.take() else {
            log::debug!("tcp transport: ignoring repeated offer for {}", self.sink.peer());
            return;
        };
        let sink = self.sink.clone();
        let deadline = self.connect_timeout;
        self.task = Some(tokio::spawn(async move {
            let connect = async {
                let mut stream = TcpStream::connect(&addr).await?;
                write_frame(&mut stream, token.as_bytes()).await?;
                Ok::<_, std::io::Error>(stream)
            };
            match timeout(deadline, connect).await {
                Ok(Ok(stream)) => run_connection(stream, rx, sink).await,
                Ok(Err(e)) => {
                    sink.emit(TransportEvent::Error(format!("connect to {addr} failed: {e}")));
                }
                Err(_) => {
                    sink.emit(TransportEvent::Error(format!(
                        "connect to {addr} timed out after {deadline:?}"
                    )));
                }
            }
        }));
    }
}

/// Accept until a socket presents `token`. Everything else is dropped.
async fn accept_peer(listener: &TcpListener, token: &str) -> std::io::Result<TcpStream> {
    loop {
        let (mut stream, addr) = listener.accept().await?;
        match timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream, TOKEN_SIZE * 2)).await {
            Ok(Ok(frame)) if frame == token.as_bytes() => {
                log::debug!("tcp transport: accepted {addr}");
                return Ok(stream);
            }
            _ => log::warn!("tcp transport: rejected {addr}: bad handshake"),
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    writer.write_u32(frame.len() as u32).await?;
    writer.write_all(frame).await
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, limit: usize) -> std::io::Result<Vec<u8>> {
    let len = reader.read_u32().await? as usize;
    if len > limit {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(frame)
}

/// Pump frames in both directions until either side goes away.
async fn run_connection(stream: TcpStream, mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>, sink: TransportSink) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outgoing.recv().await {
            if write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    sink.emit(TransportEvent::Connect);

    loop {
        match read_frame(&mut reader, MAX_FRAME_SIZE).await {
            Ok(frame) => {
                if !sink.emit(TransportEvent::Data(frame)) {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                sink.emit(TransportEvent::Close);
                break;
            }
            Err(e) => {
                sink.emit(TransportEvent::Error(e.to_string()));
                break;
            }
        }
    }

    writer_task.abort();
}

/// Pull `addr` and `token` out of an offer.
fn parse_offer(signal: &Value) -> Result<(String, String), TransportError> {
    let field = |name: &str| {
        signal
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TransportError::InvalidSignal(format!("offer without {name}")))
    };
    Ok((field("addr")?, field("token")?))
}

impl PeerTransport for TcpTransport {
    fn signal(&mut self, signal: Value) {
        match signal.get("type").and_then(Value::as_str) {
            Some("offer") => match parse_offer(&signal) {
                Ok((addr, token)) => self.dial(addr, token),
                Err(e) => {
                    self.sink.emit(TransportEvent::Error(e.to_string()));
                }
            },
            _ => log::debug!("tcp transport: ignoring signal {signal}"),
        }
    }

    fn send(&mut self, data: Vec<u8>) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if data.len() > MAX_FRAME_SIZE {
            return Err(TransportError::Io(format!("frame of {} bytes exceeds limit", data.len())));
        }
        let tx = self.outgoing.as_ref().ok_or(TransportError::Closed)?;
        tx.send(data).map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.outgoing = None;
        self.pending_rx = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}
