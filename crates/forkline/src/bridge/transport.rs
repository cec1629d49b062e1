//! Fork channel transports between the controller and one worker.
//!
//! Two interchangeable implementations:
//! - **PipeChannel**: worker stdin carries commands, stdout carries events. No handshake.
//! - **SocketChannel**: loopback TCP, bound before the worker spawns. The worker
//!   proves it belongs to this session by sending the session token first.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::codec::{CommandCodec, EventCodec};
use crate::config::{ChannelConfig, TransportKind};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Controller end of the command direction.
pub type CommandSink = FramedWrite<BoxedWriter, CommandCodec>;
/// Controller end of the event direction.
pub type EventSource = FramedRead<BoxedReader, EventCodec>;

const PIPE_PERMITS: usize = 2;
const SOCKET_PERMITS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid session id: expected {expected}, got {actual}")]
    InvalidSession { expected: String, actual: String },

    #[error("fork channel already connected")]
    AlreadyConnected,

    #[error("fork channel not connected")]
    NotConnected,

    #[error("{0} channel already bound")]
    AlreadyBound(&'static str),

    #[error("worker did not connect within {0:?}")]
    ConnectTimeout(Duration),

    #[error("invalid connection descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// How a worker reaches its controller. Rendered as a URL-like string and
/// handed to the worker at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionDescriptor {
    Pipe { worker_id: u32 },
    Tcp { addr: SocketAddr, session_id: String },
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipe { worker_id } => write!(f, "pipe://{worker_id}"),
            Self::Tcp { addr, session_id } => write!(f, "tcp://{addr}?sessionId={session_id}"),
        }
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidDescriptor(s.to_string());

        if let Some(id) = s.strip_prefix("pipe://") {
            let worker_id = id.parse().map_err(|_| invalid())?;
            return Ok(Self::Pipe { worker_id });
        }

        let rest = s.strip_prefix("tcp://").ok_or_else(invalid)?;
        let (authority, query) = rest.split_once('?').ok_or_else(invalid)?;
        let addr = authority.parse().map_err(|_| invalid())?;
        let session_id = query
            .split('&')
            .find_map(|pair| pair.strip_prefix("sessionId="))
            .filter(|id| !id.is_empty())
            .ok_or_else(invalid)?;
        Ok(Self::Tcp {
            addr,
            session_id: session_id.to_string(),
        })
    }
}

/// Process-pipe transport.
pub struct PipeChannel {
    worker_id: u32,
    events: Option<BoxedReader>,
    commands: Option<BoxedWriter>,
    attached: bool,
    closed: CancellationToken,
}

impl PipeChannel {
    pub fn new(worker_id: u32) -> Self {
        Self {
            worker_id,
            events: None,
            commands: None,
            attached: false,
            closed: CancellationToken::new(),
        }
    }
}

/// Loopback socket transport.
pub struct SocketChannel {
    worker_id: u32,
    local_addr: SocketAddr,
    session_id: String,
    connect_timeout: Duration,
    accept: Option<oneshot::Receiver<io::Result<TcpStream>>>,
    accept_task: JoinHandle<()>,
    events: Option<BoxedReader>,
    commands: Option<BoxedWriter>,
    native_output: Option<BoxedReader>,
    connected: bool,
    closed: CancellationToken,
}

impl SocketChannel {
    /// Bind the listener. Must happen before the worker is spawned.
    pub async fn bind(worker_id: u32, connect_timeout: Duration) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let local_addr = listener.local_addr()?;
        let session_id = uuid::Uuid::new_v4().to_string();

        tracing::debug!(
            worker_id,
            transport_type = "tcp",
            addr = %local_addr,
            "Bound fork channel listener"
        );

        let (tx, rx) = oneshot::channel();
        let accept_task = tokio::spawn(async move {
            let result = listener.accept().await.map(|(stream, peer)| {
                tracing::trace!(worker_id, peer = %peer, "Worker connected");
                stream
            });
            let _ = tx.send(result);
        });

        Ok(Self {
            worker_id,
            local_addr,
            session_id,
            connect_timeout,
            accept: Some(rx),
            accept_task,
            events: None,
            commands: None,
            native_output: None,
            connected: false,
            closed: CancellationToken::new(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.connected {
            return Err(TransportError::AlreadyConnected);
        }
        let accept = self.accept.take().ok_or(TransportError::NotConnected)?;

        let mut stream = tokio::time::timeout(self.connect_timeout, async {
            match accept.await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::NotConnected, "accept task ended")),
            }
        })
        .await
        .map_err(|_| TransportError::ConnectTimeout(self.connect_timeout))??;

        // A worker that hangs up early presents a short token.
        let mut token = Vec::with_capacity(self.session_id.len());
        let mut limited = (&mut stream).take(self.session_id.len() as u64);
        tokio::time::timeout(self.connect_timeout, limited.read_to_end(&mut token))
            .await
            .map_err(|_| TransportError::ConnectTimeout(self.connect_timeout))??;

        if token != self.session_id.as_bytes() {
            let actual = String::from_utf8_lossy(&token).into_owned();
            tracing::error!(
                worker_id = self.worker_id,
                expected = %self.session_id,
                actual = %actual,
                "Worker presented an invalid session id"
            );
            return Err(TransportError::InvalidSession {
                expected: self.session_id.clone(),
                actual,
            });
        }

        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        self.events = Some(Box::new(read));
        self.commands = Some(Box::new(write));
        self.connected = true;
        tracing::debug!(worker_id = self.worker_id, "Fork channel session verified");
        Ok(())
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Transport between the controller and one worker.
pub enum ForkChannel {
    Pipe(PipeChannel),
    Socket(SocketChannel),
}

impl ForkChannel {
    pub fn worker_id(&self) -> u32 {
        match self {
            Self::Pipe(p) => p.worker_id,
            Self::Socket(s) => s.worker_id,
        }
    }

    /// Descriptor the worker uses to reach this channel.
    pub fn connection_descriptor(&self) -> ConnectionDescriptor {
        match self {
            Self::Pipe(p) => ConnectionDescriptor::Pipe {
                worker_id: p.worker_id,
            },
            Self::Socket(s) => ConnectionDescriptor::Tcp {
                addr: s.local_addr,
                session_id: s.session_id.clone(),
            },
        }
    }

    /// Hand over the spawned worker's stdout and stdin.
    ///
    /// For pipes they become the event and command streams. For sockets
    /// stdout is native worker output and stdin is unused.
    pub fn attach_process_streams<R, W>(&mut self, stdout: R, stdin: W)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        match self {
            Self::Pipe(p) => {
                p.events = Some(Box::new(stdout));
                p.commands = Some(Box::new(stdin));
                p.attached = true;
            }
            Self::Socket(s) => {
                s.native_output = Some(Box::new(stdout));
                drop(stdin);
            }
        }
    }

    /// Pipe: no-op. Socket: wait for the worker, then verify its session token.
    /// On failure no stream is handed out, so no pump can start.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        match self {
            Self::Pipe(p) if p.attached => Ok(()),
            Self::Pipe(_) => Err(TransportError::NotConnected),
            Self::Socket(s) => s.connect().await,
        }
    }

    pub fn bind_command_channel(&mut self) -> Result<CommandSink, TransportError> {
        let writer = match self {
            Self::Pipe(p) => take_bound(&mut p.commands, p.attached, "command")?,
            Self::Socket(s) => take_bound(&mut s.commands, s.connected, "command")?,
        };
        Ok(FramedWrite::new(writer, CommandCodec::new()))
    }

    pub fn bind_event_channel(
        &mut self,
        config: &ChannelConfig,
    ) -> Result<EventSource, TransportError> {
        let reader = match self {
            Self::Pipe(p) => take_bound(&mut p.events, p.attached, "event")?,
            Self::Socket(s) => take_bound(&mut s.events, s.connected, "event")?,
        };
        let codec = EventCodec::new().with_max_segment_len(config.max_segment_len);
        Ok(FramedRead::new(reader, codec))
    }

    /// Worker stdout that is not the event channel (socket mode only).
    pub fn take_native_output(&mut self) -> Option<BoxedReader> {
        match self {
            Self::Pipe(_) => None,
            Self::Socket(s) => s.native_output.take(),
        }
    }

    /// Number of dispatch loops that must finish before the transport closes.
    pub fn countdown_permits(&self) -> usize {
        match self {
            Self::Pipe(_) => PIPE_PERMITS,
            Self::Socket(_) => SOCKET_PERMITS,
        }
    }

    fn closed_token(&self) -> &CancellationToken {
        match self {
            Self::Pipe(p) => &p.closed,
            Self::Socket(s) => &s.closed,
        }
    }

    /// Signal that the transport is closed. Idempotent.
    pub fn close(&self) {
        if !self.closed_token().is_cancelled() {
            tracing::debug!(worker_id = self.worker_id(), "Closing fork channel");
        }
        self.closed_token().cancel();
        if let Self::Socket(s) = self {
            s.accept_task.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed_token().is_cancelled()
    }

    /// Token cancelled by [`ForkChannel::close`]; dispatch loops watch it.
    pub fn close_token(&self) -> CancellationToken {
        self.closed_token().clone()
    }
}

fn take_bound<T>(
    slot: &mut Option<T>,
    ready: bool,
    which: &'static str,
) -> Result<T, TransportError> {
    if !ready {
        return Err(TransportError::NotConnected);
    }
    slot.take().ok_or(TransportError::AlreadyBound(which))
}

/// Open the configured transport for one worker, before it is spawned.
pub async fn create_transport(
    config: &ChannelConfig,
    worker_id: u32,
) -> Result<ForkChannel, TransportError> {
    match config.transport {
        TransportKind::Pipe => {
            tracing::debug!(worker_id, transport_type = "pipe", "Creating fork channel");
            Ok(ForkChannel::Pipe(PipeChannel::new(worker_id)))
        }
        TransportKind::Tcp => {
            let channel = SocketChannel::bind(worker_id, config.connect_timeout).await?;
            Ok(ForkChannel::Socket(channel))
        }
    }
}
