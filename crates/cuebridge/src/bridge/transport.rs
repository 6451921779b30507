//! Socket transport between the bridge and the GUI.
//!
//! Two implementations share one contract:
//! - **Datagram** (UDP): one OSC packet per datagram.
//! - **Stream** (TCP): length-prefixed OSC packets, see [`OscStreamCodec`].
//!
//! The bridge owns a listening [`Endpoint`] (server role) and a [`GuiClient`]
//! pointed at the GUI's own listening port (client role).

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

use super::codec::{OscStreamCodec, encode_for};
use super::osc::{OscError, OscMessage, decode_packet};

/// Largest datagram we accept (the UDP payload limit).
const MAX_DATAGRAM_BYTES: usize = 65_536;
/// Bound on every connect to the GUI, so an unresponsive host cannot stall the pump.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportKind {
    #[default]
    Datagram,
    Stream,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Datagram => "udp",
            Self::Stream => "tcp",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" | "datagram" => Ok(Self::Datagram),
            "tcp" | "stream" => Ok(Self::Stream),
            other => Err(format!(
                "invalid transport '{other}', expected 'udp' or 'tcp'"
            )),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The listening port could not be bound. Fatal at startup.
    #[error("failed to open server port {port}")]
    PortUnavailable {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The GUI is not (or no longer) listening.
    #[error("GUI at {addr} is not listening")]
    PeerUnreachable {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("failed to encode outbound message")]
    Encode(#[from] OscError),

    #[error("transport I/O error")]
    Io(#[from] io::Error),
}

fn classify_send_error(addr: SocketAddr, source: io::Error) -> TransportError {
    match source.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::TimedOut => TransportError::PeerUnreachable { addr, source },
        _ => TransportError::Io(source),
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| TransportError::Resolve(format!("{host}:{port}")))
}

/// Listening side: receives packets from the GUI.
pub enum Endpoint {
    Datagram(UdpSocket),
    Stream(TcpListener),
}

impl Endpoint {
    /// Bind the listening port.
    ///
    /// Any failure here is reported as [`TransportError::PortUnavailable`]
    /// so the lifecycle can turn it into a boot error.
    pub async fn bind(kind: TransportKind, host: &str, port: u16) -> Result<Self, TransportError> {
        let unavailable = |source| TransportError::PortUnavailable { port, source };
        let endpoint = match kind {
            TransportKind::Datagram => {
                Self::Datagram(UdpSocket::bind((host, port)).await.map_err(unavailable)?)
            }
            TransportKind::Stream => {
                Self::Stream(TcpListener::bind((host, port)).await.map_err(unavailable)?)
            }
        };
        tracing::debug!(transport = %kind, host, port, "Bound listening endpoint");
        Ok(endpoint)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Datagram(socket) => socket.local_addr(),
            Self::Stream(listener) => listener.local_addr(),
        }
    }

    /// Receive until `tx` is closed, forwarding every decoded message.
    ///
    /// Malformed packets are dropped. With the stream transport every
    /// accepted connection gets its own reader task, but all of them feed
    /// the same channel so messages are still handled one at a time.
    pub async fn run(self, tx: mpsc::Sender<OscMessage>) {
        match self {
            Self::Datagram(socket) => receive_datagrams(socket, tx).await,
            Self::Stream(listener) => accept_connections(listener, tx).await,
        }
        tracing::debug!("Receive loop finished");
    }
}

async fn receive_datagrams(socket: UdpSocket, tx: mpsc::Sender<OscMessage>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            _ = tx.closed() => break,
        };
        let (len, peer) = match received {
            Ok(v) => v,
            Err(e) => {
                // ICMP errors from earlier sends surface here on some platforms.
                tracing::debug!(error = %e, "Datagram receive failed");
                continue;
            }
        };
        let Some(packet) = buf.get(..len) else {
            continue;
        };
        if !forward(&tx, decode_packet(packet), peer).await {
            break;
        }
    }
}

async fn accept_connections(listener: TcpListener, tx: mpsc::Sender<OscMessage>) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = tx.closed() => break,
        };
        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "GUI connected");
                let reader = FramedRead::new(stream, OscStreamCodec::new());
                tokio::spawn(connection_reader_task(peer, reader, tx.clone()));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept connection");
            }
        }
    }
}

async fn connection_reader_task(
    peer: SocketAddr,
    mut reader: FramedRead<TcpStream, OscStreamCodec>,
    tx: mpsc::Sender<OscMessage>,
) {
    loop {
        match reader.next().await {
            Some(Ok(decoded)) => {
                if !forward(&tx, decoded, peer).await {
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(%peer, error = %e, "Connection reader error");
                break;
            }
            None => {
                tracing::debug!(%peer, "GUI disconnected");
                break;
            }
        }
    }
}

/// Returns false once the receiving side has gone away.
async fn forward(
    tx: &mpsc::Sender<OscMessage>,
    decoded: Result<Vec<OscMessage>, OscError>,
    peer: SocketAddr,
) -> bool {
    match decoded {
        Ok(messages) => {
            for message in messages {
                if tx.send(message).await.is_err() {
                    return false;
                }
            }
        }
        Err(e) => {
            tracing::warn!(%peer, error = %e, "Dropping malformed packet");
        }
    }
    true
}

enum ClientSocket {
    Datagram(UdpSocket),
    /// Connected lazily and kept open between sends.
    Stream(Option<TcpStream>),
}

/// Client side: sends packets to the GUI's listening port.
pub struct GuiClient {
    kind: TransportKind,
    addr: SocketAddr,
    socket: ClientSocket,
}

impl GuiClient {
    pub async fn connect(kind: TransportKind, host: &str, port: u16) -> Result<Self, TransportError> {
        let addr = resolve(host, port).await?;
        let socket = match kind {
            TransportKind::Datagram => {
                let local: SocketAddr = if addr.is_ipv6() {
                    (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
                } else {
                    (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
                };
                let socket = UdpSocket::bind(local).await?;
                socket.connect(addr).await?;
                ClientSocket::Datagram(socket)
            }
            TransportKind::Stream => ClientSocket::Stream(None),
        };
        tracing::debug!(transport = %kind, %addr, "GUI client ready");
        Ok(Self { kind, addr, socket })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn send(&mut self, message: &OscMessage) -> Result<(), TransportError> {
        let bytes = encode_for(self.kind, message)?;
        let addr = self.addr;
        match &mut self.socket {
            ClientSocket::Datagram(socket) => {
                socket
                    .send(&bytes)
                    .await
                    .map_err(|e| classify_send_error(addr, e))?;
            }
            ClientSocket::Stream(slot) => {
                // A cached connection the GUI has since closed gets one
                // reconnect, so a GUI restart does not cost an event.
                if let Some(mut stream) = slot.take().filter(|s| !peer_closed(s)) {
                    match stream.write_all(&bytes).await {
                        Ok(()) => {
                            *slot = Some(stream);
                            return Ok(());
                        }
                        Err(e) => {
                            tracing::debug!(%addr, error = %e, "GUI connection lost, reconnecting");
                        }
                    }
                }
                let mut stream =
                    connect_within(addr, CONNECT_TIMEOUT, TcpStream::connect(addr)).await?;
                stream.set_nodelay(true)?;
                tracing::debug!(%addr, "Connected to GUI");
                stream
                    .write_all(&bytes)
                    .await
                    .map_err(|e| classify_send_error(addr, e))?;
                *slot = Some(stream);
            }
        }
        Ok(())
    }
}

/// The GUI never writes on the event connection, so EOF or an error on a
/// non-blocking read means it closed or reset the connection.
fn peer_closed(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 1];
    match stream.try_read(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => e.kind() != io::ErrorKind::WouldBlock,
    }
}

async fn connect_within<F>(
    addr: SocketAddr,
    limit: Duration,
    connect: F,
) -> Result<TcpStream, TransportError>
where
    F: Future<Output = io::Result<TcpStream>>,
{
    match tokio::time::timeout(limit, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(TransportError::PeerUnreachable { addr, source }),
        Err(_) => Err(TransportError::PeerUnreachable {
            addr,
            source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
        }),
    }
}

/// One-shot blocking send, used where the async pump is not running
/// (boot failure and the exit finalizer).
pub fn send_blocking(
    kind: TransportKind,
    addr: SocketAddr,
    message: &OscMessage,
) -> Result<(), TransportError> {
    use std::io::Write;

    let bytes = encode_for(kind, message)?;
    match kind {
        TransportKind::Datagram => {
            let local: SocketAddr = if addr.is_ipv6() {
                (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
            } else {
                (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
            };
            let socket = std::net::UdpSocket::bind(local)?;
            socket
                .send_to(&bytes, addr)
                .map_err(|e| classify_send_error(addr, e))?;
        }
        TransportKind::Stream => {
            let mut stream = std::net::TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
                .map_err(|source| TransportError::PeerUnreachable { addr, source })?;
            stream
                .write_all(&bytes)
                .map_err(|e| classify_send_error(addr, e))?;
        }
    }
    Ok(())
}
