//! Narrow transport seam.
//!
//! The routing core assumes only that a transport can connect, listen,
//! accept, read and write with TCP stream semantics. That capability set is
//! expressed as a trait so tests can interpose and so a future transport
//! can slot in without touching the send or receive paths. The TCP
//! implementation tunes each socket for low-latency small messages.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Read half of an established session.
pub type ConnReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write half of an established session.
pub type ConnWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An established, full-duplex session split into its two halves.
pub struct Conn {
    pub reader: ConnReader,
    pub writer: ConnWriter,
    /// Resolved peer address (`ip:port`).
    pub peer: SocketAddr,
}

/// Something that accepts inbound sessions.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> io::Result<Conn>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Capability set the routing core needs from a transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Dial `addr` (`host:port`; the host may need resolving).
    async fn connect(&self, addr: &str) -> io::Result<Conn>;

    /// Bind a listener on `bind` (`ip:port`).
    async fn listen(&self, bind: &str) -> io::Result<Box<dyn Listener>>;
}

/// Plain TCP transport.
pub struct TcpTransport {
    buffer_size: usize,
}

impl TcpTransport {
    pub fn new(buffer_size: usize) -> Self {
        Self { buffer_size }
    }

    /// Apply latency-oriented socket options and convert back to a tokio
    /// stream. Option failures are not fatal; the defaults still work.
    fn tune(&self, stream: TcpStream) -> io::Result<TcpStream> {
        let std_stream = stream.into_std()?;
        let socket = socket2::Socket::from(std_stream.try_clone()?);
        let _ = socket.set_nodelay(true);
        let _ = socket.set_recv_buffer_size(self.buffer_size);
        let _ = socket.set_send_buffer_size(self.buffer_size);
        TcpStream::from_std(std_stream)
    }

    fn split(stream: TcpStream) -> io::Result<Conn> {
        let peer = stream.peer_addr()?;
        let (r, w) = stream.into_split();
        Ok(Conn { reader: Box::new(r), writer: Box::new(w), peer })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: &str) -> io::Result<Conn> {
        debug!("dialing {}", addr);
        let stream = TcpStream::connect(addr).await?;
        let stream = self.tune(stream)?;
        Self::split(stream)
    }

    async fn listen(&self, bind: &str) -> io::Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(bind).await?;
        debug!("listening on {}", listener.local_addr()?);
        Ok(Box::new(TcpAcceptor { listener, buffer_size: self.buffer_size }))
    }
}

struct TcpAcceptor {
    listener: TcpListener,
    buffer_size: usize,
}

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&self) -> io::Result<Conn> {
        let (stream, peer) = self.listener.accept().await?;
        debug!("accepted session from {}", peer);

        let std_stream = stream.into_std()?;
        let socket = socket2::Socket::from(std_stream.try_clone()?);
        let _ = socket.set_nodelay(true);
        let _ = socket.set_recv_buffer_size(self.buffer_size);
        let _ = socket.set_send_buffer_size(self.buffer_size);
        TcpTransport::split(TcpStream::from_std(std_stream)?)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}
