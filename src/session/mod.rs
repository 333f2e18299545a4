//! # Endpoint and Session Management
//!
//! An endpoint is a `host:port` destination owning at most one TCP session.
//! Endpoints live in a process-wide registry for the life of the context —
//! route tables hold shared handles into the registry, never owners — so a
//! table swap can never tear a session out from under an in-flight send.
//!
//! Sessions are demand-dialed: the first send to an endpoint connects,
//! under a per-endpoint gate that also serialises the write itself. Other
//! senders arriving while the gate is held simply queue on it; the gate is
//! held only across the connect and the single frame write.

pub mod receiver;
pub mod transport;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::RmrError;
use crate::symtab::SymTab;
use receiver::Dispatcher;
use transport::{ConnWriter, Transport};

/// Symbol-table class for endpoint-name entries.
pub(crate) const EP_SPACE: u32 = 1;

/// Time allowed for one write attempt before it is treated as blocked and
/// the retry budget is consulted.
const SEND_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared writer handle for a session that must also serve return-to-sender
/// traffic (inbound sessions keyed by the sender's advertised source).
pub(crate) type SessionWriter = Arc<tokio::sync::Mutex<ConnWriter>>;

/// One destination. At most one open session at a time; counters cover the
/// life of the process.
pub struct Endpoint {
    name: String,
    proto: &'static str,
    addr: Mutex<String>,
    open: AtomicBool,
    /// Send gate: serialises connect attempts and frame writes.
    gate: tokio::sync::Mutex<Option<ConnWriter>>,
    sent: AtomicU64,
    send_fails: AtomicU64,
    received: AtomicU64,
}

impl Endpoint {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            proto: "tcp",
            addr: Mutex::new(String::new()),
            open: AtomicBool::new(false),
            gate: tokio::sync::Mutex::new(None),
            sent: AtomicU64::new(0),
            send_fails: AtomicU64::new(0),
            received: AtomicU64::new(0),
        }
    }

    /// `host:port` as named by the route table.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn proto(&self) -> &str {
        self.proto
    }

    /// Resolved `ip:port`, empty until the first successful dial.
    pub fn addr(&self) -> String {
        self.addr.lock().clone()
    }

    /// Whether a session is believed open. Cleared by the session reader on
    /// EOF or error; the next send redials.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub(crate) fn bump_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// (sent, send failures, received)
    pub fn counts(&self) -> (u64, u64, u64) {
        (
            self.sent.load(Ordering::Relaxed),
            self.send_fails.load(Ordering::Relaxed),
            self.received.load(Ordering::Relaxed),
        )
    }
}

/// Process-wide endpoint set keyed by `host:port`. Entries are created on
/// first reference and never deleted during normal operation.
pub struct EndpointRegistry {
    eps: Mutex<SymTab<Arc<Endpoint>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self { eps: Mutex::new(SymTab::new()) }
    }

    /// Fetch the endpoint for `name`, creating it if first seen.
    pub fn ensure(&self, name: &str) -> Arc<Endpoint> {
        let mut eps = self.eps.lock();
        if let Some(ep) = eps.get(name, EP_SPACE) {
            return ep;
        }
        let ep = Arc::new(Endpoint::new(name));
        eps.put(name, EP_SPACE, Arc::clone(&ep));
        ep
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.eps.lock().get(name, EP_SPACE)
    }

    /// Snapshot of every registered endpoint (stat dumps).
    pub fn all(&self) -> Vec<Arc<Endpoint>> {
        let mut out = Vec::new();
        self.eps.lock().foreach_class(EP_SPACE, |_, ep| out.push(Arc::clone(ep)));
        out
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the transport and drives endpoint sessions: dialing, framed writes
/// with bounded retries, and teardown on hard errors.
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
}

impl SessionManager {
    pub(crate) fn new(transport: Arc<dyn Transport>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { transport, dispatcher }
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Dial the endpoint under its gate when no session is open. The read
    /// half goes straight to a reader task; the write half is installed
    /// behind the gate.
    async fn dial_locked(
        &self,
        ep: &Arc<Endpoint>,
        gate: &mut Option<ConnWriter>,
    ) -> Result<(), RmrError> {
        // a reader noticing EOF only flips the open flag; the stale writer
        // is discarded here, at the next use
        if !ep.is_open() {
            *gate = None;
        }
        if gate.is_some() {
            return Ok(());
        }

        match self.transport.connect(ep.name()).await {
            Ok(conn) => {
                *ep.addr.lock() = conn.peer.to_string();
                ep.open.store(true, Ordering::Release);
                *gate = Some(conn.writer);
                receiver::spawn_session_reader(
                    conn.reader,
                    Arc::clone(&self.dispatcher),
                    None,
                    Some(Arc::clone(ep)),
                );
                debug!("session open to {} ({})", ep.name(), ep.addr());
                Ok(())
            }
            Err(e) => {
                ep.send_fails.fetch_add(1, Ordering::Relaxed);
                debug!("dial {} failed: {}", ep.name(), e);
                Err(RmrError::NotConnected(ep.name().to_string()))
            }
        }
    }

    /// Connect now if no session is open (wormhole open dials eagerly).
    pub(crate) async fn ensure_session(&self, ep: &Arc<Endpoint>) -> Result<(), RmrError> {
        let mut gate = ep.gate.lock().await;
        self.dial_locked(ep, &mut gate).await
    }

    /// Write one frame to the endpoint, dialing first when no session is
    /// open. `retries` extra attempts are made when a write stays blocked
    /// past its attempt budget; a hard error closes the session so the next
    /// send reconnects.
    pub(crate) async fn send_frame(
        &self,
        ep: &Arc<Endpoint>,
        frame: &[u8],
        retries: u32,
    ) -> Result<(), RmrError> {
        let mut gate = ep.gate.lock().await;

        for _attempt in 0..=retries {
            self.dial_locked(ep, &mut gate).await?;
            let writer = gate.as_mut().expect("session installed above");

            match tokio::time::timeout(SEND_ATTEMPT_TIMEOUT, write_frame(writer, frame)).await {
                Ok(Ok(())) => {
                    ep.sent.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Ok(Err(e)) => {
                    // hard failure: close so a later send reconnects
                    warn!("send to {} failed: {}; closing session", ep.name(), e);
                    *gate = None;
                    ep.mark_closed();
                    ep.send_fails.fetch_add(1, Ordering::Relaxed);
                    return Err(RmrError::Io(e));
                }
                Err(_blocked) => {
                    // an abandoned write may have left a partial frame on
                    // the stream; the session cannot be reused
                    *gate = None;
                    ep.mark_closed();
                }
            }
        }

        ep.send_fails.fetch_add(1, Ordering::Relaxed);
        Err(RmrError::Io(std::io::Error::from(std::io::ErrorKind::WouldBlock)))
    }

    /// Write one frame on an already-established inbound session (return to
    /// sender). No retries here: the session either takes the frame or the
    /// caller falls back to dialing the source.
    pub(crate) async fn send_on_writer(&self, writer: &SessionWriter, frame: &[u8]) -> Result<(), RmrError> {
        let mut w = writer.lock().await;
        match tokio::time::timeout(SEND_ATTEMPT_TIMEOUT, write_frame(&mut *w, frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RmrError::Io(e)),
            Err(_) => Err(RmrError::Io(std::io::Error::from(std::io::ErrorKind::WouldBlock))),
        }
    }

    /// Tear down the endpoint's session, if any.
    pub(crate) async fn close_session(&self, ep: &Arc<Endpoint>) {
        let mut gate = ep.gate.lock().await;
        if let Some(mut w) = gate.take() {
            let _ = w.shutdown().await;
        }
        ep.mark_closed();
    }
}

async fn write_frame(writer: &mut ConnWriter, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
