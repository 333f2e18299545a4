//! # Receive Path
//!
//! Every session — accepted or dialed — gets a reader task that deframes
//! messages and hands them to the dispatcher. A frame may span any number
//! of reads: the reader first takes the fixed prefix, learns the header and
//! payload lengths from it, then accumulates the tail before decoding.
//!
//! Dispatch order for a decoded message:
//!
//! 1. route-table data is diverted to the collector's feed;
//! 2. a call-flagged frame whose call id indexes an armed chute with a
//!    matching transaction id wakes that caller;
//! 3. a transaction id a single-threaded caller registered for wakes it;
//! 4. everything else goes to the application ring — when the ring is full
//!    the message is dropped and counted.
//!
//! Within one session messages reach the ring in arrival order; across
//! sessions no order is promised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::transport::{ConnReader, Listener};
use super::{Endpoint, SessionWriter};
use crate::chute::ChuteTable;
use crate::error::RmrError;
use crate::msg::{frame_sizes, MsgBuf, FLAG_CALL_MSG, FRAME_PROBE_LEN, XID_LEN};
use crate::mtypes;
use crate::ring::Ring;

/// Central receive-side state shared by every reader task.
pub struct Dispatcher {
    ring: Ring<MsgBuf>,
    chutes: ChuteTable,
    xid_waiters: Mutex<HashMap<[u8; XID_LEN], oneshot::Sender<MsgBuf>>>,
    rtc_feed: Mutex<Option<mpsc::UnboundedSender<MsgBuf>>>,
    rts_sessions: Mutex<HashMap<String, SessionWriter>>,
    drops: AtomicU64,
    shutdown: AtomicBool,
    max_frame: usize,
}

impl Dispatcher {
    pub(crate) fn new(ring_size: usize, max_frame: usize) -> Result<Self, RmrError> {
        Ok(Self {
            // the application may drain from several threads; gate reads
            ring: Ring::with_gates(ring_size, true, true)?,
            chutes: ChuteTable::new(),
            xid_waiters: Mutex::new(HashMap::new()),
            rtc_feed: Mutex::new(None),
            rts_sessions: Mutex::new(HashMap::new()),
            drops: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            max_frame,
        })
    }

    pub(crate) fn ring(&self) -> &Ring<MsgBuf> {
        &self.ring
    }

    pub(crate) fn chutes(&self) -> &ChuteTable {
        &self.chutes
    }

    /// Messages dropped because the ring was full.
    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    pub(crate) fn set_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Install the collector's feed; route-table data frames are diverted
    /// here instead of the application ring.
    pub(crate) fn set_rtc_feed(&self, tx: mpsc::UnboundedSender<MsgBuf>) {
        *self.rtc_feed.lock() = Some(tx);
    }

    /// Register interest in a specific transaction id (single-threaded
    /// call). The previous waiter for the same id, if any, is dropped.
    pub(crate) fn arm_xid(&self, xid: [u8; XID_LEN]) -> oneshot::Receiver<MsgBuf> {
        let (tx, rx) = oneshot::channel();
        self.xid_waiters.lock().insert(xid, tx);
        rx
    }

    pub(crate) fn disarm_xid(&self, xid: &[u8; XID_LEN]) {
        self.xid_waiters.lock().remove(xid);
    }

    /// Writer of the inbound session that last carried traffic from `src`;
    /// the return-to-sender path prefers this over dialing back.
    pub(crate) fn rts_writer(&self, src: &str) -> Option<SessionWriter> {
        self.rts_sessions.lock().get(src).cloned()
    }

    fn register_rts(&self, src: &str, writer: &SessionWriter) {
        self.rts_sessions.lock().insert(src.to_string(), Arc::clone(writer));
    }

    pub(crate) fn drop_rts(&self, src: &str, writer: &SessionWriter) {
        let mut sessions = self.rts_sessions.lock();
        if let Some(current) = sessions.get(src) {
            if Arc::ptr_eq(current, writer) {
                sessions.remove(src);
            }
        }
    }

    /// Route one decoded message to its consumer.
    pub(crate) fn dispatch(&self, msg: MsgBuf) {
        let mut msg = msg;

        if msg.mtype == mtypes::TABLE_DATA {
            let feed = self.rtc_feed.lock().clone();
            if let Some(tx) = feed {
                match tx.send(msg) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(m)) => msg = m, // collector gone
                }
            }
        }

        if msg.header_flags() & FLAG_CALL_MSG != 0 {
            let call_id = msg.call_id();
            match self.chutes.try_deliver(call_id, msg) {
                Ok(()) => return,
                Err(m) => msg = m, // unarmed or stale; deliver normally
            }
        }

        let waiter = self.xid_waiters.lock().remove(msg.xaction());
        if let Some(tx) = waiter {
            match tx.send(msg) {
                Ok(()) => return,
                Err(m) => msg = m, // caller timed out already
            }
        }

        if self.ring.insert(msg).is_err() {
            self.drops.fetch_add(1, Ordering::Relaxed);
            debug!("receive ring full; message dropped");
        }
    }
}

/// Accept sessions until shutdown, spawning a reader per session.
pub(crate) fn spawn_listener(listener: Box<dyn Listener>, disp: Arc<Dispatcher>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok(conn) => {
                    if disp.is_shutdown() {
                        return;
                    }
                    let writer: SessionWriter = Arc::new(tokio::sync::Mutex::new(conn.writer));
                    spawn_session_reader(conn.reader, Arc::clone(&disp), Some(writer), None);
                }
                Err(e) => {
                    if disp.is_shutdown() {
                        return;
                    }
                    warn!("accept failed: {}", e);
                    return;
                }
            }
        }
    })
}

/// Read frames from one session until EOF, error, or shutdown.
///
/// For an inbound session `rts_writer` holds the write half: it is
/// registered under the peer's advertised source on the first frame so
/// replies can reuse the session. For a dialed session `ep` is the owning
/// endpoint; its open flag is cleared when the session dies.
pub(crate) fn spawn_session_reader(
    mut reader: ConnReader,
    disp: Arc<Dispatcher>,
    rts_writer: Option<SessionWriter>,
    ep: Option<Arc<Endpoint>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut registered_src: Option<String> = None;

        loop {
            let frame = match read_frame(&mut reader, disp.max_frame).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break, // clean EOF
                Err(e) => {
                    if !disp.is_shutdown() {
                        debug!("session read ended: {}", e);
                    }
                    break;
                }
            };
            if disp.is_shutdown() {
                break;
            }

            let msg = match MsgBuf::decode_frame(frame) {
                Ok(m) => m,
                Err(e) => {
                    warn!("bad frame dropped: {}", e);
                    continue;
                }
            };

            if let Some(ep) = &ep {
                ep.bump_received();
            }

            if let (Some(writer), None) = (&rts_writer, &registered_src) {
                let src = msg.src().to_string();
                if !src.is_empty() {
                    disp.register_rts(&src, writer);
                    registered_src = Some(src);
                }
            }

            disp.dispatch(msg);
        }

        if let (Some(writer), Some(src)) = (&rts_writer, &registered_src) {
            disp.drop_rts(src, writer);
        }
        if let Some(ep) = &ep {
            ep.mark_closed();
        }
    })
}

/// Read exactly one frame; `None` on clean EOF before any byte.
///
/// The header prefix is read first so the total size is known; the
/// remainder may arrive in as many pieces as the network cares to deliver.
async fn read_frame(reader: &mut ConnReader, max_frame: usize) -> std::io::Result<Option<Vec<u8>>> {
    let mut frame = vec![0u8; 12];
    match reader.read_exact(&mut frame[..12]).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let version = i32::from_be_bytes([frame[8], frame[9], frame[10], frame[11]]);
    if version != 1 {
        frame.resize(FRAME_PROBE_LEN, 0);
        reader.read_exact(&mut frame[12..]).await?;
    }

    let (hdr_len, payload_len) = frame_sizes(&frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    let total = hdr_len + payload_len;
    if total > max_frame {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {total} bytes exceeds limit {max_frame}"),
        ));
    }

    let have = frame.len();
    frame.resize(total, 0);
    if total > have {
        reader.read_exact(&mut frame[have..]).await?;
    }
    Ok(Some(frame))
}
