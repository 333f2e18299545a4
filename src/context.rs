//! # Library Context and Public Operations
//!
//! The context is the handle returned by [`Context::init`] and passed to
//! every operation. It owns the listener, the endpoint registry, the
//! receive dispatcher with its ring and chutes, the wormhole table, and the
//! active route table slot; the route-table collector task maintains the
//! table behind it.
//!
//! ## Result convention
//!
//! Send and receive operations never fail with `Result`: every call hands
//! back a message buffer whose `state` tells the caller what happened (see
//! [`MsgState`]). A successful send returns a fresh empty buffer so the
//! caller can reuse it immediately; a failed send returns the caller's
//! buffer untouched so it can be retried.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EnvConfig;
use crate::error::{MsgState, RmrError};
use crate::msg::{MsgBuf, FLAG_CALL_MSG, UNSET_MSGTYPE};
use crate::route::{rtc, RouteTable};
use crate::session::receiver::{self, Dispatcher};
use crate::session::transport::{TcpTransport, Transport};
use crate::session::{Endpoint, EndpointRegistry, SessionManager};
use crate::wormhole::{WhId, WormholeMgr};

/// Messages queued for the application before the ring pushes back.
const RECEIVE_RING_SIZE: usize = 4096;

/// Socket buffer sizing applied to every session.
const SOCKET_BUF_SIZE: usize = 8192;

/// Slack added over the payload limit for header and ancillary regions.
const FRAME_SLACK: usize = 4096;

/// Default payload capacity when a caller passes 0 to `init`.
const DEF_MAX_PAYLOAD: usize = 4096;

/// Bytes of d1 region reserved when threaded calls are enabled (byte 0
/// carries the call id).
const CALL_D1_LEN: usize = 4;

/// Behaviour flags accepted by [`Context::init`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitFlags {
    /// Do not start the route-table collector task.
    pub no_thread: bool,
    /// Enable threaded calls: reserves the d1 region on allocations and
    /// arms the chute table.
    pub mt_call: bool,
    /// Stamp the source fields with the host name only, never the IP.
    pub name_only: bool,
}

impl InitFlags {
    pub fn no_thread(mut self) -> Self {
        self.no_thread = true;
        self
    }

    pub fn mt_call(mut self) -> Self {
        self.mt_call = true;
        self
    }

    pub fn name_only(mut self) -> Self {
        self.name_only = true;
        self
    }
}

/// The library context. Create with [`Context::init`]; share by `Arc`.
pub struct Context {
    my_name: String,
    my_ip: String,
    listen_port: String,
    max_plen: usize,
    max_mlen: usize,
    flags: InitFlags,
    env: EnvConfig,

    trace_data_len: AtomicUsize,
    d1_len: usize,
    send_retries: AtomicU32,
    rcv_retries: AtomicU32,

    registry: EndpointRegistry,
    dispatcher: Arc<Dispatcher>,
    sessions: SessionManager,
    wormholes: WormholeMgr,

    route: RwLock<Arc<RouteTable>>,
    /// Previous active table, parked one generation for draining.
    old_route: Mutex<Option<Arc<RouteTable>>>,
    route_ready: AtomicBool,
    /// True once a complete table arrived from the route manager (a seed
    /// table flips `route_ready` but not this).
    full_table: AtomicBool,

    rcv_ready: AsyncFd<RawFd>,
    shutdown: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Context {
    /// Initialise: bind the listener on `port`, start the collector (unless
    /// `no_thread`), and return the shared context.
    ///
    /// `max_msg_size` is the largest payload the application will send or
    /// receive; 0 selects a default.
    pub async fn init(port: &str, max_msg_size: usize, flags: InitFlags) -> Result<Arc<Self>, RmrError> {
        let env = EnvConfig::from_env();
        let mut flags = flags;
        flags.name_only |= env.name_only;

        let port = port.trim_start_matches("tcp:").to_string();
        if port.is_empty() || port.parse::<u16>().is_err() {
            return Err(RmrError::Init(format!("listen port ({port}) is not a port number")));
        }

        let max_plen = if max_msg_size == 0 { DEF_MAX_PAYLOAD } else { max_msg_size };
        let max_mlen = max_plen + FRAME_SLACK;

        let host = nix::unistd::gethostname()
            .map_err(|e| RmrError::Init(format!("hostname: {e}")))?
            .to_string_lossy()
            .into_owned();
        let my_name = format!("{host}:{port}");
        let my_ip = match flags.name_only {
            true => my_name.clone(),
            false => format!("{}:{}", default_ip(&env.bind_if).unwrap_or_else(|| host.clone()), port),
        };

        let dispatcher = Arc::new(Dispatcher::new(RECEIVE_RING_SIZE, max_mlen)?);
        let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(SOCKET_BUF_SIZE));
        let sessions = SessionManager::new(Arc::clone(&transport), Arc::clone(&dispatcher));

        let listener = transport
            .listen(&format!("{}:{}", env.bind_if, port))
            .await
            .map_err(|e| RmrError::Init(format!("cannot bind listen port {port}: {e}")))?;

        let rcv_ready = AsyncFd::new(dispatcher.ring().pollable_fd())
            .map_err(|e| RmrError::Init(format!("ring fd registration: {e}")))?;

        let ctx = Arc::new(Self {
            my_name,
            my_ip,
            listen_port: port,
            max_plen,
            max_mlen,
            flags,
            env,
            trace_data_len: AtomicUsize::new(0),
            d1_len: if flags.mt_call { CALL_D1_LEN } else { 0 },
            send_retries: AtomicU32::new(1),
            rcv_retries: AtomicU32::new(0),
            registry: EndpointRegistry::new(),
            dispatcher: Arc::clone(&dispatcher),
            sessions,
            wormholes: WormholeMgr::new(),
            route: RwLock::new(Arc::new(RouteTable::new())),
            old_route: Mutex::new(None),
            route_ready: AtomicBool::new(false),
            full_table: AtomicBool::new(false),
            rcv_ready,
            shutdown: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let listen_task = receiver::spawn_listener(listener, dispatcher);
        ctx.tasks.lock().push(listen_task);

        if !flags.no_thread {
            let rtc_task = rtc::spawn(Arc::clone(&ctx));
            ctx.tasks.lock().push(rtc_task);
        }

        info!("context initialised: {} (max payload {})", ctx.my_name, ctx.max_plen);
        Ok(ctx)
    }

    /// `hostname:port` stamped as the source of outbound messages.
    pub fn my_name(&self) -> &str {
        &self.my_name
    }

    /// `ip:port` stamped as the source address of outbound messages.
    pub fn my_ip(&self) -> &str {
        &self.my_ip
    }

    pub fn listen_port(&self) -> &str {
        &self.listen_port
    }

    /// True once a complete route table has been installed.
    pub fn ready(&self) -> bool {
        self.route_ready.load(Ordering::Acquire)
    }

    /// Number of send retries attempted when an endpoint stays blocked.
    pub fn set_stimeout(&self, retries: u32) {
        self.send_retries.store(retries, Ordering::Relaxed);
    }

    /// Receive-side retry knob (kept for interface parity; the async
    /// receive path has no spurious wakes to retry over).
    pub fn set_rtimeout(&self, retries: u32) {
        self.rcv_retries.store(retries, Ordering::Relaxed);
    }

    /// Bytes of trace region reserved in future allocations.
    pub fn set_trace_len(&self, len: usize) {
        self.trace_data_len.store(len, Ordering::Relaxed);
    }

    /// File descriptor that is readable while received messages wait;
    /// applications may multiplex on it instead of blocking in
    /// [`rcv_msg`](Self::rcv_msg).
    pub fn rcv_fd(&self) -> RawFd {
        self.dispatcher.ring().pollable_fd()
    }

    /// Messages dropped because the application ring was full.
    pub fn drop_count(&self) -> u64 {
        self.dispatcher.drop_count()
    }

    // ------------------------------------------------------------------
    // buffer management
    // ------------------------------------------------------------------

    /// Allocate a buffer with at least `size` bytes of payload capacity.
    pub fn alloc_msg(&self, size: usize) -> MsgBuf {
        let size = if size == 0 { self.max_plen } else { size };
        MsgBuf::alloc(size, self.trace_data_len.load(Ordering::Relaxed), self.d1_len, 0)
    }

    /// Allocate with an explicit trace-region size.
    pub fn tralloc_msg(&self, size: usize, trace_len: usize) -> MsgBuf {
        let size = if size == 0 { self.max_plen } else { size };
        MsgBuf::alloc(size, trace_len, self.d1_len, 0)
    }

    /// Grow a buffer's payload capacity to at least `new_size`.
    pub fn realloc_msg(&self, msg: MsgBuf, new_size: usize) -> MsgBuf {
        msg.realloc(new_size)
    }

    /// Release a buffer. Dropping does the same; provided for symmetry.
    pub fn free_msg(&self, msg: MsgBuf) {
        drop(msg);
    }

    // ------------------------------------------------------------------
    // send side
    // ------------------------------------------------------------------

    /// Send by message type and subscription id via the active route table.
    ///
    /// One endpoint per round-robin group receives the frame. On success a
    /// fresh empty buffer comes back; on failure the caller's buffer comes
    /// back with `state` (and `tp_state`) describing why.
    pub async fn send_msg(&self, msg: MsgBuf) -> MsgBuf {
        let mut msg = msg;
        if self.is_shutdown() {
            msg.state = MsgState::BadArg;
            return msg;
        }
        if msg.mtype == UNSET_MSGTYPE {
            msg.state = MsgState::NoEndpoint;
            return msg;
        }

        let rt = self.active_route();
        let Some(rte) = rt.get_rte(msg.sub_id, msg.mtype, true) else {
            debug!("no route for mtype={} subid={}", msg.mtype, msg.sub_id);
            msg.state = MsgState::NoEndpoint;
            return msg;
        };

        if rte.route_by_meid {
            let Some(ep) = rt.meid_endpoint(msg.meid()) else {
                msg.state = MsgState::NoEndpoint;
                return msg;
            };
            return self.send_prepared(msg, &ep).await;
        }

        // fan out: one endpoint from every group
        let groups = rte.group_count();
        let mut targets = Vec::with_capacity(groups);
        for g in 0..groups {
            let (ep, _more) = rte.select(g);
            if let Some(ep) = ep {
                targets.push(ep);
            }
        }
        if targets.is_empty() {
            msg.state = MsgState::NoEndpoint;
            return msg;
        }

        self.send_to_targets(msg, &targets).await
    }

    /// Reply to a received message over the session that delivered it (or a
    /// fresh dial to the advertised source when that session is gone). The
    /// only way to reach a sender with no routing entry.
    pub async fn rts_msg(&self, msg: MsgBuf) -> MsgBuf {
        let mut msg = msg;
        let src = msg.src().to_string();
        if src.is_empty() {
            msg.state = MsgState::NoHeader;
            return msg;
        }

        let mut msg = self.stamp(msg);
        let wire_len = msg.wire_len();
        if wire_len > self.max_mlen {
            msg.state = MsgState::Overflow;
            return msg;
        }

        if let Some(writer) = self.dispatcher.rts_writer(&src) {
            let result = {
                let frame = msg.encode_frame();
                self.sessions.send_on_writer(&writer, frame).await
            };
            match result {
                Ok(()) => return self.fresh_after(msg),
                Err(e) => {
                    // the session may hold a torn frame; forget it and dial
                    self.dispatcher.drop_rts(&src, &writer);
                    debug!("rts over inbound session to {} failed ({}); dialing back", src, e);
                }
            }
        }

        let ep = self.registry.ensure(&src);
        self.send_to_ep(msg, &ep).await
    }

    /// Single-threaded call: send and wait for the reply that carries the
    /// same transaction id. Non-matching traffic keeps flowing to the ring.
    pub async fn call(&self, msg: MsgBuf, timeout_ms: u64) -> MsgBuf {
        let mut msg = msg;
        if msg.xaction().iter().all(|&b| b == 0) {
            msg.fill_xaction();
        }
        let xid = *msg.xaction();
        let waiter = self.dispatcher.arm_xid(xid);

        let sent = self.send_msg(msg).await;
        if !sent.state.is_ok() {
            self.dispatcher.disarm_xid(&xid);
            return sent;
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), waiter).await {
            Ok(Ok(reply)) => reply,
            _ => {
                self.dispatcher.disarm_xid(&xid);
                let mut m = sent;
                m.state = MsgState::Timeout;
                m
            }
        }
    }

    /// Wait for a message carrying a specific transaction id.
    pub async fn rcv_specific(&self, xid: [u8; crate::msg::XID_LEN], timeout_ms: u64) -> MsgBuf {
        let waiter = self.dispatcher.arm_xid(xid);
        match tokio::time::timeout(Duration::from_millis(timeout_ms), waiter).await {
            Ok(Ok(reply)) => reply,
            _ => {
                self.dispatcher.disarm_xid(&xid);
                let mut m = self.alloc_msg(0);
                m.state = MsgState::Timeout;
                m
            }
        }
    }

    /// Threaded call: arm chute `call_id`, stamp the call marker into the
    /// frame, send by route, and park until the dispatcher posts the reply
    /// or the timeout passes. A late reply finds the chute disarmed and is
    /// queued on the ring like any other message.
    pub async fn mt_call(&self, msg: MsgBuf, call_id: usize, timeout_ms: u64) -> MsgBuf {
        let mut msg = msg;
        if !self.flags.mt_call {
            msg.state = MsgState::NotSupported;
            return msg;
        }

        if msg.xaction().iter().all(|&b| b == 0) {
            msg.fill_xaction();
        }
        let xid = *msg.xaction();
        let waiter = match self.dispatcher.chutes().arm(call_id, xid) {
            Ok(rx) => rx,
            Err(_) => {
                msg.state = MsgState::BadArg;
                return msg;
            }
        };

        msg.set_flag(FLAG_CALL_MSG);
        if !msg.set_call_id(call_id as u8) {
            self.dispatcher.chutes().disarm(call_id);
            msg.state = MsgState::BadArg;
            return msg;
        }

        let sent = self.send_msg(msg).await;
        if !sent.state.is_ok() {
            self.dispatcher.chutes().disarm(call_id);
            return sent;
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), waiter).await {
            Ok(Ok(reply)) => reply,
            _ => {
                self.dispatcher.chutes().disarm(call_id);
                let mut m = sent;
                m.state = MsgState::Timeout;
                m
            }
        }
    }

    // ------------------------------------------------------------------
    // receive side
    // ------------------------------------------------------------------

    /// Block until a message is available. The optional `old` buffer is
    /// released and its capacity hint reused.
    pub async fn rcv_msg(&self, old: Option<MsgBuf>) -> MsgBuf {
        drop(old);
        loop {
            if let Some(mut msg) = self.dispatcher.ring().extract() {
                msg.state = MsgState::Ok;
                return msg;
            }
            if self.is_shutdown() {
                let mut m = self.alloc_msg(0);
                m.state = MsgState::Empty;
                return m;
            }

            match self.rcv_ready.readable().await {
                Ok(mut guard) => guard.clear_ready(),
                Err(e) => {
                    warn!("receive wait failed: {}", e);
                    let mut m = self.alloc_msg(0);
                    m.state = MsgState::RcvFailed;
                    m.tp_state = e.raw_os_error().unwrap_or(0);
                    return m;
                }
            }
        }
    }

    /// Like [`rcv_msg`](Self::rcv_msg) but gives up after `timeout_ms`
    /// milliseconds, returning a buffer in the timeout state.
    pub async fn torcv_msg(&self, old: Option<MsgBuf>, timeout_ms: u64) -> MsgBuf {
        match tokio::time::timeout(Duration::from_millis(timeout_ms), self.rcv_msg(old)).await {
            Ok(msg) => msg,
            Err(_) => {
                let mut m = self.alloc_msg(0);
                m.state = MsgState::Timeout;
                m
            }
        }
    }

    // ------------------------------------------------------------------
    // wormholes
    // ------------------------------------------------------------------

    /// Open (or find) a direct session to `addr`, dialing immediately.
    pub async fn wh_open(&self, addr: &str) -> Result<WhId, RmrError> {
        if addr.is_empty() {
            return Err(RmrError::Init("empty wormhole address".into()));
        }
        let ep = self.registry.ensure(addr);
        self.sessions.ensure_session(&ep).await?;
        Ok(self.wormholes.open(ep))
    }

    /// Send directly through a wormhole, bypassing the route table.
    pub async fn wh_send_msg(&self, id: WhId, msg: MsgBuf) -> MsgBuf {
        let mut msg = msg;
        let Some(ep) = self.wormholes.get(id) else {
            msg.state = MsgState::WhId;
            return msg;
        };
        self.send_prepared(msg, &ep).await
    }

    /// Wormhole flavour of [`mt_call`](Self::mt_call).
    pub async fn wh_call(&self, id: WhId, msg: MsgBuf, call_id: usize, timeout_ms: u64) -> MsgBuf {
        let mut msg = msg;
        if !self.flags.mt_call {
            msg.state = MsgState::NotSupported;
            return msg;
        }
        if self.wormholes.get(id).is_none() {
            msg.state = MsgState::WhId;
            return msg;
        }

        if msg.xaction().iter().all(|&b| b == 0) {
            msg.fill_xaction();
        }
        let xid = *msg.xaction();
        let waiter = match self.dispatcher.chutes().arm(call_id, xid) {
            Ok(rx) => rx,
            Err(_) => {
                msg.state = MsgState::BadArg;
                return msg;
            }
        };
        msg.set_flag(FLAG_CALL_MSG);
        if !msg.set_call_id(call_id as u8) {
            self.dispatcher.chutes().disarm(call_id);
            msg.state = MsgState::BadArg;
            return msg;
        }

        let sent = self.wh_send_msg(id, msg).await;
        if !sent.state.is_ok() {
            self.dispatcher.chutes().disarm(call_id);
            return sent;
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), waiter).await {
            Ok(Ok(reply)) => reply,
            _ => {
                self.dispatcher.chutes().disarm(call_id);
                let mut m = sent;
                m.state = MsgState::Timeout;
                m
            }
        }
    }

    /// State of a wormhole id: `Ok` while open.
    pub fn wh_state(&self, id: WhId) -> MsgState {
        match self.wormholes.get(id) {
            Some(_) => MsgState::Ok,
            None => MsgState::WhId,
        }
    }

    /// Release the wormhole slot. The underlying session stays open —
    /// endpoints are shared with the route table and other wormholes.
    pub fn wh_close(&self, id: WhId) -> bool {
        self.wormholes.close(id).is_some()
    }

    // ------------------------------------------------------------------
    // shutdown
    // ------------------------------------------------------------------

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Cooperative shutdown: flag the background tasks, abort the ones
    /// parked in I/O, and close every open session.
    pub async fn close(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.dispatcher.set_shutdown();

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for ep in self.registry.all() {
            self.sessions.close_session(&ep).await;
        }
        info!("context {} closed", self.my_name);
    }

    // ------------------------------------------------------------------
    // crate-internal plumbing
    // ------------------------------------------------------------------

    pub(crate) fn env(&self) -> &EnvConfig {
        &self.env
    }

    pub(crate) fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub(crate) fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub(crate) fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Take a reference to the active table for the duration of one send.
    pub(crate) fn active_route(&self) -> Arc<RouteTable> {
        Arc::clone(&self.route.read())
    }

    /// Install `rt` as the active table: a single pointer swap. The prior
    /// table is parked one generation; the generation before it drops here
    /// and is freed once its last in-flight reference releases.
    pub(crate) fn install_route_table(&self, rt: RouteTable) {
        let fresh = Arc::new(rt);
        let prior = {
            let mut slot = self.route.write();
            std::mem::replace(&mut *slot, fresh)
        };
        *self.old_route.lock() = Some(prior);
        self.route_ready.store(true, Ordering::Release);
    }

    pub(crate) fn mark_full_table(&self) {
        self.full_table.store(true, Ordering::Release);
    }

    pub(crate) fn has_full_table(&self) -> bool {
        self.full_table.load(Ordering::Acquire)
    }

    /// Stamp source identity, converting to the wire layout if the buffer
    /// came from a foreign frame.
    fn stamp(&self, msg: MsgBuf) -> MsgBuf {
        let mut msg = if msg.has_native_layout() { msg } else { msg.to_native_layout() };
        msg.set_src(&self.my_name);
        msg.set_srcip(if self.flags.name_only { &self.my_name } else { &self.my_ip });
        msg
    }

    /// Stamp, size-check, encode and write one frame to `ep`.
    async fn send_prepared(&self, msg: MsgBuf, ep: &Arc<Endpoint>) -> MsgBuf {
        let msg = self.stamp(msg);
        self.send_to_ep(msg, ep).await
    }

    async fn send_to_ep(&self, msg: MsgBuf, ep: &Arc<Endpoint>) -> MsgBuf {
        self.deliver(msg, std::slice::from_ref(ep)).await
    }

    /// Stamp once, then deliver the encoded frame to every target.
    async fn send_to_targets(&self, msg: MsgBuf, targets: &[Arc<Endpoint>]) -> MsgBuf {
        let msg = self.stamp(msg);
        self.deliver(msg, targets).await
    }

    /// Encode `msg` once and write the frame to each endpoint. The frame is
    /// identical for every group member, so one encoding serves the whole
    /// fan-out. On total success a fresh buffer replaces the caller's; if
    /// any write failed the caller's buffer comes back carrying the last
    /// failure so a retry can re-drive it.
    async fn deliver(&self, mut msg: MsgBuf, targets: &[Arc<Endpoint>]) -> MsgBuf {
        if msg.wire_len() > self.max_mlen {
            msg.state = MsgState::Overflow;
            return msg;
        }

        let retries = self.send_retries.load(Ordering::Relaxed);
        let mut failure: Option<(MsgState, i32)> = None;
        {
            let frame = msg.encode_frame();
            for ep in targets {
                if let Err(e) = self.sessions.send_frame(ep, frame, retries).await {
                    let tp = match &e {
                        RmrError::Io(io) => io.raw_os_error().unwrap_or(0),
                        _ => 0,
                    };
                    failure = Some((e.to_state(), tp));
                }
            }
        }

        match failure {
            None => self.fresh_after(msg),
            Some((state, tp)) => {
                msg.state = state;
                msg.tp_state = tp;
                msg
            }
        }
    }

    /// Fresh empty buffer returned after a successful send, sized like the
    /// buffer it replaces.
    fn fresh_after(&self, sent: MsgBuf) -> MsgBuf {
        let capacity = sent.payload_size();
        drop(sent);
        self.alloc_msg(capacity)
    }
}

/// First usable IPv4 address of this host: the bind interface when it names
/// one, otherwise the first non-loopback interface address.
fn default_ip(bind_if: &str) -> Option<String> {
    if bind_if != "0.0.0.0" && !bind_if.is_empty() {
        return Some(bind_if.to_string());
    }

    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    for ifa in addrs {
        if let Some(storage) = ifa.address {
            if let Some(sin) = storage.as_sockaddr_in() {
                let ip = std::net::Ipv4Addr::from(sin.ip());
                if !ip.is_loopback() && !ip.is_unspecified() {
                    return Some(ip.to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_flags_build_up() {
        let f = InitFlags::default().mt_call().name_only();
        assert!(f.mt_call);
        assert!(f.name_only);
        assert!(!f.no_thread);
    }

    #[tokio::test]
    async fn init_rejects_bad_port() {
        assert!(Context::init("not-a-port", 0, InitFlags::default()).await.is_err());
        assert!(Context::init("", 0, InitFlags::default()).await.is_err());
    }

    #[tokio::test]
    async fn alloc_honours_context_defaults() {
        let ctx = Context::init("0", 2048, InitFlags::default().no_thread().mt_call())
            .await
            .unwrap();

        let m = ctx.alloc_msg(0);
        assert_eq!(m.payload_size(), 2048);

        let m = ctx.alloc_msg(64);
        assert_eq!(m.payload_size(), 64);

        ctx.set_trace_len(16);
        let m = ctx.alloc_msg(64);
        assert_eq!(m.trace_len(), 16);

        let m = ctx.tralloc_msg(64, 99);
        assert_eq!(m.trace_len(), 99);

        ctx.close().await;
    }

    #[tokio::test]
    async fn send_without_route_reports_no_endpoint() {
        let ctx = Context::init("0", 512, InitFlags::default().no_thread()).await.unwrap();
        assert!(!ctx.ready());

        let mut m = ctx.alloc_msg(16);
        m.mtype = 1234;
        m.write_payload(b"nope").unwrap();
        let back = ctx.send_msg(m).await;
        assert_eq!(back.state, MsgState::NoEndpoint);
        // the caller's payload survives a failed send
        assert_eq!(back.payload(), b"nope");
        ctx.close().await;
    }

    #[tokio::test]
    async fn mt_call_requires_the_flag_and_a_valid_id() {
        let ctx = Context::init("0", 512, InitFlags::default().no_thread()).await.unwrap();
        let m = ctx.alloc_msg(16);
        let back = ctx.mt_call(m, 5, 50).await;
        assert_eq!(back.state, MsgState::NotSupported);
        ctx.close().await;

        let ctx = Context::init("0", 512, InitFlags::default().no_thread().mt_call())
            .await
            .unwrap();
        let m = ctx.alloc_msg(16);
        let back = ctx.mt_call(m, 0, 50).await; // chute 0 is reserved
        assert_eq!(back.state, MsgState::BadArg);
        ctx.close().await;
    }

    #[tokio::test]
    async fn rts_without_source_is_a_header_error() {
        let ctx = Context::init("0", 512, InitFlags::default().no_thread()).await.unwrap();
        let m = ctx.alloc_msg(16);
        let back = ctx.rts_msg(m).await;
        assert_eq!(back.state, MsgState::NoHeader);
        ctx.close().await;
    }

    #[tokio::test]
    async fn torcv_times_out_empty() {
        let ctx = Context::init("0", 512, InitFlags::default().no_thread()).await.unwrap();
        let m = ctx.torcv_msg(None, 20).await;
        assert_eq!(m.state, MsgState::Timeout);
        ctx.close().await;
    }

    #[tokio::test]
    async fn table_swap_is_atomic_for_readers() {
        let ctx = Context::init("0", 512, InitFlags::default().no_thread()).await.unwrap();

        let mut rt = RouteTable::new();
        rt.insert(crate::route::RouteEntry::new(
            2,
            -1,
            vec![crate::route::RrGroup::new(vec![ctx.registry().ensure("a:1")])],
            false,
        ));
        ctx.install_route_table(rt);
        assert!(ctx.ready());

        let held = ctx.active_route(); // reader reference across the swap

        let mut rt2 = RouteTable::new();
        rt2.insert(crate::route::RouteEntry::new(
            2,
            -1,
            vec![crate::route::RrGroup::new(vec![ctx.registry().ensure("b:1")])],
            false,
        ));
        ctx.install_route_table(rt2);

        // the held table still resolves to the old endpoint; the active
        // table resolves to the new one
        let (ep, _) = held.get_rte(-1, 2, false).unwrap().select(0);
        assert_eq!(ep.unwrap().name(), "a:1");
        let (ep, _) = ctx.active_route().get_rte(-1, 2, false).unwrap().select(0);
        assert_eq!(ep.unwrap().name(), "b:1");

        ctx.close().await;
    }
}
