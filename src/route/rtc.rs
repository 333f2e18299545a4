//! # Route-Table Collector
//!
//! A background task that runs for the life of the context. It loads the
//! seed table (if one is named), then either listens for the route manager
//! to push table updates or dials the manager and requests a table,
//! re-sending the request periodically until a complete table arrives.
//! Each completed batch is acknowledged back over the session that carried
//! it.
//!
//! The collector also owns the housekeeping chores that want a slow clock:
//! polling the verbosity-control file, dumping per-endpoint send/receive
//! counters (every 30 s at first, relaxing to every 300 s once the process
//! has settled), and warning when the application ring is dropping
//! messages.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::parse::{read_static_table, RecordAssembler, RecordOutcome, TableBuilder};
use super::{dump_endpoint_counts, RouteTable};
use crate::config::RtcMode;
use crate::context::Context;
use crate::error::MsgState;
use crate::logging::read_vlevel;
use crate::msg::MsgBuf;
use crate::mtypes;
use crate::session::receiver;
use crate::session::transport::{ConnReader, Listener};
use crate::wormhole::WhId;

/// How long one wait for collector input lasts before housekeeping runs.
const POLL_SLICE: Duration = Duration::from_secs(1);

/// Initial seconds between endpoint-count dumps.
const COUNT_DELAY_START: u64 = 30;
/// Relaxed dump interval once the process has been up five minutes.
const COUNT_DELAY_SETTLED: u64 = 300;

pub(crate) fn spawn(ctx: Arc<Context>) -> JoinHandle<()> {
    tokio::spawn(run(ctx))
}

async fn run(ctx: Arc<Context>) {
    let env = ctx.env().clone();

    // Seed table: makes ready() true so sends can start, but does not
    // count as a table from the route manager; in active mode requests
    // continue until a real one arrives.
    if let Some(path) = &env.seed_rt {
        match read_static_table(path, ctx.registry()) {
            Ok(Some(table)) => {
                info!("seed route table installed ({} entries)", table.entry_count());
                ctx.install_route_table(table);
            }
            Ok(None) => warn!("seed route table {} held no complete table", path.display()),
            Err(e) => warn!("cannot read seed route table {}: {}", path.display(), e),
        }
    }

    let (feed_tx, mut feed_rx) = mpsc::unbounded_channel::<MsgBuf>();
    ctx.dispatcher().set_rtc_feed(feed_tx.clone());

    // Control listener: where the route manager reaches us. In raw mode
    // the bytes are bare records rather than framed messages.
    let (ctl_port, mgr_addr) = match &env.rtc_mode {
        RtcMode::Passive { port } => (port.clone(), None),
        RtcMode::Active { mgr_addr, ctl_port } => (ctl_port.clone(), Some(mgr_addr.clone())),
    };
    match ctx.sessions().transport().listen(&format!("{}:{}", env.bind_if, ctl_port)).await {
        Ok(listener) => {
            if env.rtg_raw {
                spawn_raw_listener(listener, feed_tx.clone(), Arc::clone(&ctx));
            } else {
                receiver::spawn_listener(listener, Arc::clone(ctx.dispatcher()));
            }
            debug!("collector listening for route manager on port {}", ctl_port);
        }
        Err(e) => warn!("collector cannot bind control port {}: {}", ctl_port, e),
    }

    let mut builder = TableBuilder::new();
    let mut assembler = RecordAssembler::new();
    let mut mgr_whid: Option<WhId> = None;
    let mut have_update = false; // manager traffic observed; stop requesting

    let started = Instant::now();
    let mut next_request = Instant::now();
    let mut next_count_dump = started + Duration::from_secs(COUNT_DELAY_START);
    let mut count_delay = COUNT_DELAY_START;
    let mut last_drops: u64 = 0;
    let mut drop_alarm = false;

    info!(
        "collector running; mode={} request-every={}s",
        if mgr_addr.is_some() { "request" } else { "listen" },
        env.rtreq_freq_secs
    );

    loop {
        if ctx.is_shutdown() {
            debug!("collector exiting on shutdown");
            return;
        }

        // Active mode: keep asking for a table until one flows.
        if let Some(addr) = &mgr_addr {
            if !have_update && !ctx.has_full_table() && Instant::now() >= next_request {
                request_table(&ctx, addr, &mut mgr_whid).await;
                next_request = Instant::now() + Duration::from_secs(env.rtreq_freq_secs);
            }
        }

        match tokio::time::timeout(POLL_SLICE, feed_rx.recv()).await {
            Ok(Some(msg)) => {
                if !have_update {
                    have_update = true;
                    info!("message flow from route manager starts");
                }
                let vlevel = read_vlevel(&env.vctl_file);
                ingest(&ctx, &mut builder, &mut assembler, msg, vlevel, env.rtg_raw).await;
            }
            Ok(None) => {
                debug!("collector feed closed; exiting");
                return;
            }
            Err(_idle) => {}
        }

        // Housekeeping on the slow path.
        if Instant::now() >= next_count_dump {
            let vlevel = read_vlevel(&env.vctl_file);
            if vlevel >= 0 {
                dump_endpoint_counts(&ctx.registry().all(), ctx.my_name(), env.hr_log);
            }
            if count_delay != COUNT_DELAY_SETTLED && started.elapsed() > Duration::from_secs(300) {
                count_delay = COUNT_DELAY_SETTLED;
            }
            next_count_dump = Instant::now() + Duration::from_secs(count_delay);

            let drops = ctx.drop_count();
            if drops > last_drops {
                warn!("application ring dropped {} messages since last check", drops - last_drops);
                drop_alarm = true;
            } else if drop_alarm {
                info!("application ring drops have stopped");
                drop_alarm = false;
            }
            last_drops = drops;
        }
    }
}

/// Open (or reuse) the wormhole to the route manager and send one table
/// request carrying our control identity.
async fn request_table(ctx: &Arc<Context>, mgr_addr: &str, whid: &mut Option<WhId>) {
    if whid.is_none() {
        match ctx.wh_open(mgr_addr).await {
            Ok(id) => *whid = Some(id),
            Err(e) => {
                debug!("route manager {} not reachable yet: {}", mgr_addr, e);
                return;
            }
        }
    }

    if let Some(id) = *whid {
        let mut req = ctx.alloc_msg(64);
        req.mtype = mtypes::REQ_TABLE;
        req.fill_xaction();
        if req.write_payload(ctx.my_name().as_bytes()).is_err() {
            return;
        }
        let back = ctx.wh_send_msg(id, req).await;
        if back.state.is_ok() {
            debug!("table request sent to {}", mgr_addr);
        } else {
            debug!("table request to {} failed: {:?}; will redial", mgr_addr, back.state);
            ctx.wh_close(id);
            *whid = None;
        }
    }
}

/// Feed one table-data message through the record assembler and builder,
/// installing or rejecting completed tables and acking the sender.
async fn ingest(
    ctx: &Arc<Context>,
    builder: &mut TableBuilder,
    assembler: &mut RecordAssembler,
    msg: MsgBuf,
    vlevel: i32,
    raw: bool,
) {
    let records = assembler.feed(msg.payload());
    if vlevel > 1 {
        debug!("collector received {} bytes, {} complete records", msg.len(), records.len());
    }

    for record in records {
        if vlevel > 1 {
            debug!("processing ({})", record);
        }

        let active = ctx.active_route();
        let outcome = builder.parse_record(&record, ctx.registry(), &active);
        match outcome {
            RecordOutcome::Continue => {}
            RecordOutcome::Installed { table, records } => {
                let table_id = table.table_id.clone();
                install(ctx, table);
                if !raw {
                    ack(ctx, &msg, true, &table_id, records).await;
                }
            }
            RecordOutcome::Rejected { table_id, reason } => {
                warn!("route table update rejected: {}", reason);
                if !raw {
                    ack(ctx, &msg, false, &table_id, 0).await;
                }
            }
        }
    }
}

fn install(ctx: &Arc<Context>, table: RouteTable) {
    info!(
        "route table installed: id=({}) entries={} updates={}",
        if table.table_id.is_empty() { "<id-missing>" } else { &table.table_id },
        table.entry_count(),
        table.updates
    );
    ctx.install_route_table(table);
    ctx.mark_full_table();
}

/// Report table state to the route manager over the session that delivered
/// the update.
async fn ack(ctx: &Arc<Context>, data_msg: &MsgBuf, ok: bool, table_id: &str, records: u32) {
    if data_msg.src().is_empty() {
        return; // nothing to reply to (seed or raw input)
    }

    let mut reply = data_msg.duplicate();
    reply.mtype = mtypes::TABLE_STATE;
    reply.sub_id = crate::msg::UNSET_SUBID;
    let id = if table_id.is_empty() { "<id-missing>" } else { table_id };
    let body = if ok {
        format!("OK {id} {records}")
    } else {
        format!("ERR {id}")
    };

    let mut reply = ctx.realloc_msg(reply, body.len());
    if reply.write_payload(body.as_bytes()).is_err() {
        return;
    }
    let back = ctx.rts_msg(reply).await;
    if back.state != MsgState::Ok {
        debug!("table state ack not delivered: {:?}", back.state);
    }
}

/// Raw-mode listener: the route manager writes bare newline records with no
/// message framing. Chunks are wrapped in synthetic table-data messages and
/// pushed onto the collector feed, where the shared record assembler joins
/// split records. No acks are possible on this path.
fn spawn_raw_listener(
    listener: Box<dyn Listener>,
    feed: mpsc::UnboundedSender<MsgBuf>,
    ctx: Arc<Context>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok(conn) => {
                    if ctx.is_shutdown() {
                        return;
                    }
                    spawn_raw_reader(conn.reader, feed.clone(), Arc::clone(&ctx));
                }
                Err(e) => {
                    if !ctx.is_shutdown() {
                        warn!("raw route listener accept failed: {}", e);
                    }
                    return;
                }
            }
        }
    })
}

fn spawn_raw_reader(
    mut reader: ConnReader,
    feed: mpsc::UnboundedSender<MsgBuf>,
    ctx: Arc<Context>,
) -> JoinHandle<()> {
    use tokio::io::AsyncReadExt;

    tokio::spawn(async move {
        let mut chunk = vec![0u8; 4096];
        loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) => {
                    if !ctx.is_shutdown() {
                        debug!("raw route session ended: {}", e);
                    }
                    return;
                }
            };

            let mut msg = ctx.alloc_msg(n);
            msg.mtype = mtypes::TABLE_DATA;
            if msg.write_payload(&chunk[..n]).is_err() {
                continue;
            }
            if feed.send(msg).is_err() {
                return; // collector has exited
            }
        }
    })
}
