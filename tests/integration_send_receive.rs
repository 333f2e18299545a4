use std::io::Write as _;
use std::sync::{Arc, Mutex, OnceLock};

use rmr::{Context, InitFlags, MsgState, UNSET_SUBID};
use tokio::time::{sleep, Duration};

/// Environment variables are process-global; tests that set them take this
/// lock for the set + init window so concurrent tests don't cross wires.
fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Start a routed context: a seed table is written to a temp file and
/// loaded by the collector; the collector listens (passively) on `ctl_port`
/// so it never tries to dial a route manager.
async fn routed_ctx(listen_port: u16, ctl_port: u16, seed: &str, flags: InitFlags) -> Arc<Context> {
    let ctx = {
        let _guard = env_lock().lock().unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{seed}").unwrap();
        std::env::set_var("RMR_SEED_RT", file.path());
        std::env::set_var("RMR_RTG_SVC", ctl_port.to_string());

        let ctx = Context::init(&listen_port.to_string(), 4096, flags).await.unwrap();

        // wait for the collector to read the seed before the file vanishes
        for _ in 0..200 {
            if ctx.ready() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        std::env::remove_var("RMR_SEED_RT");
        std::env::remove_var("RMR_RTG_SVC");
        ctx
    };
    assert!(ctx.ready(), "seed route table did not load");
    ctx
}

/// Plain receiving context: no collector, no routes of its own.
async fn receiver_ctx(listen_port: u16) -> Arc<Context> {
    Context::init(&listen_port.to_string(), 4096, InitFlags::default().no_thread())
        .await
        .unwrap()
}

#[tokio::test]
async fn simple_send_receive_and_reply() {
    let receiver = receiver_ctx(21001).await;
    let sender = routed_ctx(
        21000,
        21050,
        "newrt|start\nmse|1|-1|127.0.0.1:21001\nnewrt|end|1\n",
        InitFlags::default(),
    )
    .await;

    let mut msg = sender.alloc_msg(64);
    msg.mtype = 1;
    msg.sub_id = UNSET_SUBID;
    msg.fill_xaction();
    msg.write_payload(b"hello").unwrap();

    let back = sender.send_msg(msg).await;
    assert_eq!(back.state, MsgState::Ok);
    // a successful send swaps in a fresh, empty buffer
    assert_eq!(back.len(), 0);

    let got = receiver.torcv_msg(None, 2000).await;
    assert_eq!(got.state, MsgState::Ok);
    assert_eq!(got.mtype, 1);
    assert_eq!(got.sub_id, UNSET_SUBID);
    assert_eq!(got.payload(), b"hello");
    assert!(!got.src().is_empty());

    // reply over the delivering session without any routing entry
    let mut reply = receiver.realloc_msg(got, 64);
    reply.mtype = 101;
    reply.write_payload(b"yes?").unwrap();
    let back = receiver.rts_msg(reply).await;
    assert_eq!(back.state, MsgState::Ok);

    let got = sender.torcv_msg(None, 2000).await;
    assert_eq!(got.state, MsgState::Ok);
    assert_eq!(got.mtype, 101);
    assert_eq!(got.payload(), b"yes?");

    sender.close().await;
    receiver.close().await;
}

#[tokio::test]
async fn specific_subid_falls_back_to_any() {
    let receiver = receiver_ctx(21011).await;
    let sender = routed_ctx(
        21010,
        21051,
        "newrt|start\nmse|4|-1|127.0.0.1:21011\nnewrt|end|1\n",
        InitFlags::default(),
    )
    .await;

    let mut msg = sender.alloc_msg(16);
    msg.mtype = 4;
    msg.sub_id = 17; // no exact entry; must fall back to -1
    msg.write_payload(b"fallback").unwrap();
    let back = sender.send_msg(msg).await;
    assert_eq!(back.state, MsgState::Ok);

    let got = receiver.torcv_msg(None, 2000).await;
    assert_eq!(got.state, MsgState::Ok);
    assert_eq!(got.mtype, 4);
    assert_eq!(got.sub_id, 17);
    assert_eq!(got.payload(), b"fallback");

    sender.close().await;
    receiver.close().await;
}

#[tokio::test]
async fn round_robin_covers_every_group_member() {
    let a = receiver_ctx(21021).await;
    let b = receiver_ctx(21022).await;
    let c = receiver_ctx(21023).await;
    let sender = routed_ctx(
        21020,
        21052,
        "newrt|start\nmse|7|-1|127.0.0.1:21021,127.0.0.1:21022,127.0.0.1:21023\nnewrt|end|1\n",
        InitFlags::default(),
    )
    .await;

    for i in 0u8..3 {
        let mut msg = sender.alloc_msg(8);
        msg.mtype = 7;
        msg.write_payload(&[i]).unwrap();
        let back = sender.send_msg(msg).await;
        assert_eq!(back.state, MsgState::Ok, "send {i} failed");
    }

    // one message lands on each member of the group
    for receiver in [&a, &b, &c] {
        let got = receiver.torcv_msg(None, 2000).await;
        assert_eq!(got.state, MsgState::Ok);
        assert_eq!(got.mtype, 7);
        let empty = receiver.torcv_msg(None, 100).await;
        assert_eq!(empty.state, MsgState::Timeout);
    }

    sender.close().await;
    a.close().await;
    b.close().await;
    c.close().await;
}

#[tokio::test]
async fn multiple_groups_fan_out_one_copy_each() {
    let g0 = receiver_ctx(21031).await;
    let g1 = receiver_ctx(21032).await;
    let sender = routed_ctx(
        21030,
        21053,
        "newrt|start\nmse|9|-1|127.0.0.1:21031;127.0.0.1:21032\nnewrt|end|1\n",
        InitFlags::default(),
    )
    .await;

    let mut msg = sender.alloc_msg(16);
    msg.mtype = 9;
    msg.write_payload(b"both").unwrap();
    let back = sender.send_msg(msg).await;
    assert_eq!(back.state, MsgState::Ok);

    for receiver in [&g0, &g1] {
        let got = receiver.torcv_msg(None, 2000).await;
        assert_eq!(got.state, MsgState::Ok);
        assert_eq!(got.payload(), b"both");
    }

    sender.close().await;
    g0.close().await;
    g1.close().await;
}

#[tokio::test]
async fn empty_payload_travels() {
    let receiver = receiver_ctx(21041).await;
    let sender = routed_ctx(
        21040,
        21054,
        "newrt|start\nmse|5|-1|127.0.0.1:21041\nnewrt|end|1\n",
        InitFlags::default(),
    )
    .await;

    let mut msg = sender.alloc_msg(16);
    msg.mtype = 5;
    let back = sender.send_msg(msg).await;
    assert_eq!(back.state, MsgState::Ok);

    let got = receiver.torcv_msg(None, 2000).await;
    assert_eq!(got.state, MsgState::Ok);
    assert_eq!(got.len(), 0);
    assert_eq!(got.payload(), b"");

    sender.close().await;
    receiver.close().await;
}
