use std::sync::{Arc, Mutex, OnceLock};

use rmr::{mtypes, Context, InitFlags, MsgState};
use tokio::time::{sleep, Duration};

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Context whose collector listens for pushed tables on `ctl_port`
/// (passive mode, framed updates). No seed table.
async fn pushed_ctx(listen_port: u16, ctl_port: u16) -> Arc<Context> {
    let _guard = env_lock().lock().unwrap();
    std::env::set_var("RMR_RTG_SVC", ctl_port.to_string());
    let ctx = Context::init(&listen_port.to_string(), 4096, InitFlags::default())
        .await
        .unwrap();
    std::env::remove_var("RMR_RTG_SVC");
    ctx
}

/// Act as the route manager: push a table over a wormhole to the target's
/// control port and collect the acknowledgement.
async fn push_table(mgr: &Arc<Context>, ctl_addr: &str, records: &str) -> String {
    let wh = mgr.wh_open(ctl_addr).await.expect("control port reachable");

    let mut msg = mgr.alloc_msg(records.len() + 1);
    msg.mtype = mtypes::TABLE_DATA;
    msg.fill_xaction();
    msg.write_payload(records.as_bytes()).unwrap();
    let back = mgr.wh_send_msg(wh, msg).await;
    assert_eq!(back.state, MsgState::Ok, "table push failed");

    let ack = mgr.torcv_msg(None, 2000).await;
    assert_eq!(ack.state, MsgState::Ok, "no table-state ack");
    assert_eq!(ack.mtype, mtypes::TABLE_STATE);
    String::from_utf8_lossy(ack.payload()).into_owned()
}

#[tokio::test]
async fn pushed_table_makes_context_ready_and_acks() {
    let target = pushed_ctx(23000, 23050).await;
    let mgr = Context::init("23001", 4096, InitFlags::default().no_thread())
        .await
        .unwrap();

    assert!(!target.ready());

    let ack = push_table(
        &mgr,
        "127.0.0.1:23050",
        "newrt|start|table-7\nmse|2|-1|127.0.0.1:23060\nnewrt|end|1\n",
    )
    .await;
    assert!(ack.starts_with("OK table-7"), "unexpected ack: {ack}");

    for _ in 0..100 {
        if target.ready() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(target.ready());

    mgr.close().await;
    target.close().await;
}

#[tokio::test]
async fn rejected_update_leaves_active_table_in_force() {
    let receiver = Context::init("23161", 4096, InitFlags::default().no_thread())
        .await
        .unwrap();
    let target = pushed_ctx(23100, 23150).await;
    let mgr = Context::init("23101", 4096, InitFlags::default().no_thread())
        .await
        .unwrap();

    let ack = push_table(
        &mgr,
        "127.0.0.1:23150",
        "newrt|start|good\nmse|3|-1|127.0.0.1:23161\nnewrt|end|1\n",
    )
    .await;
    assert!(ack.starts_with("OK good"));
    for _ in 0..100 {
        if target.ready() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }

    // declared count disagrees with the records sent: the whole batch is
    // discarded and the previous table stays active
    let ack = push_table(
        &mgr,
        "127.0.0.1:23150",
        "updatert|start\nmse|3|-1|127.0.0.1:23999\ndel|3|-1\nupdatert|end|7\n",
    )
    .await;
    assert!(ack.starts_with("ERR"), "mismatched update must be rejected: {ack}");

    assert!(target.ready());
    let mut msg = target.alloc_msg(16);
    msg.mtype = 3;
    msg.write_payload(b"still-routed").unwrap();
    let back = target.send_msg(msg).await;
    assert_eq!(back.state, MsgState::Ok, "pre-update route must survive");

    let got = receiver.torcv_msg(None, 2000).await;
    assert_eq!(got.payload(), b"still-routed");

    mgr.close().await;
    target.close().await;
    receiver.close().await;
}

#[tokio::test]
async fn table_swap_is_invisible_to_a_concurrent_sender() {
    let a = Context::init("23261", 4096, InitFlags::default().no_thread())
        .await
        .unwrap();
    let b = Context::init("23262", 4096, InitFlags::default().no_thread())
        .await
        .unwrap();
    let target = pushed_ctx(23200, 23250).await;
    let mgr = Context::init("23201", 4096, InitFlags::default().no_thread())
        .await
        .unwrap();

    push_table(
        &mgr,
        "127.0.0.1:23250",
        "newrt|start\nmse|2|-1|127.0.0.1:23261\nnewrt|end|1\n",
    )
    .await;
    for _ in 0..100 {
        if target.ready() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }

    // sender loops while the table is replaced underneath it
    let sender = {
        let target = Arc::clone(&target);
        tokio::spawn(async move {
            let mut sent = 0u32;
            for _ in 0..200 {
                let mut msg = target.alloc_msg(8);
                msg.mtype = 2;
                msg.write_payload(b"x").unwrap();
                let back = target.send_msg(msg).await;
                // every send must resolve a route: old table or new, never
                // a missing one
                assert_ne!(back.state, MsgState::NoEndpoint);
                if back.state == MsgState::Ok {
                    sent += 1;
                }
                sleep(Duration::from_millis(2)).await;
            }
            sent
        })
    };

    sleep(Duration::from_millis(50)).await;
    push_table(
        &mgr,
        "127.0.0.1:23250",
        "updatert|start\nmse|2|-1|127.0.0.1:23262\nupdatert|end|1\n",
    )
    .await;

    let sent = sender.await.unwrap();
    assert!(sent > 0);

    // both destinations together saw every delivered message
    let mut a_count = 0u32;
    while a.torcv_msg(None, 200).await.state == MsgState::Ok {
        a_count += 1;
    }
    let mut b_count = 0u32;
    while b.torcv_msg(None, 200).await.state == MsgState::Ok {
        b_count += 1;
    }
    assert_eq!(a_count + b_count, sent);
    // the update actually took effect at some point
    assert!(b_count > 0, "no message reached the post-update endpoint");

    mgr.close().await;
    target.close().await;
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn raw_mode_accepts_bare_records() {
    use tokio::io::AsyncWriteExt;

    let target = {
        let _guard = env_lock().lock().unwrap();
        std::env::set_var("RMR_RTG_SVC", "23350");
        std::env::set_var("RMR_RTG_ISRAW", "1");
        let ctx = Context::init("23300", 4096, InitFlags::default()).await.unwrap();
        std::env::remove_var("RMR_RTG_SVC");
        std::env::remove_var("RMR_RTG_ISRAW");
        ctx
    };
    sleep(Duration::from_millis(100)).await; // let the raw listener bind

    let mut stream = tokio::net::TcpStream::connect("127.0.0.1:23350").await.unwrap();
    // split the stream of records at an awkward byte boundary
    stream.write_all(b"newrt|start\nmse|6|-1|127.0").await.unwrap();
    stream.flush().await.unwrap();
    sleep(Duration::from_millis(50)).await;
    stream.write_all(b".0.1:23361\nnewrt|end|1\n").await.unwrap();
    stream.flush().await.unwrap();

    for _ in 0..100 {
        if target.ready() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(target.ready(), "raw records did not build a table");

    target.close().await;
}
