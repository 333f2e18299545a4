use anyhow::Result;
use rmr::{Context, InitFlags, MsgState};

/// Direct sessions bypass the route table entirely: no seed, no collector.
#[tokio::test]
async fn wormhole_send_bypasses_routing() -> Result<()> {
    let receiver = Context::init("24001", 4096, InitFlags::default().no_thread()).await?;
    let sender = Context::init("24000", 4096, InitFlags::default().no_thread()).await?;

    assert!(!sender.ready()); // no route table at all

    let wh = sender.wh_open("127.0.0.1:24001").await?;
    assert_eq!(sender.wh_state(wh), MsgState::Ok);

    let mut msg = sender.alloc_msg(32);
    msg.mtype = 200;
    msg.write_payload(b"through the wormhole")?;
    let back = sender.wh_send_msg(wh, msg).await;
    assert_eq!(back.state, MsgState::Ok);

    let got = receiver.torcv_msg(None, 2000).await;
    assert_eq!(got.state, MsgState::Ok);
    assert_eq!(got.mtype, 200);
    assert_eq!(got.payload(), b"through the wormhole");

    sender.close().await;
    receiver.close().await;
    Ok(())
}

#[tokio::test]
async fn wormhole_ids_dedupe_and_recycle() {
    let peer_a = Context::init("24011", 4096, InitFlags::default().no_thread())
        .await
        .unwrap();
    let peer_b = Context::init("24012", 4096, InitFlags::default().no_thread())
        .await
        .unwrap();
    let sender = Context::init("24010", 4096, InitFlags::default().no_thread())
        .await
        .unwrap();

    let a = sender.wh_open("127.0.0.1:24011").await.unwrap();
    let b = sender.wh_open("127.0.0.1:24012").await.unwrap();
    assert_ne!(a, b);

    // opening the same address again hands back the same id
    let a2 = sender.wh_open("127.0.0.1:24011").await.unwrap();
    assert_eq!(a, a2);

    // closing frees the slot; sends through it now fail
    assert!(sender.wh_close(a));
    assert_eq!(sender.wh_state(a), MsgState::WhId);
    let mut msg = sender.alloc_msg(8);
    msg.mtype = 201;
    let back = sender.wh_send_msg(a, msg).await;
    assert_eq!(back.state, MsgState::WhId);

    // the hole may be reused by the next open
    let c = sender.wh_open("127.0.0.1:24011").await.unwrap();
    assert_eq!(c, a);
    assert_eq!(sender.wh_state(c), MsgState::Ok);

    sender.close().await;
    peer_a.close().await;
    peer_b.close().await;
}

#[tokio::test]
async fn wormhole_open_fails_when_peer_is_down() {
    let sender = Context::init("24020", 4096, InitFlags::default().no_thread())
        .await
        .unwrap();

    // nothing listens here
    assert!(sender.wh_open("127.0.0.1:24029").await.is_err());

    sender.close().await;
}
