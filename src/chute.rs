//! Chute table for threaded calls.
//!
//! A chute pairs an expected transaction id with a wake channel. A caller
//! arms a chute before sending, then parks on the channel; when the
//! dispatcher sees a call-flagged frame whose call id indexes an armed
//! chute and whose transaction id matches the expectation, it posts the
//! message there instead of the application ring. A timed-out caller
//! disarms its chute, so a late reply falls through to the ring rather
//! than waking a stranger.
//!
//! Chute 0 is reserved and never assigned to a caller.

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::RmrError;
use crate::msg::{MsgBuf, XID_LEN};

/// Largest call id a caller may use; the table holds `MAX_CALL_ID + 1`
/// slots with slot 0 reserved.
pub const MAX_CALL_ID: usize = 255;

#[derive(Default)]
struct Chute {
    expect: Option<[u8; XID_LEN]>,
    wake: Option<oneshot::Sender<MsgBuf>>,
}

/// Fixed array of per-call slots, allocated once at context creation.
pub struct ChuteTable {
    slots: Vec<Mutex<Chute>>,
}

impl ChuteTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_CALL_ID + 1);
        for _ in 0..=MAX_CALL_ID {
            slots.push(Mutex::new(Chute::default()));
        }
        Self { slots }
    }

    /// Arm `call_id` with the transaction id a reply must carry. Returns
    /// the receiver the caller parks on. Re-arming a busy chute replaces
    /// the previous expectation (its waiter sees a closed channel).
    pub fn arm(&self, call_id: usize, xid: [u8; XID_LEN]) -> Result<oneshot::Receiver<MsgBuf>, RmrError> {
        if call_id == 0 || call_id > MAX_CALL_ID {
            return Err(RmrError::Init(format!("call id {call_id} out of range 1..={MAX_CALL_ID}")));
        }

        let (tx, rx) = oneshot::channel();
        let mut slot = self.slots[call_id].lock();
        slot.expect = Some(xid);
        slot.wake = Some(tx);
        Ok(rx)
    }

    /// Drop the expectation; a reply arriving later is routed normally.
    pub fn disarm(&self, call_id: usize) {
        if let Some(slot) = self.slots.get(call_id) {
            let mut slot = slot.lock();
            slot.expect = None;
            slot.wake = None;
        }
    }

    /// Attempt to deliver a call reply. The message is handed back when the
    /// chute is unarmed, the transaction id does not match, or the waiter
    /// has already given up — in every such case the caller should queue it
    /// on the ring instead.
    pub fn try_deliver(&self, call_id: u8, msg: MsgBuf) -> Result<(), MsgBuf> {
        let idx = call_id as usize;
        if idx == 0 || idx > MAX_CALL_ID {
            return Err(msg);
        }

        let mut slot = self.slots[idx].lock();
        match slot.expect {
            Some(expect) if &expect == msg.xaction() => {
                slot.expect = None;
                match slot.wake.take() {
                    Some(tx) => tx.send(msg),
                    None => Err(msg),
                }
            }
            _ => Err(msg),
        }
    }
}

impl Default for ChuteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg_with_xid(xid: &[u8]) -> MsgBuf {
        let mut m = MsgBuf::alloc(16, 0, 4, 0);
        m.set_xaction(xid);
        m
    }

    #[test]
    fn chute_zero_is_reserved() {
        let chutes = ChuteTable::new();
        assert!(chutes.arm(0, [0; XID_LEN]).is_err());
        assert!(chutes.arm(MAX_CALL_ID + 1, [0; XID_LEN]).is_err());
        assert!(chutes.arm(1, [0; XID_LEN]).is_ok());
        assert!(chutes.arm(MAX_CALL_ID, [0; XID_LEN]).is_ok());
    }

    #[tokio::test]
    async fn matched_delivery_wakes_the_waiter() {
        let chutes = ChuteTable::new();
        let msg = msg_with_xid(b"xact-0001");
        let rx = chutes.arm(5, *msg.xaction()).unwrap();

        chutes.try_deliver(5, msg).expect("delivery succeeds");
        let got = rx.await.unwrap();
        assert_eq!(&got.xaction()[..9], b"xact-0001");

        // the chute is cleared after one delivery
        let late = msg_with_xid(b"xact-0001");
        assert!(chutes.try_deliver(5, late).is_err());
    }

    #[test]
    fn mismatched_xid_is_bounced() {
        let chutes = ChuteTable::new();
        let _rx = chutes.arm(9, *msg_with_xid(b"expected").xaction()).unwrap();

        let wrong = msg_with_xid(b"other");
        let bounced = chutes.try_deliver(9, wrong).unwrap_err();
        assert_eq!(&bounced.xaction()[..5], b"other");
    }

    #[test]
    fn disarm_prevents_delivery() {
        let chutes = ChuteTable::new();
        let msg = msg_with_xid(b"late");
        let _rx = chutes.arm(3, *msg.xaction()).unwrap();
        chutes.disarm(3);
        assert!(chutes.try_deliver(3, msg).is_err());
    }
}
