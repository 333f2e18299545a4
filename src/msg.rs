//! # Message Buffer and Wire Framing
//!
//! The message buffer is the handle applications exchange with the library.
//! It wraps one contiguous transport buffer laid out as
//!
//! ```text
//! | header | trace | d1 | d2 | payload |
//! ```
//!
//! with the region sizes carried in the header's `len0..len3` fields. The
//! payload offset is always computed from those four lengths at runtime —
//! never from compile-time constants — so frames produced by builds with a
//! different header size, or with trace/d1/d2 regions of any length, are
//! consumed correctly.
//!
//! ## Wire header
//!
//! Version 3 is the only version generated. Multi-byte integer fields are
//! big-endian on the wire; the fixed byte arrays (transaction id, sender id,
//! source, managed-element id) travel as-is. Version 1 frames (16-byte
//! source field, no extension regions) are accepted on receive and
//! normalized into the v3 in-memory form.

use crate::error::{MsgState, RmrError};

/// Wire header version this library generates.
pub const WIRE_VERSION: i32 = 3;

/// Fixed field widths, bytes.
pub const XID_LEN: usize = 32;
pub const SID_LEN: usize = 32;
pub const SRC_LEN: usize = 64;
pub const MEID_LEN: usize = 32;
const TS_LEN: usize = 16;
const V1_SRC_LEN: usize = 16;

/// Size of the v3 fixed header prefix (everything before the trace region).
pub const HDR_V3_BASE: usize = 4 + 4 + 4 + XID_LEN + SID_LEN + SRC_LEN + MEID_LEN + TS_LEN
    + 4  // flags
    + 16 // len0..len3
    + 4  // sub_id
    + SRC_LEN; // srcip

/// Size of a v1 header; v1 has no extension regions at all.
pub const HDR_V1_LEN: usize = 4 + 4 + 4 + XID_LEN + SID_LEN + V1_SRC_LEN + MEID_LEN + TS_LEN;

/// Offset of `len0` within a v2/v3 prefix; the receive side reads this much
/// plus the four length words before it can size the rest of the frame.
pub const LEN_WORDS_OFF: usize = 4 + 4 + 4 + XID_LEN + SID_LEN + SRC_LEN + MEID_LEN + TS_LEN + 4;

/// Prefix bytes the receiver needs before the total frame size is known.
pub const FRAME_PROBE_LEN: usize = LEN_WORDS_OFF + 16;

/// Header flag bits.
pub const FLAG_HAS_TRACE: u32 = 0x01;
pub const FLAG_SUBID: u32 = 0x02;
pub const FLAG_CALL_MSG: u32 = 0x04;

/// Byte of the d1 region holding the call id for threaded calls.
pub const D1_CALLID_IDX: usize = 0;

/// Subscription id value meaning "not set" / "any".
pub const UNSET_SUBID: i32 = -1;

/// Message type value meaning "not set".
pub const UNSET_MSGTYPE: i32 = -1;

fn get_i32(b: &[u8], off: usize) -> i32 {
    i32::from_be_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn put_i32(b: &mut [u8], off: usize, v: i32) {
    b[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

/// Copy `src` into a fixed-width field, truncating or zero padding.
fn fill_field(dst: &mut [u8], src: &[u8]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    for b in dst[n..].iter_mut() {
        *b = 0;
    }
}

/// Render a fixed-width field as text up to the first NUL.
fn field_str(f: &[u8]) -> &str {
    let end = f.iter().position(|&b| b == 0).unwrap_or(f.len());
    std::str::from_utf8(&f[..end]).unwrap_or("")
}

/// Application-visible message handle.
///
/// The buffer owns its transport bytes. After a successful receive the
/// payload accessor is a view into the received frame — the bytes are not
/// copied out of the read buffer. Freeing is dropping.
#[derive(Debug)]
pub struct MsgBuf {
    /// Result of the last operation performed with this buffer.
    pub state: MsgState,
    /// Message type; applications use values above 99.
    pub mtype: i32,
    /// Subscription id; [`UNSET_SUBID`] means "any".
    pub sub_id: i32,
    /// Raw OS error of the last transport operation, 0 if none.
    pub tp_state: i32,

    flags: u32,
    xaction: [u8; XID_LEN],
    sid: [u8; SID_LEN],
    src: [u8; SRC_LEN],
    srcip: [u8; SRC_LEN],
    meid: [u8; MEID_LEN],

    buf: Vec<u8>,
    trace_off: usize,
    trace_len: usize,
    d1_off: usize,
    d1_len: usize,
    d2_off: usize,
    d2_len: usize,
    payload_off: usize,
    len: usize,       // payload bytes in use
    alloc_len: usize, // payload capacity
}

impl MsgBuf {
    /// Allocate a buffer with `size` bytes of payload capacity and the
    /// given ancillary region sizes. The header starts zeroed with
    /// `sub_id = -1` and version 3.
    pub fn alloc(size: usize, trace_len: usize, d1_len: usize, d2_len: usize) -> Self {
        let trace_off = HDR_V3_BASE;
        let d1_off = trace_off + trace_len;
        let d2_off = d1_off + d1_len;
        let payload_off = d2_off + d2_len;

        Self {
            state: MsgState::Ok,
            mtype: UNSET_MSGTYPE,
            sub_id: UNSET_SUBID,
            tp_state: 0,
            flags: 0,
            xaction: [0; XID_LEN],
            sid: [0; SID_LEN],
            src: [0; SRC_LEN],
            srcip: [0; SRC_LEN],
            meid: [0; MEID_LEN],
            buf: vec![0; payload_off + size],
            trace_off,
            trace_len,
            d1_off,
            d1_len,
            d2_off,
            d2_len,
            payload_off,
            len: 0,
            alloc_len: size,
        }
    }

    /// Grow a buffer so the payload capacity is at least `needed`, keeping
    /// header metadata, ancillary regions and payload bytes. When the
    /// current capacity already suffices the buffer comes back untouched.
    pub fn realloc(mut self, needed: usize) -> Self {
        if needed <= self.alloc_len {
            return self;
        }

        let grow_by = needed - self.alloc_len;
        self.buf.resize(self.buf.len() + grow_by, 0);
        self.alloc_len = needed;
        self
    }

    /// Duplicate header and payload into an independent buffer.
    pub fn duplicate(&self) -> Self {
        Self {
            state: self.state,
            mtype: self.mtype,
            sub_id: self.sub_id,
            tp_state: self.tp_state,
            flags: self.flags,
            xaction: self.xaction,
            sid: self.sid,
            src: self.src,
            srcip: self.srcip,
            meid: self.meid,
            buf: self.buf.clone(),
            trace_off: self.trace_off,
            trace_len: self.trace_len,
            d1_off: self.d1_off,
            d1_len: self.d1_len,
            d2_off: self.d2_off,
            d2_len: self.d2_len,
            payload_off: self.payload_off,
            len: self.len,
            alloc_len: self.alloc_len,
        }
    }

    /// Payload bytes currently in use.
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.payload_off..self.payload_off + self.len]
    }

    /// Full writable payload capacity.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.payload_off..self.payload_off + self.alloc_len]
    }

    /// Payload capacity of this buffer.
    pub fn payload_size(&self) -> usize {
        self.alloc_len
    }

    /// Payload bytes in use (`plen` on the wire).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Declare how many payload bytes are populated. False when the value
    /// exceeds the buffer's capacity (the length is left unchanged).
    pub fn set_len(&mut self, len: usize) -> bool {
        if len > self.alloc_len {
            return false;
        }
        self.len = len;
        true
    }

    /// Copy `bytes` into the payload and set the populated length.
    pub fn write_payload(&mut self, bytes: &[u8]) -> Result<(), RmrError> {
        if bytes.len() > self.alloc_len {
            return Err(RmrError::TooLarge { size: bytes.len(), max: self.alloc_len });
        }
        self.buf[self.payload_off..self.payload_off + bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
        Ok(())
    }

    pub fn xaction(&self) -> &[u8; XID_LEN] {
        &self.xaction
    }

    pub fn set_xaction(&mut self, xid: &[u8]) {
        fill_field(&mut self.xaction, xid);
    }

    /// Stamp a freshly generated transaction id (32 hex characters) and
    /// return a copy of it.
    pub fn fill_xaction(&mut self) -> [u8; XID_LEN] {
        let id = uuid::Uuid::new_v4().simple().to_string();
        fill_field(&mut self.xaction, id.as_bytes());
        self.xaction
    }

    pub fn meid(&self) -> &str {
        field_str(&self.meid)
    }

    pub fn set_meid(&mut self, meid: &str) {
        fill_field(&mut self.meid, meid.as_bytes());
    }

    /// `name:port` of the sender, stamped by the sending library.
    pub fn src(&self) -> &str {
        field_str(&self.src)
    }

    /// `ip:port` of the sender.
    pub fn srcip(&self) -> &str {
        field_str(&self.srcip)
    }

    pub(crate) fn set_src(&mut self, src: &str) {
        fill_field(&mut self.src, src.as_bytes());
    }

    pub(crate) fn set_srcip(&mut self, srcip: &str) {
        fill_field(&mut self.srcip, srcip.as_bytes());
    }

    /// Bytes reserved for trace data in this buffer.
    pub fn trace_len(&self) -> usize {
        self.trace_len
    }

    pub fn trace_data(&self) -> &[u8] {
        &self.buf[self.trace_off..self.trace_off + self.trace_len]
    }

    /// Copy trace bytes into the reserved region; false when the region is
    /// too small (use [`Context::tralloc_msg`](crate::Context::tralloc_msg)
    /// to size it).
    pub fn set_trace_data(&mut self, data: &[u8]) -> bool {
        if data.len() > self.trace_len {
            return false;
        }
        self.buf[self.trace_off..self.trace_off + data.len()].copy_from_slice(data);
        true
    }

    pub(crate) fn header_flags(&self) -> u32 {
        self.flags
    }

    pub(crate) fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    /// Call id carried in the d1 region; 0 when absent.
    pub(crate) fn call_id(&self) -> u8 {
        if self.d1_len > D1_CALLID_IDX {
            self.buf[self.d1_off + D1_CALLID_IDX]
        } else {
            0
        }
    }

    pub(crate) fn set_call_id(&mut self, id: u8) -> bool {
        if self.d1_len <= D1_CALLID_IDX {
            return false;
        }
        self.buf[self.d1_off + D1_CALLID_IDX] = id;
        true
    }

    /// Render the frame for transmission: encode the header prefix in place
    /// and hand back the wire bytes (header, regions, populated payload).
    ///
    /// `src`/`srcip` stamping and byte-order conversion happen here, at the
    /// last moment before the write, so a buffer reused across sends always
    /// carries the current values.
    pub(crate) fn encode_frame(&mut self) -> &[u8] {
        let mut flags = self.flags;
        if self.trace_len > 0 {
            flags |= FLAG_HAS_TRACE;
        }
        if self.sub_id != UNSET_SUBID {
            flags |= FLAG_SUBID;
        }

        // Regions were laid out for a v3 header at allocation time; a
        // received v1 frame is re-allocated before reply, so the prefix
        // always has the v3 shape here.
        debug_assert!(self.trace_off == HDR_V3_BASE);

        let b = &mut self.buf;
        put_i32(b, 0, self.mtype);
        put_i32(b, 4, self.len as i32);
        put_i32(b, 8, WIRE_VERSION);
        let mut off = 12;
        b[off..off + XID_LEN].copy_from_slice(&self.xaction);
        off += XID_LEN;
        b[off..off + SID_LEN].copy_from_slice(&self.sid);
        off += SID_LEN;
        b[off..off + SRC_LEN].copy_from_slice(&self.src);
        off += SRC_LEN;
        b[off..off + MEID_LEN].copy_from_slice(&self.meid);
        off += MEID_LEN;
        for i in 0..TS_LEN {
            b[off + i] = 0; // reserved timestamp
        }
        off += TS_LEN;
        put_i32(b, off, flags as i32);
        put_i32(b, off + 4, HDR_V3_BASE as i32); // len0
        put_i32(b, off + 8, self.trace_len as i32); // len1
        put_i32(b, off + 12, self.d1_len as i32); // len2
        put_i32(b, off + 16, self.d2_len as i32); // len3
        put_i32(b, off + 20, self.sub_id);
        let srcip_off = off + 24;
        b[srcip_off..srcip_off + SRC_LEN].copy_from_slice(&self.srcip);

        &self.buf[..self.payload_off + self.len]
    }

    /// Rebuild a message from a complete received frame. The frame vector
    /// is kept as the transport buffer; region offsets are computed from
    /// the header's length words.
    pub(crate) fn decode_frame(frame: Vec<u8>) -> Result<Self, RmrError> {
        if frame.len() < 12 {
            return Err(RmrError::Frame(format!("short frame: {} bytes", frame.len())));
        }

        let version = get_i32(&frame, 8);
        if version == 1 {
            return Self::decode_v1(frame);
        }
        if frame.len() < FRAME_PROBE_LEN {
            return Err(RmrError::Frame(format!("short v{version} header: {} bytes", frame.len())));
        }

        let mtype = get_i32(&frame, 0);
        let plen = get_i32(&frame, 4);
        let flags = get_i32(&frame, LEN_WORDS_OFF - 4) as u32;
        let len_words = [
            get_i32(&frame, LEN_WORDS_OFF),
            get_i32(&frame, LEN_WORDS_OFF + 4),
            get_i32(&frame, LEN_WORDS_OFF + 8),
            get_i32(&frame, LEN_WORDS_OFF + 12),
        ];
        if plen < 0 || len_words.iter().any(|&l| l < 0) {
            return Err(RmrError::Frame("nonsense header lengths".into()));
        }
        let len0 = len_words[0] as usize;
        let len1 = len_words[1] as usize;
        let len2 = len_words[2] as usize;
        let len3 = len_words[3] as usize;

        if len0 < FRAME_PROBE_LEN || frame.len() < len0 {
            return Err(RmrError::Frame("nonsense header lengths".into()));
        }
        let payload_off = len0 + len1 + len2 + len3;
        if frame.len() < payload_off + plen as usize {
            return Err(RmrError::Frame(format!(
                "frame shorter than declared: have {} need {}",
                frame.len(),
                payload_off + plen as usize
            )));
        }

        // sub_id and srcip are header extensions; a shorter len0 means the
        // sender's header predates them.
        let sub_id_off = LEN_WORDS_OFF + 16;
        let sub_id = if len0 >= sub_id_off + 4 { get_i32(&frame, sub_id_off) } else { UNSET_SUBID };

        let mut xaction = [0u8; XID_LEN];
        let mut sid = [0u8; SID_LEN];
        let mut src = [0u8; SRC_LEN];
        let mut srcip = [0u8; SRC_LEN];
        let mut meid = [0u8; MEID_LEN];
        let mut off = 12;
        xaction.copy_from_slice(&frame[off..off + XID_LEN]);
        off += XID_LEN;
        sid.copy_from_slice(&frame[off..off + SID_LEN]);
        off += SID_LEN;
        src.copy_from_slice(&frame[off..off + SRC_LEN]);
        off += SRC_LEN;
        meid.copy_from_slice(&frame[off..off + MEID_LEN]);
        let srcip_off = sub_id_off + 4;
        if len0 >= srcip_off + SRC_LEN {
            srcip.copy_from_slice(&frame[srcip_off..srcip_off + SRC_LEN]);
        }

        let alloc_len = frame.len() - payload_off;
        Ok(Self {
            state: MsgState::Ok,
            mtype,
            sub_id,
            tp_state: 0,
            flags,
            xaction,
            sid,
            src,
            srcip,
            meid,
            buf: frame,
            trace_off: len0,
            trace_len: len1,
            d1_off: len0 + len1,
            d1_len: len2,
            d2_off: len0 + len1 + len2,
            d2_len: len3,
            payload_off,
            len: plen as usize,
            alloc_len,
        })
    }

    /// Accept an old-style v1 frame: fixed header, 16-byte source, no
    /// extension regions. Never generated on send.
    fn decode_v1(frame: Vec<u8>) -> Result<Self, RmrError> {
        if frame.len() < HDR_V1_LEN {
            return Err(RmrError::Frame(format!("short v1 header: {} bytes", frame.len())));
        }

        let mtype = get_i32(&frame, 0);
        let plen = get_i32(&frame, 4);
        if plen < 0 || frame.len() < HDR_V1_LEN + plen as usize {
            return Err(RmrError::Frame("v1 frame shorter than declared".into()));
        }

        let mut xaction = [0u8; XID_LEN];
        let mut sid = [0u8; SID_LEN];
        let mut src = [0u8; SRC_LEN];
        let mut meid = [0u8; MEID_LEN];
        let mut off = 12;
        xaction.copy_from_slice(&frame[off..off + XID_LEN]);
        off += XID_LEN;
        sid.copy_from_slice(&frame[off..off + SID_LEN]);
        off += SID_LEN;
        fill_field(&mut src, &frame[off..off + V1_SRC_LEN]);
        off += V1_SRC_LEN;
        meid.copy_from_slice(&frame[off..off + MEID_LEN]);

        let alloc_len = frame.len() - HDR_V1_LEN;
        Ok(Self {
            state: MsgState::Ok,
            mtype,
            sub_id: UNSET_SUBID,
            tp_state: 0,
            flags: 0,
            xaction,
            sid,
            src,
            srcip: [0; SRC_LEN],
            meid,
            buf: frame,
            trace_off: HDR_V1_LEN,
            trace_len: 0,
            d1_off: HDR_V1_LEN,
            d1_len: 0,
            d2_off: HDR_V1_LEN,
            d2_len: 0,
            payload_off: HDR_V1_LEN,
            len: plen as usize,
            alloc_len,
        })
    }

    /// Whether the buffer still has the v3 region layout required to
    /// encode; a buffer decoded from a foreign frame may not.
    pub(crate) fn has_native_layout(&self) -> bool {
        self.trace_off == HDR_V3_BASE
    }

    /// Copy this message into a freshly laid-out buffer that can be
    /// encoded, preserving all header fields, regions and payload. Used
    /// before replying to a frame whose header geometry differs from ours.
    pub(crate) fn to_native_layout(&self) -> Self {
        let mut fresh = MsgBuf::alloc(self.alloc_len.max(self.len), self.trace_len, self.d1_len, self.d2_len);
        fresh.state = self.state;
        fresh.mtype = self.mtype;
        fresh.sub_id = self.sub_id;
        fresh.flags = self.flags;
        fresh.xaction = self.xaction;
        fresh.sid = self.sid;
        fresh.src = self.src;
        fresh.srcip = self.srcip;
        fresh.meid = self.meid;
        let tl = self.trace_len;
        fresh.buf[fresh.trace_off..fresh.trace_off + tl]
            .copy_from_slice(&self.buf[self.trace_off..self.trace_off + tl]);
        let d1 = self.d1_len;
        fresh.buf[fresh.d1_off..fresh.d1_off + d1]
            .copy_from_slice(&self.buf[self.d1_off..self.d1_off + d1]);
        let d2 = self.d2_len;
        fresh.buf[fresh.d2_off..fresh.d2_off + d2]
            .copy_from_slice(&self.buf[self.d2_off..self.d2_off + d2]);
        fresh.buf[fresh.payload_off..fresh.payload_off + self.len]
            .copy_from_slice(&self.buf[self.payload_off..self.payload_off + self.len]);
        fresh.len = self.len;
        fresh
    }

    /// Total frame size on the wire for a fully populated send.
    pub(crate) fn wire_len(&self) -> usize {
        self.payload_off + self.len
    }
}

/// Parse the length words out of a frame prefix and return
/// `(header_total, payload_len)`. The caller must supply at least
/// [`FRAME_PROBE_LEN`] bytes for v2/v3 frames, or 12 bytes to discover a v1
/// frame (whose header size is fixed).
pub(crate) fn frame_sizes(prefix: &[u8]) -> Result<(usize, usize), RmrError> {
    if prefix.len() < 12 {
        return Err(RmrError::Frame("prefix too short".into()));
    }
    let version = get_i32(prefix, 8);
    let plen = get_i32(prefix, 4);
    if plen < 0 {
        return Err(RmrError::Frame("negative payload length".into()));
    }

    if version == 1 {
        return Ok((HDR_V1_LEN, plen as usize));
    }

    if prefix.len() < FRAME_PROBE_LEN {
        return Err(RmrError::Frame("prefix too short for extended header".into()));
    }
    let len0 = get_i32(prefix, LEN_WORDS_OFF);
    let len1 = get_i32(prefix, LEN_WORDS_OFF + 4);
    let len2 = get_i32(prefix, LEN_WORDS_OFF + 8);
    let len3 = get_i32(prefix, LEN_WORDS_OFF + 12);
    if len0 < FRAME_PROBE_LEN as i32 || len1 < 0 || len2 < 0 || len3 < 0 {
        return Err(RmrError::Frame("nonsense header lengths".into()));
    }
    Ok(((len0 + len1 + len2 + len3) as usize, plen as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_msg() -> MsgBuf {
        let mut m = MsgBuf::alloc(128, 8, 4, 0);
        m.mtype = 1060;
        m.sub_id = 17;
        m.set_xaction(b"x-123456");
        m.set_meid("meid-steve");
        m.set_src("localhost:4560");
        m.set_srcip("127.0.0.1:4560");
        assert!(m.set_trace_data(b"trace!"));
        m.write_payload(b"hello, world").unwrap();
        m
    }

    #[test]
    fn alloc_honours_capacity_and_defaults() {
        let m = MsgBuf::alloc(2048, 0, 0, 0);
        assert_eq!(m.payload_size(), 2048);
        assert_eq!(m.len(), 0);
        assert_eq!(m.sub_id, UNSET_SUBID);
        assert_eq!(m.mtype, UNSET_MSGTYPE);
        assert!(m.has_native_layout());
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut m = sample_msg();
        let wire = m.encode_frame().to_vec();

        let d = MsgBuf::decode_frame(wire).unwrap();
        assert_eq!(d.mtype, 1060);
        assert_eq!(d.sub_id, 17);
        assert_eq!(d.payload(), b"hello, world");
        assert_eq!(&d.xaction()[..8], b"x-123456");
        assert_eq!(d.meid(), "meid-steve");
        assert_eq!(d.src(), "localhost:4560");
        assert_eq!(d.srcip(), "127.0.0.1:4560");
        assert_eq!(&d.trace_data()[..6], b"trace!");
        assert!(d.header_flags() & FLAG_SUBID != 0);
        assert!(d.header_flags() & FLAG_HAS_TRACE != 0);
    }

    #[test]
    fn empty_payload_is_legal() {
        let mut m = MsgBuf::alloc(64, 0, 0, 0);
        m.mtype = 5;
        let wire = m.encode_frame().to_vec();
        let d = MsgBuf::decode_frame(wire).unwrap();
        assert_eq!(d.len(), 0);
        assert_eq!(d.payload(), b"");
    }

    #[test]
    fn payload_offset_follows_length_words() {
        // Build a frame whose header is padded past our own struct size;
        // the decoder must honour len0 rather than assume a constant.
        let mut m = MsgBuf::alloc(32, 0, 0, 0);
        m.mtype = 9;
        m.write_payload(b"abc").unwrap();
        let mut wire = m.encode_frame().to_vec();

        let pad = 8usize;
        let len0 = HDR_V3_BASE + pad;
        // splice pad bytes between header and payload, bump len0
        let mut framed = wire[..HDR_V3_BASE].to_vec();
        framed.extend(std::iter::repeat(0u8).take(pad));
        framed.extend_from_slice(&wire.split_off(HDR_V3_BASE));
        put_i32(&mut framed, LEN_WORDS_OFF, len0 as i32);

        let d = MsgBuf::decode_frame(framed).unwrap();
        assert_eq!(d.mtype, 9);
        assert_eq!(d.payload(), b"abc");
    }

    #[test]
    fn v1_frame_is_accepted() {
        let mut frame = vec![0u8; HDR_V1_LEN + 5];
        put_i32(&mut frame, 0, 44); // mtype
        put_i32(&mut frame, 4, 5); // plen
        put_i32(&mut frame, 8, 1); // version
        frame[12..16].copy_from_slice(b"xid1");
        let src_off = 12 + XID_LEN + SID_LEN;
        frame[src_off..src_off + 9].copy_from_slice(b"old:4560\0");
        frame[HDR_V1_LEN..].copy_from_slice(b"penny");

        let d = MsgBuf::decode_frame(frame).unwrap();
        assert_eq!(d.mtype, 44);
        assert_eq!(d.sub_id, UNSET_SUBID);
        assert_eq!(d.src(), "old:4560");
        assert_eq!(d.payload(), b"penny");
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let mut m = sample_msg();
        let wire = m.encode_frame().to_vec();
        let short = wire[..wire.len() - 4].to_vec();
        assert!(MsgBuf::decode_frame(short).is_err());
    }

    #[test]
    fn realloc_preserves_contents() {
        let mut m = MsgBuf::alloc(16, 4, 0, 0);
        m.mtype = 7;
        m.set_trace_data(b"tr01");
        m.write_payload(b"0123456789").unwrap();

        let same = m.duplicate().realloc(8); // smaller request: unchanged
        assert_eq!(same.payload_size(), 16);
        assert_eq!(same.payload(), b"0123456789");

        let grown = m.realloc(4096);
        assert_eq!(grown.payload_size(), 4096);
        assert_eq!(grown.mtype, 7);
        assert_eq!(grown.payload(), b"0123456789");
        assert_eq!(grown.trace_data(), b"tr01");
    }

    #[test]
    fn fill_xaction_is_printable_and_full_width() {
        let mut m = MsgBuf::alloc(4, 0, 0, 0);
        let xid = m.fill_xaction();
        assert!(xid.iter().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(xid.len(), XID_LEN);
    }

    #[test]
    fn call_id_lives_in_d1() {
        let mut m = MsgBuf::alloc(4, 0, 4, 0);
        assert!(m.set_call_id(99));
        m.set_flag(FLAG_CALL_MSG);
        let wire = m.encode_frame().to_vec();
        let d = MsgBuf::decode_frame(wire).unwrap();
        assert_eq!(d.call_id(), 99);
        assert!(d.header_flags() & FLAG_CALL_MSG != 0);

        let mut no_d1 = MsgBuf::alloc(4, 0, 0, 0);
        assert!(!no_d1.set_call_id(5));
        assert_eq!(no_d1.call_id(), 0);
    }

    #[test]
    fn frame_sizes_probe() {
        let mut m = sample_msg();
        let wire = m.encode_frame().to_vec();
        let (hdr, plen) = frame_sizes(&wire[..FRAME_PROBE_LEN]).unwrap();
        assert_eq!(hdr, HDR_V3_BASE + 8 + 4);
        assert_eq!(plen, 12);
        assert_eq!(hdr + plen, wire.len());
    }
}
