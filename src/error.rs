//! Error and state definitions shared across the library.
//!
//! The library follows a result-bearing message convention: the send and
//! receive operations never return `Result`; they return a message buffer
//! whose [`MsgState`] describes what happened, with the underlying OS error
//! (when there was one) preserved in the buffer's `tp_state` field. The
//! [`RmrError`] enum exists for the internal plumbing (connect, parse,
//! initialisation) where a typed error is the natural shape.

use thiserror::Error;

/// Result state carried on every message buffer.
///
/// States fall into a few categories that callers treat differently:
///
/// - Recoverable: [`Retry`](MsgState::Retry), [`Timeout`](MsgState::Timeout),
///   [`Empty`](MsgState::Empty) — retry or discard at the caller's option.
/// - Routing: [`NoEndpoint`](MsgState::NoEndpoint), [`WhId`](MsgState::WhId),
///   [`NoWhOpen`](MsgState::NoWhOpen) — the table or wormhole needs attention.
/// - Message format: [`NoHeader`](MsgState::NoHeader),
///   [`Truncated`](MsgState::Truncated), [`Overflow`](MsgState::Overflow).
/// - Hard I/O: [`SendFailed`](MsgState::SendFailed),
///   [`RcvFailed`](MsgState::RcvFailed) — the session was closed; a retry
///   triggers reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgState {
    /// Operation completed as requested.
    Ok,
    /// An argument to the operation was invalid (nil context, bad call id).
    BadArg,
    /// No endpoint could be selected for the message type / subscription id.
    NoEndpoint,
    /// There was nothing to send or receive.
    Empty,
    /// The buffer carries no usable header.
    NoHeader,
    /// A hard transport error occurred while sending; the session was closed.
    SendFailed,
    /// A call could not be completed (send accepted, no response path).
    CallFailed,
    /// No wormhole is open for the referenced id.
    NoWhOpen,
    /// The wormhole id is out of range or references a closed slot.
    WhId,
    /// The message was larger than the transport will accept.
    Overflow,
    /// Soft failure; the endpoint was blocked. Try again later.
    Retry,
    /// A hard transport error occurred while receiving.
    RcvFailed,
    /// The operation's time limit expired.
    Timeout,
    /// Initial state of a freshly allocated buffer; no operation performed.
    Unset,
    /// The inbound frame was shorter than its header declared.
    Truncated,
    /// Context initialisation failed.
    InitFailed,
    /// The operation is not supported by this build or configuration.
    NotSupported,
}

impl MsgState {
    /// True when the state indicates complete success.
    pub fn is_ok(self) -> bool {
        self == MsgState::Ok
    }
}

/// Internal library error. Public init/open operations surface this; the
/// message path converts it into a [`MsgState`] instead.
#[derive(Debug, Error)]
pub enum RmrError {
    #[error("context initialisation failed: {0}")]
    Init(String),

    #[error("no route for mtype={mtype} subid={sub_id}")]
    NoRoute { mtype: i32, sub_id: i32 },

    #[error("endpoint {0} is not connected and could not be dialed")]
    NotConnected(String),

    #[error("route table record rejected: {0}")]
    TableRecord(String),

    #[error("wormhole id {0} is not open")]
    Wormhole(usize),

    #[error("message exceeds maximum transport size ({size} > {max})")]
    TooLarge { size: usize, max: usize },

    #[error("frame malformed: {0}")]
    Frame(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RmrError {
    /// Map an internal error onto the state a message buffer should carry.
    pub fn to_state(&self) -> MsgState {
        match self {
            RmrError::Init(_) => MsgState::InitFailed,
            RmrError::NoRoute { .. } => MsgState::NoEndpoint,
            RmrError::NotConnected(_) => MsgState::Retry,
            RmrError::TableRecord(_) => MsgState::BadArg,
            RmrError::Wormhole(_) => MsgState::WhId,
            RmrError::TooLarge { .. } => MsgState::Overflow,
            RmrError::Frame(_) => MsgState::Truncated,
            RmrError::Io(e) => match e.kind() {
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => MsgState::Retry,
                _ => MsgState::SendFailed,
            },
        }
    }
}
