//! # RIC Message Router
//!
//! An embeddable, in-process messaging library that delivers opaque
//! payloads over TCP by message type (plus optional subscription id) rather
//! than by endpoint address. Applications stamp a type on a message buffer
//! and hand it to the library; a dynamically maintained route table picks
//! the destinations, sessions are dialed on demand, and a return-to-sender
//! identity lets any recipient reply without a routing entry of its own.

pub mod chute;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod msg;
pub mod ring;
pub mod route;
pub mod session;
pub mod symtab;
pub mod wormhole;

pub use chute::MAX_CALL_ID;
pub use config::EnvConfig;
pub use context::{Context, InitFlags};
pub use error::{MsgState, RmrError};
pub use msg::{MsgBuf, UNSET_MSGTYPE, UNSET_SUBID};
pub use wormhole::WhId;

/// The current version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Reserved message types; applications use values above 99.
pub mod mtypes {
    /// Route table content pushed by the route manager.
    pub const TABLE_DATA: i32 = 20;
    /// Request to the route manager for a full table.
    pub const REQ_TABLE: i32 = 21;
    /// Table acceptance state reported back to the route manager.
    pub const TABLE_STATE: i32 = 22;

    /// First message type available to applications.
    pub const FIRST_APP_MTYPE: i32 = 100;
}
