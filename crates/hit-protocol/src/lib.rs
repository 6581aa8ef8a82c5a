//! Hit Protocol - Wire protocol for daemon communication
//!
//! Line-delimited JSON messages exchanged between the daemon and its
//! clients: hit recorders, badge requesters and live viewers.

pub mod message;
pub mod version;

pub use message::{ClientMessage, DaemonMessage, MessageType};
pub use version::ProtocolVersion;
