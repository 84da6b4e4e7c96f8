//! Protocol Module
//!
//! Wire encoding of daemon and domain messages, and negotiation of the
//! protocol version every member runs.

pub mod message;
pub mod version;

pub use message::{
    ChangeInfo, Envelope, Header, IdInfo, Message, MessageFlags, MessageType,
    IDI_NODEID_IS_MEMBER,
};
pub use version::{DaemonGroup, Protocol, ProtocolAction, ProtocolVersion, DAEMON_MAX, PV_STATEFUL};
