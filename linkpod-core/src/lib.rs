//! LinkPod session protocol reference implementation.
//! Host-driven: no I/O; the host passes bus events and receives actions.

pub mod identity;
pub mod protocol;
pub mod wire;

pub use identity::{LinkId, PeerId};
pub use protocol::{LinkPayload, Message, PayloadError, PROTOCOL_VERSION};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
pub use session::{
    CallId, MessageError, OutboundAction, SessionCore, SyncState, DEFAULT_CALL_TIMEOUT_TICKS,
};

pub mod bridge;
pub mod links;
pub mod roster;
pub mod session;
pub mod testing;

pub use bridge::LinkEvent;
pub use links::{LinkRecord, LinkStore};
pub use roster::Roster;
