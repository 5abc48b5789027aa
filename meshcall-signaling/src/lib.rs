//! Room-scoped signaling for the meshcall peer mesh
//!
//! - **`SignalingTransport`**: ordered, room-scoped delivery of offer/answer/ICE envelopes
//! - **`PresenceDirectory`**: who is attached to the room channel right now
//! - **`RoomHub`**: in-process implementation of both, one `RoomChannel` per room

pub mod error;
pub mod events;
pub mod room_hub;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use events::{
    IceCandidate, PresenceEntry, PresenceEvent, SdpType, SessionDescription, SignalEnvelope,
    SignalKind, SignalPayload,
};
pub use room_hub::{RoomChannel, RoomHub};
pub use transport::{PresenceDirectory, SignalingTransport};
pub use types::{Identity, RoomId};
