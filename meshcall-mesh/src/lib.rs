//! Full-mesh peer sessions for small rooms
//!
//! Every participant holds one direct media connection to every other
//! participant. Connection setup uses the perfect-negotiation pattern:
//! either side may offer at any time, and when two offers cross the polite
//! side (lower identity) rolls its own offer back while the impolite side
//! ignores the incoming one.
//!
//! ## Architecture
//!
//! - **`RoomCall`**: handle to one joined room, backed by a single
//!   coordinator task that serializes every event
//! - **`PeerSession`**: negotiation state for one remote participant
//! - **`LocalMediaSource`**: microphone and screen capture lifecycle
//! - **`LinkQualityMonitor`**: round-trip sampling per connection
//! - **`PeerConnection`**: seam over the media engine; `RtcConnection` is
//!   the `webrtc` implementation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use meshcall_mesh::{Collaborators, JoinOptions, RoomCall, RtcConnectionFactory, SyntheticCapture};
//! use meshcall_signaling::RoomHub;
//!
//! let hub = RoomHub::new();
//! let connections = Arc::new(RtcConnectionFactory::new(&config.mesh)?);
//! let call = RoomCall::join(
//!     JoinOptions::new("standup", "alice", "Alice").with_mesh_config(&config.mesh),
//!     Collaborators::from_channel(hub.channel("standup"), connections, Arc::new(SyntheticCapture::default())),
//! )
//! .await?;
//!
//! call.start_screen_share().await?;
//! call.leave().await;
//! ```

pub mod connection;
pub mod coordinator;
pub mod error;
pub mod link_quality;
pub mod media;
pub mod rtc;
pub mod session;
pub mod table;
pub mod types;

#[cfg(test)]
mod testing;

pub use connection::{
    ConnectionEvent, ConnectionEvents, ConnectionFactory, ConnectionState, PeerConnection,
    SignalingState, TaggedConnectionEvent,
};
pub use coordinator::{CallSnapshot, Collaborators, JoinOptions, RoomCall};
pub use error::{Error, MediaError, Result};
pub use link_quality::{LinkGrade, LinkQualityMonitor, LinkSample};
pub use media::{CaptureBackend, LocalMediaSource, LocalTrack, ScreenCapture, SyntheticCapture};
pub use rtc::{RtcConnection, RtcConnectionFactory};
pub use session::{is_polite, PeerSession, PeerSnapshot, SignalOutcome};
pub use table::SessionTable;
pub use types::{Identity, PeerState, RemoteTrack, RoomId, TrackId, TrackKind, TrackSource};
