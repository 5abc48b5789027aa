//! Seam between negotiation logic and the media connection it drives
//!
//! A `PeerConnection` is the single encrypted link to one remote
//! participant. Everything the connection reports back (negotiation needed,
//! gathered candidates, state changes, remote media) is pushed into the
//! owning coordinator's queue as a `TaggedConnectionEvent`, so callbacks
//! never touch session state directly.

use async_trait::async_trait;
use meshcall_signaling::{IceCandidate, SessionDescription};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::media::LocalTrack;
use crate::types::{Identity, RemoteTrack, TrackId};
use crate::Result;

/// Offer/answer progress of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// No exchange in progress
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stable => "stable",
            Self::HaveLocalOffer => "have-local-offer",
            Self::HaveRemoteOffer => "have-remote-offer",
            Self::Closed => "closed",
        })
    }
}

/// Transport-level state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Once reached the connection is not recovered
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        })
    }
}

/// Something a connection reported asynchronously
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Local media changed and a fresh offer/answer exchange is required
    NegotiationNeeded,
    LocalCandidate(IceCandidate),
    StateChanged(ConnectionState),
    TrackAdded(RemoteTrack),
    TrackEnded(TrackId),
}

/// Connection event routed to the coordinator
#[derive(Debug, Clone)]
pub struct TaggedConnectionEvent {
    pub remote: Identity,
    /// Distinguishes a replaced connection's late callbacks from the live one
    pub connection_id: u64,
    pub event: ConnectionEvent,
}

/// Handle a connection uses to report events for one remote participant
#[derive(Debug, Clone)]
pub struct ConnectionEvents {
    remote: Identity,
    connection_id: u64,
    sender: mpsc::UnboundedSender<TaggedConnectionEvent>,
}

impl ConnectionEvents {
    #[must_use]
    pub const fn new(
        remote: Identity,
        connection_id: u64,
        sender: mpsc::UnboundedSender<TaggedConnectionEvent>,
    ) -> Self {
        Self {
            remote,
            connection_id,
            sender,
        }
    }

    #[must_use]
    pub const fn remote(&self) -> &Identity {
        &self.remote
    }

    #[must_use]
    pub const fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Returns false once the coordinator has gone away
    pub fn emit(&self, event: ConnectionEvent) -> bool {
        self.sender
            .send(TaggedConnectionEvent {
                remote: self.remote.clone(),
                connection_id: self.connection_id,
                event,
            })
            .is_ok()
    }
}

/// One media connection to a remote participant
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    async fn has_remote_description(&self) -> bool;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Discard the pending local offer and install `offer` as one step.
    ///
    /// If the remote offer cannot be applied the connection is left with
    /// its previous local offer.
    async fn rollback_and_set_remote(&self, offer: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    /// Returns false if the track was never attached
    async fn remove_track(&self, track_id: &TrackId) -> Result<bool>;

    /// Receive audio without sending any (listen-only participants)
    async fn add_receive_only_audio(&self) -> Result<()>;

    /// Current round-trip estimate, if the transport has one
    async fn round_trip_time(&self) -> Option<Duration>;

    async fn close(&self) -> Result<()>;
}

/// Builds connections for the coordinator
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self, events: ConnectionEvents) -> Result<Arc<dyn PeerConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_connection_states() {
        assert!(!ConnectionState::New.is_terminal());
        assert!(!ConnectionState::Connecting.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
        assert!(ConnectionState::Disconnected.is_terminal());
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
    }

    #[test]
    fn test_events_are_tagged() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = ConnectionEvents::new(Identity::from("bob"), 7, tx);

        assert!(events.emit(ConnectionEvent::NegotiationNeeded));

        let tagged = rx.try_recv().unwrap();
        assert_eq!(tagged.remote, Identity::from("bob"));
        assert_eq!(tagged.connection_id, 7);
        assert_eq!(tagged.event, ConnectionEvent::NegotiationNeeded);

        drop(rx);
        assert!(!events.emit(ConnectionEvent::NegotiationNeeded));
    }
}
