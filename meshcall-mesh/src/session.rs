//! Peer session management
//!
//! This module handles:
//! - Politeness for each pair of participants
//! - Perfect negotiation: making-offer and ignore-next-offer flags, glare
//!   resolution through rollback
//! - Trickled candidate handling
//! - Session lifecycle and the remote tracks it carries

use meshcall_signaling::{
    IceCandidate, SessionDescription, SignalEnvelope, SignalPayload, SignalingTransport,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::{
    ConnectionEvent, ConnectionEvents, ConnectionFactory, ConnectionState, PeerConnection,
    SignalingState,
};
use crate::link_quality::LinkSample;
use crate::media::LocalTrack;
use crate::types::{Identity, PeerState, RemoteTrack, TrackId};
use crate::Result;

/// The lexicographically smaller identity yields during glare
#[must_use]
pub fn is_polite(local: &Identity, remote: &Identity) -> bool {
    local < remote
}

/// Result of dispatching one inbound signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    OfferAnswered { rolled_back: bool },
    /// Impolite side dropped a colliding offer
    OfferIgnored,
    AnswerApplied,
    /// Answer belonged to an exchange this side already abandoned
    AnswerDiscarded,
    /// Answer could not be installed (stale or duplicate)
    AnswerRejected,
    CandidateApplied,
    CandidateDropped,
    Failed,
}

/// Result of a negotiation-needed trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Sent,
    /// Another exchange started while the offer was being built
    Abandoned,
    Failed,
}

/// Whether the session survives an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    Remove,
}

/// Read-only view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot {
    pub identity: Identity,
    pub display_name: Option<String>,
    pub state: PeerState,
    pub polite: bool,
    pub remote_tracks: Vec<RemoteTrack>,
    pub link: Option<LinkSample>,
}

/// Negotiation state for one remote participant
pub struct PeerSession {
    local: Identity,
    remote: Identity,
    connection_id: u64,
    connection: Arc<dyn PeerConnection>,
    transport: Arc<dyn SignalingTransport>,
    state: PeerState,
    making_offer: bool,
    ignore_next_offer: bool,
    remote_tracks: Vec<RemoteTrack>,
    created_at: Instant,
}

impl PeerSession {
    /// Create the connection and attach local media.
    ///
    /// With no local tracks a receive-only audio slot is requested so the
    /// participant still hears the room.
    pub async fn open(
        local: Identity,
        events: ConnectionEvents,
        factory: &dyn ConnectionFactory,
        transport: Arc<dyn SignalingTransport>,
        local_tracks: &[LocalTrack],
    ) -> Result<Self> {
        let remote = events.remote().clone();
        let connection_id = events.connection_id();
        let connection = factory.create(events).await?;

        let mut session = Self {
            local,
            remote,
            connection_id,
            connection,
            transport,
            state: PeerState::New,
            making_offer: false,
            ignore_next_offer: false,
            remote_tracks: Vec::new(),
            created_at: Instant::now(),
        };

        if let Err(e) = session.attach_media(local_tracks).await {
            session.close().await;
            return Err(e);
        }

        info!(
            local = %session.local,
            remote = %session.remote,
            polite = session.is_polite(),
            tracks = local_tracks.len(),
            "Peer session opened"
        );
        Ok(session)
    }

    async fn attach_media(&self, local_tracks: &[LocalTrack]) -> Result<()> {
        if local_tracks.is_empty() {
            self.connection.add_receive_only_audio().await?;
        }
        for track in local_tracks {
            self.connection.add_track(track).await?;
        }
        Ok(())
    }

    #[must_use]
    pub const fn remote(&self) -> &Identity {
        &self.remote
    }

    #[must_use]
    pub const fn connection_id(&self) -> u64 {
        self.connection_id
    }

    #[must_use]
    pub fn connection(&self) -> Arc<dyn PeerConnection> {
        Arc::clone(&self.connection)
    }

    #[must_use]
    pub const fn state(&self) -> PeerState {
        self.state
    }

    #[must_use]
    pub fn is_polite(&self) -> bool {
        is_polite(&self.local, &self.remote)
    }

    #[must_use]
    pub const fn is_making_offer(&self) -> bool {
        self.making_offer
    }

    #[must_use]
    pub const fn is_ignoring_offer(&self) -> bool {
        self.ignore_next_offer
    }

    #[must_use]
    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    #[must_use]
    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            identity: self.remote.clone(),
            display_name: None,
            state: self.state,
            polite: self.is_polite(),
            remote_tracks: self.remote_tracks.clone(),
            link: None,
        }
    }

    /// Dispatch a signal addressed to this session
    pub async fn handle_signal(&mut self, payload: SignalPayload) -> SignalOutcome {
        match payload {
            SignalPayload::Offer(offer) => match self.handle_offer(offer).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(remote = %self.remote, error = %e, "Failed to handle offer");
                    SignalOutcome::Failed
                }
            },
            SignalPayload::Answer(answer) => self.handle_answer(answer).await,
            SignalPayload::IceCandidate(candidate) => self.handle_remote_candidate(candidate).await,
        }
    }

    /// Dispatch an event reported by this session's connection
    pub async fn handle_connection_event(&mut self, event: ConnectionEvent) -> Disposition {
        match event {
            ConnectionEvent::NegotiationNeeded => {
                self.handle_negotiation_needed().await;
            }
            ConnectionEvent::LocalCandidate(candidate) => {
                self.send(SignalPayload::IceCandidate(candidate)).await;
            }
            ConnectionEvent::StateChanged(state) => return self.handle_state_change(state),
            ConnectionEvent::TrackAdded(track) => self.track_added(track),
            ConnectionEvent::TrackEnded(track_id) => self.track_ended(&track_id),
        }
        Disposition::Keep
    }

    /// Originate an offer, but only from a neutral signaling state
    pub async fn handle_negotiation_needed(&mut self) -> OfferOutcome {
        self.making_offer = true;
        let outcome = self.originate_offer().await;
        self.making_offer = false;

        match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(remote = %self.remote, error = %e, "Failed to create offer");
                OfferOutcome::Failed
            }
        }
    }

    async fn originate_offer(&mut self) -> Result<OfferOutcome> {
        let offer = self.connection.create_offer().await?;

        let signaling = self.connection.signaling_state();
        if signaling != SignalingState::Stable {
            debug!(remote = %self.remote, %signaling, "Abandoning offer, exchange already in progress");
            return Ok(OfferOutcome::Abandoned);
        }

        self.connection.set_local_description(offer.clone()).await?;
        self.begin_negotiating();
        debug!(remote = %self.remote, "Sending offer");
        self.send(SignalPayload::Offer(offer)).await;
        Ok(OfferOutcome::Sent)
    }

    async fn handle_offer(&mut self, offer: SessionDescription) -> Result<SignalOutcome> {
        let collision =
            self.making_offer || self.connection.signaling_state() != SignalingState::Stable;

        self.ignore_next_offer = collision && !self.is_polite();
        if self.ignore_next_offer {
            debug!(remote = %self.remote, "Ignoring colliding offer");
            return Ok(SignalOutcome::OfferIgnored);
        }

        if collision {
            debug!(remote = %self.remote, "Rolling back local offer for colliding remote offer");
            self.connection.rollback_and_set_remote(offer).await?;
        } else {
            self.connection.set_remote_description(offer).await?;
        }
        self.begin_negotiating();

        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(answer.clone()).await?;
        debug!(remote = %self.remote, rolled_back = collision, "Sending answer");
        self.send(SignalPayload::Answer(answer)).await;

        Ok(SignalOutcome::OfferAnswered {
            rolled_back: collision,
        })
    }

    async fn handle_answer(&mut self, answer: SessionDescription) -> SignalOutcome {
        let signaling = self.connection.signaling_state();

        // An answer to our own outstanding offer is still wanted after we
        // ignored the peer's colliding offer; anything else is leftover.
        if std::mem::take(&mut self.ignore_next_offer)
            && signaling != SignalingState::HaveLocalOffer
        {
            debug!(remote = %self.remote, %signaling, "Discarding answer for abandoned exchange");
            return SignalOutcome::AnswerDiscarded;
        }

        match self.connection.set_remote_description(answer).await {
            Ok(()) => {
                debug!(remote = %self.remote, "Answer applied");
                SignalOutcome::AnswerApplied
            }
            Err(e) => {
                warn!(remote = %self.remote, %signaling, error = %e, "Failed to apply answer");
                SignalOutcome::AnswerRejected
            }
        }
    }

    async fn handle_remote_candidate(&mut self, candidate: IceCandidate) -> SignalOutcome {
        if !self.connection.has_remote_description().await {
            debug!(remote = %self.remote, "Dropping candidate received before remote description");
            return SignalOutcome::CandidateDropped;
        }

        match self.connection.add_ice_candidate(candidate).await {
            Ok(()) => SignalOutcome::CandidateApplied,
            Err(e) => {
                // Candidates for an offer we ignored are expected to fail
                if !self.ignore_next_offer {
                    warn!(remote = %self.remote, error = %e, "Failed to add ICE candidate");
                }
                SignalOutcome::CandidateDropped
            }
        }
    }

    fn handle_state_change(&mut self, state: ConnectionState) -> Disposition {
        debug!(remote = %self.remote, %state, "Connection state changed");
        match state {
            ConnectionState::Connected => {
                if self.state != PeerState::Connected {
                    info!(
                        remote = %self.remote,
                        elapsed_ms = self.created_at.elapsed().as_millis() as u64,
                        "Peer connected"
                    );
                }
                self.state = PeerState::Connected;
                Disposition::Keep
            }
            ConnectionState::Failed => {
                self.state = PeerState::Failed;
                Disposition::Remove
            }
            ConnectionState::Disconnected | ConnectionState::Closed => {
                self.state = PeerState::Disconnected;
                Disposition::Remove
            }
            ConnectionState::New | ConnectionState::Connecting => Disposition::Keep,
        }
    }

    fn track_added(&mut self, track: RemoteTrack) {
        if self.remote_tracks.iter().any(|t| t.id == track.id) {
            return;
        }
        debug!(remote = %self.remote, track_id = %track.id, kind = track.kind.as_str(), "Remote track added");
        self.remote_tracks.push(track);
    }

    fn track_ended(&mut self, track_id: &TrackId) {
        self.remote_tracks.retain(|t| &t.id != track_id);
    }

    /// Attach a local track; the connection then asks for renegotiation
    pub async fn add_local_track(&self, track: &LocalTrack) -> Result<()> {
        self.connection.add_track(track).await
    }

    pub async fn remove_local_track(&self, track_id: &TrackId) -> Result<bool> {
        self.connection.remove_track(track_id).await
    }

    /// Close the connection. Safe to call more than once.
    pub async fn close(&mut self) {
        if !self.state.is_terminal() {
            self.state = PeerState::Disconnected;
        }
        if let Err(e) = self.connection.close().await {
            debug!(remote = %self.remote, error = %e, "Error closing connection");
        }
    }

    fn begin_negotiating(&mut self) {
        if matches!(self.state, PeerState::New) {
            self.state = PeerState::Negotiating;
        }
    }

    /// Publish to the room; failures are logged and not retried
    async fn send(&self, payload: SignalPayload) {
        let kind = payload.kind();
        let envelope = SignalEnvelope::new(self.local.clone(), self.remote.clone(), payload);
        if let Err(e) = self.transport.send(envelope).await {
            warn!(remote = %self.remote, %kind, error = %e, "Failed to send signal");
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        debug!(remote = %self.remote, state = %self.state, "PeerSession dropped");
    }
}
