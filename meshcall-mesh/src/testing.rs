//! Scripted connections for exercising negotiation without a network
//!
//! `FakeConnection` models the offer/answer state machine closely enough
//! for glare and renegotiation to behave as they do on a real connection:
//! descriptions carry the sender's track list, rollback discards the local
//! offer, negotiation-needed is re-checked after the caller yields, and the
//! link reports `Connected` once an exchange completed.

use async_trait::async_trait;
use meshcall_signaling::{IceCandidate, SdpType, SessionDescription};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{
    ConnectionEvent, ConnectionEvents, ConnectionFactory, ConnectionState, PeerConnection,
    SignalingState,
};
use crate::media::LocalTrack;
use crate::types::{Identity, RemoteTrack, TrackId, TrackKind};
use crate::{Error, Result};

/// What one side has negotiated: its sending tracks and whether it asked
/// for receive-only audio
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct MediaSet {
    tracks: Vec<(TrackId, TrackKind)>,
    receive_only_audio: bool,
}

impl MediaSet {
    fn is_empty(&self) -> bool {
        self.tracks.is_empty() && !self.receive_only_audio
    }

    fn encode(&self, sdp_type: SdpType, sequence: u64, stream_id: &str) -> String {
        let tracks: Vec<String> = self
            .tracks
            .iter()
            .map(|(id, kind)| format!("{id}:{}", kind.as_str()))
            .collect();
        format!(
            "fake {} {sequence}\nstream={stream_id}\ntracks={}\nrecvonly={}",
            sdp_type.as_str(),
            tracks.join(","),
            self.receive_only_audio
        )
    }

    fn decode(sdp: &str) -> (String, Self) {
        let mut stream_id = String::new();
        let mut set = Self::default();
        for line in sdp.lines() {
            if let Some(value) = line.strip_prefix("stream=") {
                stream_id = value.to_string();
            } else if let Some(value) = line.strip_prefix("tracks=") {
                set.tracks = value
                    .split(',')
                    .filter(|t| !t.is_empty())
                    .filter_map(|t| t.split_once(':'))
                    .map(|(id, kind)| (TrackId::from(id), TrackKind::from(kind)))
                    .collect();
            } else if let Some(value) = line.strip_prefix("recvonly=") {
                set.receive_only_audio = value == "true";
            }
        }
        (stream_id, set)
    }
}

#[derive(Debug)]
struct FakeState {
    signaling: SignalingState,
    connection: ConnectionState,
    remote_description: Option<SessionDescription>,
    local: MediaSet,
    enabled: Vec<(TrackId, LocalTrack)>,
    /// Local media as of the last completed exchange
    negotiated: Option<MediaSet>,
    /// Local media as of the outstanding offer
    offered: Option<MediaSet>,
    remote_tracks: Vec<(TrackId, TrackKind)>,
    remote_candidates: usize,
    candidates_emitted: bool,
    negotiation_check_scheduled: bool,
    sequence: u64,
    offers_created: usize,
    reject_next_remote_offer: bool,
    rtt: Option<Duration>,
    closed: bool,
}

impl FakeState {
    fn new() -> Self {
        Self {
            signaling: SignalingState::Stable,
            connection: ConnectionState::New,
            remote_description: None,
            local: MediaSet::default(),
            enabled: Vec::new(),
            negotiated: None,
            offered: None,
            remote_tracks: Vec::new(),
            remote_candidates: 0,
            candidates_emitted: false,
            negotiation_check_scheduled: false,
            sequence: 0,
            offers_created: 0,
            reject_next_remote_offer: false,
            rtt: None,
            closed: false,
        }
    }

    fn negotiation_needed(&self) -> bool {
        if self.closed || self.signaling != SignalingState::Stable {
            return false;
        }
        match &self.negotiated {
            Some(negotiated) => *negotiated != self.local,
            None => !self.local.is_empty(),
        }
    }
}

/// In-memory stand-in for a media connection
pub struct FakeConnection {
    stream_id: String,
    events: ConnectionEvents,
    state: Arc<Mutex<FakeState>>,
}

impl FakeConnection {
    fn new(stream_id: String, events: ConnectionEvents) -> Self {
        Self {
            stream_id,
            events,
            state: Arc::new(Mutex::new(FakeState::new())),
        }
    }

    pub fn remote(&self) -> &Identity {
        self.events.remote()
    }

    pub fn track_count(&self) -> usize {
        self.state.lock().local.tracks.len()
    }

    pub fn has_receive_only_audio(&self) -> bool {
        self.state.lock().local.receive_only_audio
    }

    /// Enabled flag of every attached track, in attach order
    pub fn tracks_enabled(&self) -> Vec<bool> {
        self.state
            .lock()
            .enabled
            .iter()
            .map(|(_, track)| track.is_enabled())
            .collect()
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().offers_created
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn set_round_trip_time(&self, rtt: Option<Duration>) {
        self.state.lock().rtt = rtt;
    }

    /// Make the next remote offer fail to apply
    pub fn reject_next_remote_offer(&self) {
        self.state.lock().reject_next_remote_offer = true;
    }

    /// Simulate the transport dropping
    pub fn fail(&self) {
        self.state.lock().connection = ConnectionState::Failed;
        self.events
            .emit(ConnectionEvent::StateChanged(ConnectionState::Failed));
    }

    /// Queue a negotiation-needed check that runs once the current task yields
    fn schedule_negotiation_check(&self) {
        {
            let mut state = self.state.lock();
            if state.negotiation_check_scheduled || !state.negotiation_needed() {
                return;
            }
            state.negotiation_check_scheduled = true;
        }

        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        tokio::spawn(async move {
            let needed = {
                let mut state = state.lock();
                state.negotiation_check_scheduled = false;
                state.negotiation_needed()
            };
            if needed {
                events.emit(ConnectionEvent::NegotiationNeeded);
            }
        });
    }

    fn apply_remote_media(&self, sdp: &str) {
        let (stream_id, remote) = MediaSet::decode(sdp);
        let previous = std::mem::replace(&mut self.state.lock().remote_tracks, remote.tracks.clone());

        for (id, _) in previous.iter().filter(|t| !remote.tracks.contains(t)) {
            self.events.emit(ConnectionEvent::TrackEnded(id.clone()));
        }
        for (id, kind) in remote.tracks.iter().filter(|t| !previous.contains(t)) {
            self.events.emit(ConnectionEvent::TrackAdded(RemoteTrack {
                id: id.clone(),
                kind: *kind,
                stream_id: stream_id.clone(),
            }));
        }
    }

    fn after_exchange(&self) {
        let connected = {
            let mut state = self.state.lock();
            // Candidates flowing either way is enough; the far side learns
            // ours as peer-reflexive even if it dropped the signaled ones
            let ready = state.signaling == SignalingState::Stable
                && state.remote_description.is_some()
                && (state.remote_candidates > 0 || state.candidates_emitted)
                && state.connection != ConnectionState::Connected
                && !state.connection.is_terminal();
            if ready {
                state.connection = ConnectionState::Connected;
            }
            ready
        };
        if connected {
            self.events
                .emit(ConnectionEvent::StateChanged(ConnectionState::Connected));
        }
        self.schedule_negotiation_check();
    }

    fn ensure_open(state: &FakeState) -> Result<()> {
        if state.closed {
            return Err(Error::InvalidState("connection closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote_description.is_some()
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        state.sequence += 1;
        state.offers_created += 1;
        state.offered = Some(state.local.clone());
        Ok(SessionDescription::offer(state.local.encode(
            SdpType::Offer,
            state.sequence,
            &self.stream_id,
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(Error::InvalidState(format!(
                "cannot answer in {}",
                state.signaling
            )));
        }
        state.sequence += 1;
        Ok(SessionDescription::answer(state.local.encode(
            SdpType::Answer,
            state.sequence,
            &self.stream_id,
        )))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let emit_candidate = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            match (description.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable) => {
                    state.signaling = SignalingState::HaveLocalOffer;
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => {
                    state.signaling = SignalingState::Stable;
                    // The answer carries every local track
                    state.negotiated = Some(state.local.clone());
                }
                (sdp_type, signaling) => {
                    return Err(Error::InvalidState(format!(
                        "cannot set local {} in {signaling}",
                        sdp_type.as_str()
                    )));
                }
            }
            !std::mem::replace(&mut state.candidates_emitted, true)
        };

        if emit_candidate {
            self.events
                .emit(ConnectionEvent::LocalCandidate(IceCandidate {
                    candidate: format!(
                        "candidate:1 1 UDP 2130706431 127.0.0.1 {} typ host",
                        40000 + self.events.connection_id()
                    ),
                    sdp_mid: Some("0".to_string()),
                    sdp_mline_index: Some(0),
                }));
        }
        self.after_exchange();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            match (description.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable) => {
                    if std::mem::take(&mut state.reject_next_remote_offer) {
                        return Err(Error::InvalidState("remote offer rejected".to_string()));
                    }
                    state.signaling = SignalingState::HaveRemoteOffer;
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::Stable;
                    state.negotiated = state.offered.take();
                }
                (sdp_type, signaling) => {
                    return Err(Error::InvalidState(format!(
                        "cannot set remote {} in {signaling}",
                        sdp_type.as_str()
                    )));
                }
            }
            state.remote_description = Some(description.clone());
        }

        self.apply_remote_media(&description.sdp);
        self.after_exchange();
        Ok(())
    }

    async fn rollback_and_set_remote(&self, offer: SessionDescription) -> Result<()> {
        {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            if state.signaling != SignalingState::HaveLocalOffer {
                return Err(Error::InvalidState(format!(
                    "nothing to roll back in {}",
                    state.signaling
                )));
            }
            // Rejection leaves the local offer in place
            if std::mem::take(&mut state.reject_next_remote_offer) {
                return Err(Error::InvalidState("remote offer rejected".to_string()));
            }
            state.offered = None;
            state.signaling = SignalingState::HaveRemoteOffer;
            state.remote_description = Some(offer.clone());
        }

        self.apply_remote_media(&offer.sdp);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            if state.remote_description.is_none() {
                return Err(Error::InvalidState("no remote description".to_string()));
            }
            state.remote_candidates += 1;
        }
        self.after_exchange();
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            if state.local.tracks.iter().any(|(id, _)| id == track.id()) {
                return Ok(());
            }
            state.local.tracks.push((track.id().clone(), track.kind()));
            state.enabled.push((track.id().clone(), track.clone()));
        }
        self.schedule_negotiation_check();
        Ok(())
    }

    async fn remove_track(&self, track_id: &TrackId) -> Result<bool> {
        let removed = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            let before = state.local.tracks.len();
            state.local.tracks.retain(|(id, _)| id != track_id);
            state.enabled.retain(|(id, _)| id != track_id);
            state.local.tracks.len() != before
        };
        if removed {
            self.schedule_negotiation_check();
        }
        Ok(removed)
    }

    async fn add_receive_only_audio(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            state.local.receive_only_audio = true;
        }
        self.schedule_negotiation_check();
        Ok(())
    }

    async fn round_trip_time(&self) -> Option<Duration> {
        self.state.lock().rtt
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.signaling = SignalingState::Closed;
        state.connection = ConnectionState::Closed;
        Ok(())
    }
}

/// Hands out `FakeConnection`s and keeps them for inspection
pub struct FakeConnectionFactory {
    stream_id: String,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    created: AtomicU64,
}

impl FakeConnectionFactory {
    pub fn new(local: &str) -> Arc<Self> {
        Arc::new(Self {
            stream_id: local.to_string(),
            connections: Mutex::new(Vec::new()),
            created: AtomicU64::new(0),
        })
    }

    /// Most recent connection created towards `remote`
    pub fn connection(&self, remote: &str) -> Option<Arc<FakeConnection>> {
        let remote = Identity::from(remote);
        self.connections
            .lock()
            .iter()
            .rev()
            .find(|c| *c.remote() == remote)
            .cloned()
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn created_for(&self, remote: &str) -> usize {
        let remote = Identity::from(remote);
        self.connections
            .lock()
            .iter()
            .filter(|c| *c.remote() == remote)
            .count()
    }
}

#[async_trait]
impl ConnectionFactory for FakeConnectionFactory {
    async fn create(&self, events: ConnectionEvents) -> Result<Arc<dyn PeerConnection>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(FakeConnection::new(self.stream_id.clone(), events));
        self.connections.lock().push(Arc::clone(&connection));
        Ok(connection)
    }
}
