//! `webrtc` backed peer connections
//!
//! Each connection is a real `RTCPeerConnection`. Callbacks registered at
//! creation forward negotiation, candidate, state and track events into the
//! coordinator queue; nothing in here mutates session state.

use async_trait::async_trait;
use meshcall_core::MeshConfig;
use meshcall_signaling::{IceCandidate, SdpType, SessionDescription};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::connection::{
    ConnectionEvent, ConnectionEvents, ConnectionFactory, ConnectionState, PeerConnection,
    SignalingState,
};
use crate::media::LocalTrack;
use crate::types::{RemoteTrack, TrackId, TrackKind};
use crate::{Error, Result};

/// Creates `webrtc` peer connections sharing one media engine
pub struct RtcConnectionFactory {
    api: API,
    config: RTCConfiguration,
}

impl RtcConnectionFactory {
    pub fn new(mesh: &MeshConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: mesh.ice_servers.clone(),
                ..Default::default()
            }],
            ice_candidate_pool_size: mesh.ice_candidate_pool_size,
            ..Default::default()
        };

        Ok(Self { api, config })
    }
}

#[async_trait]
impl ConnectionFactory for RtcConnectionFactory {
    async fn create(&self, events: ConnectionEvents) -> Result<Arc<dyn PeerConnection>> {
        let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);
        register_callbacks(&pc, &events);

        debug!(
            remote = %events.remote(),
            connection_id = events.connection_id(),
            "Created peer connection"
        );

        Ok(Arc::new(RtcConnection {
            pc,
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

fn register_callbacks(pc: &Arc<RTCPeerConnection>, events: &ConnectionEvents) {
    let negotiation_events = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let events = negotiation_events.clone();
        Box::pin(async move {
            events.emit(ConnectionEvent::NegotiationNeeded);
        })
    }));

    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
            // None marks the end of gathering
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    events.emit(ConnectionEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }));
                }
                Err(e) => warn!(remote = %events.remote(), error = %e, "Failed to encode ICE candidate"),
            }
        })
    }));

    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = state_events.clone();
        Box::pin(async move {
            if let Some(state) = map_connection_state(state) {
                events.emit(ConnectionEvent::StateChanged(state));
            }
        })
    }));

    let track_events = events.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let events = track_events.clone();
            Box::pin(async move {
                let remote_track = RemoteTrack {
                    id: TrackId::new(track.id()),
                    kind: TrackKind::from(track.kind()),
                    stream_id: track.stream_id(),
                };
                info!(
                    remote = %events.remote(),
                    track_id = %remote_track.id,
                    kind = remote_track.kind.as_str(),
                    codec = %track.codec().capability.mime_type,
                    "Remote track started"
                );
                let track_id = remote_track.id.clone();
                events.emit(ConnectionEvent::TrackAdded(remote_track));

                // Drain RTP until the sender goes away, then report the end
                tokio::spawn(async move {
                    let mut packets: u64 = 0;
                    while track.read_rtp().await.is_ok() {
                        packets += 1;
                    }
                    debug!(track_id = %track_id, packets, "Remote track ended");
                    events.emit(ConnectionEvent::TrackEnded(track_id));
                });
            })
        },
    ));
}

const fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

const fn map_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveRemotePranswer => {
            SignalingState::HaveLocalOffer
        }
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
            SignalingState::HaveRemoteOffer
        }
        RTCSignalingState::Closed => SignalingState::Closed,
        RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
    match description.sdp_type {
        SdpType::Offer => Ok(RTCSessionDescription::offer(description.sdp)?),
        SdpType::Answer => Ok(RTCSessionDescription::answer(description.sdp)?),
        SdpType::Rollback => Err(Error::InvalidState(
            "rollback is only applied through rollback_and_set_remote".to_string(),
        )),
    }
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(Error::InvalidState(format!("unexpected sdp type {other}"))),
    }
}

/// A `webrtc` peer connection to one remote participant
pub struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackId, Arc<RTCRtpSender>>>,
}

#[async_trait]
impl PeerConnection for RtcConnection {
    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.pc.signaling_state())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn rollback_and_set_remote(&self, offer: SessionDescription) -> Result<()> {
        let offer = to_rtc(offer)?;
        let pending = self.pc.pending_local_description().await;

        if let Some(pending) = &pending {
            // The rollback carries the pending offer's SDP; an empty body is rejected
            let mut rollback = pending.clone();
            rollback.sdp_type = RTCSdpType::Rollback;
            self.pc.set_local_description(rollback).await?;
        }

        if let Err(e) = self.pc.set_remote_description(offer).await {
            if let Some(previous) = pending {
                if let Err(restore) = self.pc.set_local_description(previous).await {
                    warn!(error = %restore, "Failed to restore local offer after rejected remote offer");
                }
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        if self.senders.lock().contains_key(track.id()) {
            return Ok(());
        }

        let sender = self
            .pc
            .add_track(track.rtp_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP must be read for interceptors (NACK, reports) to run
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
            trace!("RTCP reader stopped");
        });

        self.senders.lock().insert(track.id().clone(), sender);
        Ok(())
    }

    async fn remove_track(&self, track_id: &TrackId) -> Result<bool> {
        let sender = self.senders.lock().remove(track_id);
        let Some(sender) = sender else {
            return Ok(false);
        };
        self.pc.remove_track(&sender).await?;
        Ok(true)
    }

    async fn add_receive_only_audio(&self) -> Result<()> {
        self.pc
            .add_transceiver_from_kind(
                RTPCodecType::Audio,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        Ok(())
    }

    async fn round_trip_time(&self) -> Option<Duration> {
        let report = self.pc.get_stats().await;
        report.reports.values().find_map(|stats| match stats {
            StatsReportType::CandidatePair(pair)
                if pair.nominated && pair.current_round_trip_time > 0.0 =>
            {
                Some(Duration::from_secs_f64(pair.current_round_trip_time))
            }
            _ => None,
        })
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().clear();
        self.pc.close().await?;
        Ok(())
    }
}
