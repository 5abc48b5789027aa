//! Room call coordinator
//!
//! One task per joined room owns every peer session, the local media and
//! the roster. Presence changes, inbound signals, connection callbacks,
//! user commands and the link-stats tick are all queued into that task and
//! handled one at a time, so negotiation state is never touched
//! concurrently.
//!
//! Offers are only ever produced in response to a connection's
//! negotiation-needed event. A newcomer does not offer to the members it
//! finds on arrival; existing members see it join, open a session and
//! offer, and the newcomer opens its side when the first offer lands.

use meshcall_core::MeshConfig;
use meshcall_signaling::{
    PresenceDirectory, PresenceEntry, PresenceEvent, RoomChannel, SignalEnvelope, SignalPayload,
    SignalingTransport,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::connection::{ConnectionEvents, ConnectionFactory, TaggedConnectionEvent};
use crate::link_quality::LinkQualityMonitor;
use crate::media::{CaptureBackend, LocalMediaSource};
use crate::session::{Disposition, PeerSession, PeerSnapshot};
use crate::table::SessionTable;
use crate::types::{Identity, RoomId, TrackId};
use crate::{Error, Result};

/// Who is joining and how often links are sampled
#[derive(Debug, Clone)]
pub struct JoinOptions {
    pub room: RoomId,
    pub identity: Identity,
    pub display_name: String,
    pub link_stats_interval: Duration,
}

impl JoinOptions {
    pub fn new(
        room: impl Into<RoomId>,
        identity: impl Into<Identity>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            room: room.into(),
            identity: identity.into(),
            display_name: display_name.into(),
            link_stats_interval: MeshConfig::default().link_stats_interval(),
        }
    }

    #[must_use]
    pub fn with_mesh_config(mut self, mesh: &MeshConfig) -> Self {
        self.link_stats_interval = mesh.link_stats_interval();
        self
    }

    #[must_use]
    pub const fn with_link_stats_interval(mut self, interval: Duration) -> Self {
        self.link_stats_interval = interval;
        self
    }
}

/// External services a call depends on
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn SignalingTransport>,
    pub presence: Arc<dyn PresenceDirectory>,
    pub connections: Arc<dyn ConnectionFactory>,
    pub capture: Arc<dyn CaptureBackend>,
}

impl Collaborators {
    /// Use one room channel for both signaling and presence
    pub fn from_channel(
        channel: RoomChannel,
        connections: Arc<dyn ConnectionFactory>,
        capture: Arc<dyn CaptureBackend>,
    ) -> Self {
        let channel = Arc::new(channel);
        Self {
            transport: Arc::clone(&channel) as Arc<dyn SignalingTransport>,
            presence: channel,
            connections,
            capture,
        }
    }
}

/// Observable state of a call, republished after every handled event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSnapshot {
    pub room: RoomId,
    pub local: Identity,
    /// Other participants currently present
    pub members: Vec<PresenceEntry>,
    pub peers: Vec<PeerSnapshot>,
    pub muted: bool,
    pub listen_only: bool,
    pub sharing_screen: bool,
    pub ended: bool,
}

impl CallSnapshot {
    #[must_use]
    pub fn peer(&self, identity: &str) -> Option<&PeerSnapshot> {
        self.peers.iter().find(|p| p.identity.as_str() == identity)
    }

    #[must_use]
    pub fn connected_peers(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.state == crate::types::PeerState::Connected)
            .count()
    }
}

enum Command {
    /// `None` toggles
    SetMuted {
        muted: Option<bool>,
        reply: oneshot::Sender<bool>,
    },
    StartScreenShare {
        reply: oneshot::Sender<Result<()>>,
    },
    StopScreenShare {
        reply: oneshot::Sender<bool>,
    },
    ToggleScreenShare {
        reply: oneshot::Sender<Result<bool>>,
    },
    ScreenShareEnded(TrackId),
    LinkStatsSampled,
}

/// Handle to a joined room
///
/// Dropping the handle ends the call in the background; `leave` ends it and
/// waits for teardown to finish.
pub struct RoomCall {
    room: RoomId,
    identity: Identity,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<CallSnapshot>,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RoomCall {
    /// Join a room: open the microphone (or fall back to listen-only),
    /// subscribe to signaling, then announce presence.
    ///
    /// Fails if the identity is already subscribed or attached in the room;
    /// the call already using that identity is left untouched.
    pub async fn join(options: JoinOptions, collaborators: Collaborators) -> Result<Self> {
        let JoinOptions {
            room,
            identity,
            display_name,
            link_stats_interval,
        } = options;

        if link_stats_interval.is_zero() {
            return Err(Error::InvalidState(
                "link stats interval must be greater than zero".to_string(),
            ));
        }

        let mut media = LocalMediaSource::new(identity.as_str(), collaborators.capture);
        if let Err(e) = media.acquire_microphone().await {
            warn!(room = %room, identity = %identity, error = %e, "Microphone unavailable, joining listen-only");
        }

        let signals = collaborators.transport.subscribe(&identity)?;
        let presence = match collaborators.presence.attach(&identity, &display_name).await {
            Ok(rx) => rx,
            Err(e) => {
                // The subscription is ours; a duplicate would have failed above
                collaborators.transport.unsubscribe(&identity);
                return Err(e.into());
            }
        };

        let members: BTreeMap<Identity, PresenceEntry> = collaborators
            .presence
            .current_members()
            .into_iter()
            .filter(|m| m.identity != identity)
            .map(|m| (m.identity.clone(), m))
            .collect();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let mut coordinator = Coordinator {
            room: room.clone(),
            identity: identity.clone(),
            transport: collaborators.transport,
            presence: collaborators.presence,
            connections: collaborators.connections,
            media,
            table: SessionTable::new(),
            members,
            monitor: Arc::new(LinkQualityMonitor::new()),
            events_tx,
            commands_tx: commands_tx.clone(),
            snapshot_tx: None,
            next_connection_id: 0,
            link_stats_interval,
            ended: false,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(coordinator.snapshot());
        coordinator.snapshot_tx = Some(snapshot_tx);

        info!(
            room = %room,
            identity = %identity,
            present = coordinator.members.len(),
            listen_only = coordinator.media.is_listen_only(),
            "Joined room"
        );

        let inputs = Inputs {
            signals,
            presence,
            events: events_rx,
            commands: commands_rx,
        };
        let span = info_span!("room_call", room = %room, identity = %identity);
        let handle = tokio::spawn(coordinator.run(inputs, cancel.clone()).instrument(span));

        Ok(Self {
            room,
            identity,
            commands: commands_tx,
            snapshot: snapshot_rx,
            cancel,
            task: tokio::sync::Mutex::new(Some(handle)),
        })
    }

    #[must_use]
    pub const fn room(&self) -> &RoomId {
        &self.room
    }

    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that observes every published snapshot
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until a published snapshot satisfies `predicate`
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&CallSnapshot) -> bool,
    ) -> Result<CallSnapshot> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .map_err(|_| Error::CallEnded)?;
        Ok(snapshot.clone())
    }

    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        self.request(|reply| Command::SetMuted {
            muted: Some(muted),
            reply,
        })
        .await
        .map(|_| ())
    }

    /// Returns the new mute state
    pub async fn toggle_mute(&self) -> Result<bool> {
        self.request(|reply| Command::SetMuted { muted: None, reply })
            .await
    }

    /// Start sharing the screen with every current and future peer.
    /// A capture failure leaves the call untouched.
    pub async fn start_screen_share(&self) -> Result<()> {
        self.request(|reply| Command::StartScreenShare { reply })
            .await?
    }

    /// Returns false if nothing was being shared
    pub async fn stop_screen_share(&self) -> Result<bool> {
        self.request(|reply| Command::StopScreenShare { reply })
            .await
    }

    /// Returns true if sharing after the toggle
    pub async fn toggle_screen_share(&self) -> Result<bool> {
        self.request(|reply| Command::ToggleScreenShare { reply })
            .await?
    }

    /// End the call and wait for teardown. Later calls return immediately.
    pub async fn leave(&self) {
        self.cancel.cancel();
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                warn!(room = %self.room, identity = %self.identity, error = %e, "Coordinator task failed");
            }
        }
    }

    #[must_use]
    pub fn has_ended(&self) -> bool {
        self.cancel.is_cancelled() || self.snapshot.borrow().ended
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| Error::CallEnded)?;
        rx.await.map_err(|_| Error::CallEnded)
    }
}

impl Drop for RoomCall {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Inputs {
    signals: mpsc::UnboundedReceiver<SignalEnvelope>,
    presence: mpsc::UnboundedReceiver<PresenceEvent>,
    events: mpsc::UnboundedReceiver<TaggedConnectionEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
}

struct Coordinator {
    room: RoomId,
    identity: Identity,
    transport: Arc<dyn SignalingTransport>,
    presence: Arc<dyn PresenceDirectory>,
    connections: Arc<dyn ConnectionFactory>,
    media: LocalMediaSource,
    table: SessionTable,
    members: BTreeMap<Identity, PresenceEntry>,
    monitor: Arc<LinkQualityMonitor>,
    events_tx: mpsc::UnboundedSender<TaggedConnectionEvent>,
    commands_tx: mpsc::UnboundedSender<Command>,
    snapshot_tx: Option<watch::Sender<CallSnapshot>>,
    next_connection_id: u64,
    link_stats_interval: Duration,
    ended: bool,
}

impl Coordinator {
    async fn run(mut self, mut inputs: Inputs, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.link_stats_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(
            interval_secs = self.link_stats_interval.as_secs(),
            "Coordinator started"
        );

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(command) = inputs.commands.recv() => self.handle_command(command).await,
                Some(event) = inputs.presence.recv() => self.handle_presence(event).await,
                Some(envelope) = inputs.signals.recv() => self.handle_signal(envelope).await,
                Some(tagged) = inputs.events.recv() => self.handle_connection_event(tagged).await,
                _ = ticker.tick() => self.sample_links(),
            }
            self.publish();
        }

        self.teardown().await;
    }

    async fn handle_presence(&mut self, event: PresenceEvent) {
        if *event.identity() == self.identity {
            return;
        }

        match event {
            PresenceEvent::Joined(entry) => {
                let remote = entry.identity.clone();
                info!(remote = %remote, display_name = %entry.display_name, "Participant joined");
                self.members.insert(remote.clone(), entry);
                self.table.clear_departed(&remote);

                // Repeated joins keep the live session
                if let Err(e) = self.ensure_session(&remote).await {
                    warn!(remote = %remote, error = %e, "Failed to open peer session");
                }
            }
            PresenceEvent::Left { identity } => {
                info!(remote = %identity, "Participant left");
                self.members.remove(&identity);
                self.table.mark_departed(&identity);
                self.close_session(&identity, "left").await;
            }
        }
    }

    async fn handle_signal(&mut self, envelope: SignalEnvelope) {
        if !envelope.is_addressed_to(&self.identity) || envelope.from == self.identity {
            trace!(from = %envelope.from, to = %envelope.to, kind = %envelope.kind(), "Ignoring signal for another participant");
            return;
        }

        let SignalEnvelope { from, payload, .. } = envelope;
        let kind = payload.kind();

        let session = if matches!(payload, SignalPayload::Offer(_)) {
            if self.table.is_departed(&from) {
                debug!(from = %from, "Discarding offer from departed participant");
                return;
            }
            match self.ensure_session(&from).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(from = %from, error = %e, "Failed to open peer session for offer");
                    return;
                }
            }
        } else {
            match self.table.get_mut(&from) {
                Some(session) => session,
                None => {
                    debug!(from = %from, %kind, "Discarding signal without a session");
                    return;
                }
            }
        };

        let outcome = session.handle_signal(payload).await;
        debug!(from = %from, %kind, ?outcome, "Signal handled");
    }

    async fn handle_connection_event(&mut self, tagged: TaggedConnectionEvent) {
        let TaggedConnectionEvent {
            remote,
            connection_id,
            event,
        } = tagged;

        let Some(session) = self.table.get_mut(&remote) else {
            trace!(remote = %remote, ?event, "Event for closed session");
            return;
        };
        if session.connection_id() != connection_id {
            trace!(remote = %remote, connection_id, "Event from replaced connection");
            return;
        }

        if session.handle_connection_event(event).await == Disposition::Remove {
            let state = session.state();
            self.close_session(&remote, state.as_str()).await;
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetMuted { muted, reply } => {
                let muted = muted.unwrap_or(!self.media.is_muted());
                self.media.set_muted(muted);
                info!(muted, "Microphone mute changed");
                let _ = reply.send(muted);
            }
            Command::StartScreenShare { reply } => {
                let result = self.start_screen_share().await;
                let _ = reply.send(result);
            }
            Command::StopScreenShare { reply } => {
                let stopped = self.stop_screen_share().await;
                let _ = reply.send(stopped);
            }
            Command::ToggleScreenShare { reply } => {
                let result = if self.media.is_sharing_screen() {
                    self.stop_screen_share().await;
                    Ok(false)
                } else {
                    self.start_screen_share().await.map(|()| true)
                };
                let _ = reply.send(result);
            }
            Command::ScreenShareEnded(track_id) => {
                // Only the capture that is still live
                if self.media.screen_track_id() == Some(&track_id) {
                    info!(track_id = %track_id, "Screen share ended from outside the call");
                    self.stop_screen_share().await;
                }
            }
            Command::LinkStatsSampled => {
                let table = &self.table;
                self.monitor.retain(|peer| table.contains(peer));
            }
        }
    }

    /// Return the session for `remote`, opening one with current local media if needed
    async fn ensure_session(&mut self, remote: &Identity) -> Result<&mut PeerSession> {
        if !self.table.contains(remote) {
            self.next_connection_id += 1;
            let events = ConnectionEvents::new(
                remote.clone(),
                self.next_connection_id,
                self.events_tx.clone(),
            );
            let session = PeerSession::open(
                self.identity.clone(),
                events,
                self.connections.as_ref(),
                Arc::clone(&self.transport),
                &self.media.tracks(),
            )
            .await?;
            return self.table.insert(session);
        }

        self.table
            .get_mut(remote)
            .ok_or_else(|| Error::InvalidState(format!("session for {remote} vanished")))
    }

    async fn close_session(&mut self, remote: &Identity, reason: &str) {
        if let Some(mut session) = self.table.remove(remote) {
            session.close().await;
            self.monitor.remove(remote);
            info!(remote = %remote, reason, remaining = self.table.len(), "Peer session closed");
        }
    }

    async fn start_screen_share(&mut self) -> Result<()> {
        if self.media.is_sharing_screen() {
            debug!("Screen share already active");
            return Ok(());
        }

        let (track, ended) = self.media.start_screen_share().await?;
        for session in self.table.iter() {
            if let Err(e) = session.add_local_track(&track).await {
                warn!(remote = %session.remote(), error = %e, "Failed to attach screen track");
            }
        }

        let commands = self.commands_tx.clone();
        let track_id = track.id().clone();
        tokio::spawn(async move {
            if ended.await.is_ok() {
                let _ = commands.send(Command::ScreenShareEnded(track_id));
            }
        });

        info!(track_id = %track.id(), peers = self.table.len(), "Screen share started");
        Ok(())
    }

    async fn stop_screen_share(&mut self) -> bool {
        let Some(track) = self.media.stop_screen_share() else {
            return false;
        };

        for session in self.table.iter() {
            if let Err(e) = session.remove_local_track(track.id()).await {
                warn!(remote = %session.remote(), error = %e, "Failed to detach screen track");
            }
        }
        info!(track_id = %track.id(), peers = self.table.len(), "Screen share stopped");
        true
    }

    fn sample_links(&self) {
        if self.table.is_empty() {
            return;
        }

        let connections = self.table.connections();
        let monitor = Arc::clone(&self.monitor);
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            if monitor.sample_all(connections).await > 0 {
                let _ = commands.send(Command::LinkStatsSampled);
            }
        });
    }

    async fn teardown(&mut self) {
        let sessions = self.table.drain();
        let closed = sessions.len();
        for mut session in sessions {
            session.close().await;
        }
        self.monitor.clear();
        self.media.stop_all();
        self.transport.unsubscribe(&self.identity);
        if let Err(e) = self.presence.detach(&self.identity).await {
            warn!(error = %e, "Failed to detach presence");
        }

        self.members.clear();
        self.table.forget_departed();
        self.ended = true;
        self.publish();
        info!(room = %self.room, closed, "Left room");
    }

    fn snapshot(&self) -> CallSnapshot {
        let peers = self
            .table
            .iter()
            .map(|session| {
                let mut peer = session.snapshot();
                peer.display_name = self
                    .members
                    .get(session.remote())
                    .map(|m| m.display_name.clone());
                peer.link = self.monitor.get(session.remote());
                peer
            })
            .collect();

        CallSnapshot {
            room: self.room.clone(),
            local: self.identity.clone(),
            members: self.members.values().cloned().collect(),
            peers,
            muted: self.media.is_muted(),
            listen_only: self.media.is_listen_only(),
            sharing_screen: self.media.is_sharing_screen(),
            ended: self.ended,
        }
    }

    fn publish(&self) {
        let Some(tx) = &self.snapshot_tx else {
            return;
        };
        let next = self.snapshot();
        tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

impl Drop for Coordinator {
    /// Release the room if the task stopped before `teardown` finished
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        warn!(room = %self.room, identity = %self.identity, "Coordinator stopped without teardown, releasing room");

        self.media.stop_all();
        self.monitor.clear();
        self.transport.unsubscribe(&self.identity);
        self.members.clear();
        self.ended = true;
        self.publish();

        let sessions = self.table.drain();
        let presence = Arc::clone(&self.presence);
        let identity = self.identity.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                for mut session in sessions {
                    session.close().await;
                }
                if let Err(e) = presence.detach(&identity).await {
                    warn!(identity = %identity, error = %e, "Failed to detach presence");
                }
            });
        }
    }
}
