use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::{PresenceEntry, PresenceEvent, SignalEnvelope};
use crate::transport::{PresenceDirectory, SignalingTransport};
use crate::types::{Identity, RoomId};
use crate::{Error, Result};

/// Handle for one signaling subscription
pub type SubscriptionId = String;

struct SignalSubscriber {
    subscription_id: SubscriptionId,
    identity: Identity,
    sender: mpsc::UnboundedSender<SignalEnvelope>,
}

struct PresenceMember {
    entry: PresenceEntry,
    sender: mpsc::UnboundedSender<PresenceEvent>,
}

#[derive(Default)]
struct RoomState {
    subscribers: Vec<SignalSubscriber>,
    members: Vec<PresenceMember>,
}

impl RoomState {
    fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.members.is_empty()
    }
}

/// In-memory hub routing signaling envelopes and presence events to the
/// participants of each room (single process)
#[derive(Clone, Default)]
pub struct RoomHub {
    rooms: Arc<DashMap<RoomId, RoomState>>,
}

impl RoomHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Room-scoped view implementing both collaborator traits
    #[must_use]
    pub fn channel(&self, room_id: impl Into<RoomId>) -> RoomChannel {
        RoomChannel {
            hub: self.clone(),
            room_id: room_id.into(),
        }
    }

    #[must_use]
    pub fn subscriber_count(&self, room_id: &RoomId) -> usize {
        self.rooms
            .get(room_id)
            .map_or(0, |room| room.subscribers.len())
    }

    #[must_use]
    pub fn member_count(&self, room_id: &RoomId) -> usize {
        self.rooms.get(room_id).map_or(0, |room| room.members.len())
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn subscribe(
        &self,
        room_id: &RoomId,
        identity: &Identity,
    ) -> Result<mpsc::UnboundedReceiver<SignalEnvelope>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription_id = nanoid::nanoid!(10);

        {
            let mut room = self.rooms.entry(room_id.clone()).or_default();
            // Only a subscriber whose receiver is gone may be taken over
            room.subscribers
                .retain(|sub| sub.identity != *identity || !sub.sender.is_closed());
            if room.subscribers.iter().any(|sub| sub.identity == *identity) {
                return Err(Error::AlreadySubscribed(identity.clone()));
            }
            room.subscribers.push(SignalSubscriber {
                subscription_id: subscription_id.clone(),
                identity: identity.clone(),
                sender: tx,
            });
        }

        info!(
            room_id = %room_id,
            identity = %identity,
            subscription_id = %subscription_id,
            "Subscribed to room signaling"
        );

        Ok(rx)
    }

    fn unsubscribe(&self, room_id: &RoomId, identity: &Identity) {
        let removed = self.rooms.get_mut(room_id).is_some_and(|mut room| {
            let before = room.subscribers.len();
            room.subscribers.retain(|sub| sub.identity != *identity);
            before != room.subscribers.len()
        });
        self.remove_room_if_empty(room_id);

        if removed {
            info!(room_id = %room_id, identity = %identity, "Unsubscribed from room signaling");
        } else {
            debug!(room_id = %room_id, identity = %identity, "Unsubscribe for unknown identity");
        }
    }

    /// Deliver to every subscriber except the sender; returns the delivery count
    fn broadcast(&self, room_id: &RoomId, envelope: &SignalEnvelope) -> usize {
        let mut sent_count = 0;
        let mut failed = Vec::new();

        if let Some(room) = self.rooms.get(room_id) {
            for subscriber in room.subscribers.iter().filter(|s| s.identity != envelope.from) {
                match subscriber.sender.send(envelope.clone()) {
                    Ok(()) => sent_count += 1,
                    Err(_) => {
                        warn!(
                            room_id = %room_id,
                            identity = %subscriber.identity,
                            subscription_id = %subscriber.subscription_id,
                            "Signaling receiver dropped, marking for cleanup"
                        );
                        failed.push(subscriber.identity.clone());
                    }
                }
            }
        }

        for identity in failed {
            self.unsubscribe(room_id, &identity);
        }

        debug!(
            room_id = %room_id,
            from = %envelope.from,
            to = %envelope.to,
            kind = %envelope.kind(),
            sent_count,
            "Envelope broadcast complete"
        );

        sent_count
    }

    fn attach(
        &self,
        room_id: &RoomId,
        entry: PresenceEntry,
    ) -> Result<mpsc::UnboundedReceiver<PresenceEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let identity = entry.identity.clone();

        {
            let mut room = self.rooms.entry(room_id.clone()).or_default();
            if room.members.iter().any(|m| m.entry.identity == identity) {
                return Err(Error::AlreadyAttached(identity));
            }
            room.members.push(PresenceMember {
                entry: entry.clone(),
                sender: tx,
            });
        }

        info!(
            room_id = %room_id,
            identity = %identity,
            display_name = %entry.display_name,
            "Presence attached"
        );

        self.notify_members(room_id, &identity, &PresenceEvent::Joined(entry));
        Ok(rx)
    }

    fn detach(&self, room_id: &RoomId, identity: &Identity) {
        let removed = self.rooms.get_mut(room_id).is_some_and(|mut room| {
            let before = room.members.len();
            room.members.retain(|m| m.entry.identity != *identity);
            before != room.members.len()
        });

        if removed {
            info!(room_id = %room_id, identity = %identity, "Presence detached");
            self.notify_members(
                room_id,
                identity,
                &PresenceEvent::Left {
                    identity: identity.clone(),
                },
            );
        } else {
            warn!(room_id = %room_id, identity = %identity, "Attempted to detach unknown member");
        }
        self.remove_room_if_empty(room_id);
    }

    /// Send a presence event to everyone but `origin`. Members whose stream
    /// was dropped are treated as timed out and announced as left.
    fn notify_members(&self, room_id: &RoomId, origin: &Identity, event: &PresenceEvent) {
        let mut timed_out = Vec::new();

        if let Some(room) = self.rooms.get(room_id) {
            for member in room.members.iter().filter(|m| m.entry.identity != *origin) {
                if member.sender.send(event.clone()).is_err() {
                    timed_out.push(member.entry.identity.clone());
                }
            }
        }

        for identity in timed_out {
            warn!(room_id = %room_id, identity = %identity, "Presence stream dropped, expiring member");
            self.detach(room_id, &identity);
        }
    }

    fn members(&self, room_id: &RoomId) -> Vec<PresenceEntry> {
        self.rooms
            .get(room_id)
            .map(|room| room.members.iter().map(|m| m.entry.clone()).collect())
            .unwrap_or_default()
    }

    fn remove_room_if_empty(&self, room_id: &RoomId) {
        if self.rooms.remove_if(room_id, |_, room| room.is_empty()).is_some() {
            debug!(room_id = %room_id, "Room has no more participants, removed");
        }
    }
}

/// One room of a [`RoomHub`]
#[derive(Clone)]
pub struct RoomChannel {
    hub: RoomHub,
    room_id: RoomId,
}

impl RoomChannel {
    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }
}

#[async_trait]
impl SignalingTransport for RoomChannel {
    async fn send(&self, envelope: SignalEnvelope) -> Result<()> {
        let subscribed = self.hub.rooms.get(&self.room_id).is_some_and(|room| {
            room.subscribers.iter().any(|s| s.identity == envelope.from)
        });
        if !subscribed {
            return Err(Error::NotSubscribed(envelope.from));
        }

        self.hub.broadcast(&self.room_id, &envelope);
        Ok(())
    }

    fn subscribe(&self, identity: &Identity) -> Result<mpsc::UnboundedReceiver<SignalEnvelope>> {
        self.hub.subscribe(&self.room_id, identity)
    }

    fn unsubscribe(&self, identity: &Identity) {
        self.hub.unsubscribe(&self.room_id, identity);
    }
}

#[async_trait]
impl PresenceDirectory for RoomChannel {
    async fn attach(
        &self,
        identity: &Identity,
        display_name: &str,
    ) -> Result<mpsc::UnboundedReceiver<PresenceEvent>> {
        self.hub.attach(
            &self.room_id,
            PresenceEntry::new(identity.clone(), display_name),
        )
    }

    fn current_members(&self) -> Vec<PresenceEntry> {
        self.hub.members(&self.room_id)
    }

    async fn detach(&self, identity: &Identity) -> Result<()> {
        self.hub.detach(&self.room_id, identity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{SessionDescription, SignalPayload};
    use std::time::Duration;

    fn offer(from: &str, to: &str) -> SignalEnvelope {
        SignalEnvelope::new(
            Identity::from(from),
            Identity::from(to),
            SignalPayload::Offer(SessionDescription::offer("v=0")),
        )
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let hub = RoomHub::new();
        let channel = hub.channel("lobby");

        let mut alice_rx = channel.subscribe(&Identity::from("alice")).unwrap();
        let mut bob_rx = channel.subscribe(&Identity::from("bob")).unwrap();
        assert_eq!(hub.subscriber_count(channel.room_id()), 2);

        channel.send(offer("alice", "bob")).await.unwrap();

        let received = bob_rx.recv().await.unwrap();
        assert_eq!(received.from, Identity::from("alice"));

        let echoed = tokio::time::timeout(Duration::from_millis(50), alice_rx.recv()).await;
        assert!(echoed.is_err(), "sender should not receive its own envelope");
    }

    #[tokio::test]
    async fn test_per_sender_order_is_preserved() {
        let hub = RoomHub::new();
        let channel = hub.channel("lobby");
        let _alice_rx = channel.subscribe(&Identity::from("alice")).unwrap();
        let mut bob_rx = channel.subscribe(&Identity::from("bob")).unwrap();

        for i in 0..5 {
            let envelope = SignalEnvelope::new(
                Identity::from("alice"),
                Identity::from("bob"),
                SignalPayload::Offer(SessionDescription::offer(format!("sdp-{i}"))),
            );
            channel.send(envelope).await.unwrap();
        }

        for i in 0..5 {
            let envelope = bob_rx.recv().await.unwrap();
            assert_eq!(
                envelope.payload,
                SignalPayload::Offer(SessionDescription::offer(format!("sdp-{i}")))
            );
        }
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let hub = RoomHub::new();
        let lobby = hub.channel("lobby");
        let other = hub.channel("other");

        let _alice_rx = lobby.subscribe(&Identity::from("alice")).unwrap();
        let mut bob_rx = other.subscribe(&Identity::from("bob")).unwrap();

        lobby.send(offer("alice", "bob")).await.unwrap();

        let received = tokio::time::timeout(Duration::from_millis(50), bob_rx.recv()).await;
        assert!(received.is_err());
        assert_eq!(hub.room_count(), 2);
    }

    #[tokio::test]
    async fn test_send_requires_subscription() {
        let hub = RoomHub::new();
        let channel = hub.channel("lobby");

        let result = channel.send(offer("mallory", "bob")).await;
        assert!(matches!(result, Err(Error::NotSubscribed(_))));
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let hub = RoomHub::new();
        let channel = hub.channel("lobby");
        let _alice_rx = channel.subscribe(&Identity::from("alice")).unwrap();
        let bob_rx = channel.subscribe(&Identity::from("bob")).unwrap();
        drop(bob_rx);

        channel.send(offer("alice", "bob")).await.unwrap();
        assert_eq!(hub.subscriber_count(channel.room_id()), 1);
    }

    #[tokio::test]
    async fn test_live_subscription_is_not_replaced() {
        let hub = RoomHub::new();
        let channel = hub.channel("lobby");
        let _bob_rx = channel.subscribe(&Identity::from("bob")).unwrap();
        let mut alice_rx = channel.subscribe(&Identity::from("alice")).unwrap();

        let second = channel.subscribe(&Identity::from("alice"));
        assert!(matches!(second, Err(Error::AlreadySubscribed(id)) if id.as_str() == "alice"));
        assert_eq!(hub.subscriber_count(channel.room_id()), 2);

        channel.send(offer("bob", "alice")).await.unwrap();
        assert_eq!(alice_rx.recv().await.unwrap().from, Identity::from("bob"));
    }

    #[tokio::test]
    async fn test_dropped_subscription_can_be_taken_over() {
        let hub = RoomHub::new();
        let channel = hub.channel("lobby");
        let alice_rx = channel.subscribe(&Identity::from("alice")).unwrap();
        drop(alice_rx);

        let _alice_rx = channel.subscribe(&Identity::from("alice")).unwrap();
        assert_eq!(hub.subscriber_count(channel.room_id()), 1);
    }

    #[tokio::test]
    async fn test_attach_notifies_existing_members_only() {
        let hub = RoomHub::new();
        let channel = hub.channel("lobby");

        let mut alice_rx = channel.attach(&Identity::from("alice"), "Alice").await.unwrap();
        let mut bob_rx = channel.attach(&Identity::from("bob"), "Bob").await.unwrap();

        match alice_rx.recv().await.unwrap() {
            PresenceEvent::Joined(entry) => {
                assert_eq!(entry.identity, Identity::from("bob"));
                assert_eq!(entry.display_name, "Bob");
            }
            other => panic!("unexpected event {other:?}"),
        }

        let own = tokio::time::timeout(Duration::from_millis(50), bob_rx.recv()).await;
        assert!(own.is_err(), "a member is not told about its own join");
        assert_eq!(channel.current_members().len(), 2);
    }

    #[tokio::test]
    async fn test_attach_twice_is_rejected() {
        let hub = RoomHub::new();
        let channel = hub.channel("lobby");

        let _rx = channel.attach(&Identity::from("alice"), "Alice").await.unwrap();
        let result = channel.attach(&Identity::from("alice"), "Alice").await;

        assert!(matches!(result, Err(Error::AlreadyAttached(_))));
    }

    #[tokio::test]
    async fn test_detach_emits_left() {
        let hub = RoomHub::new();
        let channel = hub.channel("lobby");

        let mut alice_rx = channel.attach(&Identity::from("alice"), "Alice").await.unwrap();
        let _bob_rx = channel.attach(&Identity::from("bob"), "Bob").await.unwrap();
        let _joined = alice_rx.recv().await.unwrap();

        channel.detach(&Identity::from("bob")).await.unwrap();

        assert_eq!(
            alice_rx.recv().await.unwrap(),
            PresenceEvent::Left {
                identity: Identity::from("bob")
            }
        );
        assert_eq!(channel.current_members().len(), 1);

        // Detaching again is harmless
        channel.detach(&Identity::from("bob")).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_presence_stream_expires_member() {
        let hub = RoomHub::new();
        let channel = hub.channel("lobby");

        let mut alice_rx = channel.attach(&Identity::from("alice"), "Alice").await.unwrap();
        let bob_rx = channel.attach(&Identity::from("bob"), "Bob").await.unwrap();
        let _joined = alice_rx.recv().await.unwrap();
        drop(bob_rx);

        // Carol's join cannot reach Bob, so Bob is expired and Alice hears about it
        let _carol_rx = channel.attach(&Identity::from("carol"), "Carol").await.unwrap();

        let mut events = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), alice_rx.recv()).await
        {
            events.push(event);
        }

        assert!(events.contains(&PresenceEvent::Left {
            identity: Identity::from("bob")
        }));
        assert_eq!(channel.current_members().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_room_is_removed() {
        let hub = RoomHub::new();
        let channel = hub.channel("lobby");

        let _rx = channel.attach(&Identity::from("alice"), "Alice").await.unwrap();
        let _sig = channel.subscribe(&Identity::from("alice")).unwrap();
        assert_eq!(hub.room_count(), 1);

        channel.unsubscribe(&Identity::from("alice"));
        channel.detach(&Identity::from("alice")).await.unwrap();
        assert_eq!(hub.room_count(), 0);
    }
}
