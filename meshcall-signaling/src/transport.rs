//! Collaborator seams consumed by the negotiation coordinator

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::events::{PresenceEntry, PresenceEvent, SignalEnvelope};
use crate::types::Identity;
use crate::Result;

/// Room-scoped broadcast channel for connection-setup messages
///
/// Delivery is in order per sender; nothing is promised across senders.
/// Failed sends are not retried.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Deliver an envelope to every other subscriber of the room
    async fn send(&self, envelope: SignalEnvelope) -> Result<()>;

    /// Register `identity` as a receiver; each delivered envelope arrives once
    fn subscribe(&self, identity: &Identity) -> Result<mpsc::UnboundedReceiver<SignalEnvelope>>;

    fn unsubscribe(&self, identity: &Identity);
}

/// Tracks which identities are attached to the room channel
#[async_trait]
pub trait PresenceDirectory: Send + Sync {
    /// Announce local presence; the returned stream carries other members'
    /// joins and leaves from this point on
    async fn attach(
        &self,
        identity: &Identity,
        display_name: &str,
    ) -> Result<mpsc::UnboundedReceiver<PresenceEvent>>;

    fn current_members(&self) -> Vec<PresenceEntry>;

    async fn detach(&self, identity: &Identity) -> Result<()>;
}
