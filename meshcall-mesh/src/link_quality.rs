//! Link quality monitoring
//!
//! Samples the round-trip time of every live connection and grades it.
//! Each sample replaces the previous one; no history is kept.
//!
//! ## Grades
//! - Good: RTT < 100ms
//! - Fair: RTT < 300ms
//! - Poor: RTT >= 300ms

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use crate::connection::PeerConnection;
use crate::types::Identity;

/// Coarse link grade derived from round-trip time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkGrade {
    Good,
    Fair,
    Poor,
}

impl LinkGrade {
    #[must_use]
    pub const fn from_rtt_ms(rtt_ms: u32) -> Self {
        if rtt_ms < 100 {
            Self::Good
        } else if rtt_ms < 300 {
            Self::Fair
        } else {
            Self::Poor
        }
    }
}

/// Latest link measurement for one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSample {
    pub rtt_ms: u32,
    pub grade: LinkGrade,
    pub sampled_at: DateTime<Utc>,
}

/// Per-peer link quality, shared between the coordinator and its sampler
pub struct LinkQualityMonitor {
    peers: DashMap<Identity, LinkSample>,
}

impl LinkQualityMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }

    /// Record one round-trip measurement, superseding the last
    pub fn record(&self, peer: &Identity, rtt: Duration) {
        let rtt_ms = u32::try_from(rtt.as_millis()).unwrap_or(u32::MAX);
        self.peers.insert(
            peer.clone(),
            LinkSample {
                rtt_ms,
                grade: LinkGrade::from_rtt_ms(rtt_ms),
                sampled_at: Utc::now(),
            },
        );
    }

    /// Poll every connection once. Connections without an estimate keep
    /// their previous sample.
    pub async fn sample_all(&self, connections: Vec<(Identity, Arc<dyn PeerConnection>)>) -> usize {
        let mut sampled = 0;
        for (peer, connection) in connections {
            if let Some(rtt) = connection.round_trip_time().await {
                trace!(peer = %peer, rtt_ms = rtt.as_millis() as u64, "Link sampled");
                self.record(&peer, rtt);
                sampled += 1;
            }
        }
        sampled
    }

    #[must_use]
    pub fn get(&self, peer: &Identity) -> Option<LinkSample> {
        self.peers.get(peer).map(|sample| sample.clone())
    }

    pub fn remove(&self, peer: &Identity) {
        self.peers.remove(peer);
    }

    /// Drop samples for peers that no longer have a session
    pub fn retain(&self, mut keep: impl FnMut(&Identity) -> bool) {
        self.peers.retain(|peer, _| keep(peer));
    }

    pub fn clear(&self) {
        self.peers.clear();
    }
}

impl Default for LinkQualityMonitor {
    fn default() -> Self {
        Self::new()
    }
}
