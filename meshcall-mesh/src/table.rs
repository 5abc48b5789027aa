//! Session table for one room call

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::connection::PeerConnection;
use crate::session::PeerSession;
use crate::types::Identity;
use crate::{Error, Result};

/// Departed identities remembered at once; the oldest is forgotten first
const DEPARTED_CAPACITY: usize = 1024;

/// Live peer sessions keyed by remote identity
///
/// Holds at most one session per remote participant. Identities that left
/// presence are remembered so late signaling from them cannot open a new
/// session until they are seen joining again. That memory is bounded and is
/// wiped when the call ends.
#[derive(Default)]
pub struct SessionTable {
    sessions: BTreeMap<Identity, PeerSession>,
    departed: HashSet<Identity>,
    departed_order: VecDeque<Identity>,
}

impl SessionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, remote: &Identity) -> bool {
        self.sessions.contains_key(remote)
    }

    pub fn get_mut(&mut self, remote: &Identity) -> Option<&mut PeerSession> {
        self.sessions.get_mut(remote)
    }

    /// Add a session; an existing session for the same identity is never replaced
    pub fn insert(&mut self, session: PeerSession) -> Result<&mut PeerSession> {
        let remote = session.remote().clone();
        if self.sessions.contains_key(&remote) {
            return Err(Error::DuplicateSession(remote));
        }
        Ok(self.sessions.entry(remote).or_insert(session))
    }

    pub fn remove(&mut self, remote: &Identity) -> Option<PeerSession> {
        self.sessions.remove(remote)
    }

    /// Remove every session, leaving the table empty
    pub fn drain(&mut self) -> Vec<PeerSession> {
        std::mem::take(&mut self.sessions).into_values().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions.values()
    }

    /// Connection handles for sampling outside the table
    pub fn connections(&self) -> Vec<(Identity, Arc<dyn PeerConnection>)> {
        self.sessions
            .iter()
            .map(|(id, session)| (id.clone(), session.connection()))
            .collect()
    }

    pub fn mark_departed(&mut self, remote: &Identity) {
        if !self.departed.insert(remote.clone()) {
            return;
        }
        self.departed_order.push_back(remote.clone());
        while self.departed_order.len() > DEPARTED_CAPACITY {
            if let Some(oldest) = self.departed_order.pop_front() {
                self.departed.remove(&oldest);
            }
        }
    }

    pub fn clear_departed(&mut self, remote: &Identity) {
        if self.departed.remove(remote) {
            self.departed_order.retain(|id| id != remote);
        }
    }

    /// Forget every departed identity
    pub fn forget_departed(&mut self) {
        self.departed.clear();
        self.departed_order.clear();
    }

    #[must_use]
    pub fn is_departed(&self, remote: &Identity) -> bool {
        self.departed.contains(remote)
    }
}
