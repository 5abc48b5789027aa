//! Error types for the signaling layer

use thiserror::Error;

use crate::types::Identity;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Identity {0} is already attached to the room")]
    AlreadyAttached(Identity),

    #[error("Identity {0} is already subscribed to the room")]
    AlreadySubscribed(Identity),

    #[error("Identity {0} is not subscribed to the room")]
    NotSubscribed(Identity),
}

/// Result type for signaling operations
pub type Result<T> = std::result::Result<T, Error>;
