use thiserror::Error;

use crate::types::Identity;

/// Errors raised while negotiating or running a mesh call
#[derive(Debug, Error)]
pub enum Error {
    #[error("WebRTC error: {0}")]
    Rtc(#[from] webrtc::Error),

    #[error("Signaling error: {0}")]
    Signaling(#[from] meshcall_signaling::Error),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Session for {0} already exists")]
    DuplicateSession(Identity),

    #[error("Call has ended")]
    CallEnded,
}

/// Local capture failures
///
/// These abort only the capture action that raised them; the call continues.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("No capture device: {0}")]
    NoDevice(String),

    #[error("Capture already active")]
    AlreadyActive,
}

pub type Result<T> = std::result::Result<T, Error>;
