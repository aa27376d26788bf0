//! Peer connection engine capabilities
//!
//! The negotiation logic never touches a media engine directly. It drives a
//! [`PeerConnectionAdapter`], one instance per call attempt, and reacts to the
//! [`AdapterEvent`] stream the adapter hands out once.

use crate::types::{CameraFacing, IceCandidate, MediaConstraints, MediaKind, SdpType, SessionDescription};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Adapter errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Camera or microphone could not be acquired
    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    /// Operation not valid in the current signaling state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Candidate applied before any remote description
    #[error("No remote description set")]
    NoRemoteDescription,

    /// No video sender to replace a track on
    #[error("No active video sender")]
    NoActiveSender,

    /// Description rejected by the engine
    #[error("Invalid description: {0}")]
    InvalidDescription(String),

    /// Adapter already closed
    #[error("Peer connection closed")]
    Closed,

    /// Any other engine failure
    #[error("Engine error: {0}")]
    Engine(String),
}

/// Peer connection state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineConnectionState {
    /// Not started
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media path established
    Connected,
    /// Path lost
    Disconnected,
    /// Path could not be established
    Failed,
    /// Connection closed
    Closed,
}

impl EngineConnectionState {
    /// Whether this state means the media path is gone
    #[must_use]
    pub fn is_lost(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

impl std::fmt::Display for EngineConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Local capture handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStream {
    /// Stream identifier
    pub id: String,
    /// Captured kinds
    pub kinds: Vec<MediaKind>,
    /// Active camera
    pub facing: CameraFacing,
}

/// Remote media announced by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    /// Stream identifier
    pub id: String,
    /// Track kind
    pub kind: MediaKind,
}

/// Events surfaced by an adapter
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    /// A local candidate was gathered
    LocalIceCandidate(IceCandidate),
    /// A remote track arrived
    RemoteTrackAdded(RemoteStream),
    /// Peer connection state changed
    ConnectionStateChanged(EngineConnectionState),
}

/// Receiving half of an adapter's event stream
pub type AdapterEvents = mpsc::UnboundedReceiver<AdapterEvent>;

/// Capabilities required from a media engine
#[async_trait]
pub trait PeerConnectionAdapter: Send + Sync + 'static {
    /// Acquire camera and microphone per the constraints
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, AdapterError>;

    /// Create an offer
    async fn create_offer(&self) -> Result<SessionDescription, AdapterError>;

    /// Create an answer; fails with `InvalidState` unless a remote offer is applied
    async fn create_answer(&self) -> Result<SessionDescription, AdapterError>;

    /// Apply a local description
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), AdapterError>;

    /// Apply a remote description; repeating the same type is a no-op
    async fn set_remote_description(&self, desc: &SessionDescription)
        -> Result<(), AdapterError>;

    /// Add a remote candidate; fails with `NoRemoteDescription` before a remote description
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), AdapterError>;

    /// Switch the camera on the active video sender
    async fn replace_video_track(&self, facing: CameraFacing) -> Result<(), AdapterError>;

    /// Enable or disable the local track of one kind
    async fn set_track_enabled(&self, kind: MediaKind, enabled: bool) -> Result<(), AdapterError>;

    /// Release the connection and capture devices; idempotent
    async fn close(&self) -> Result<(), AdapterError>;

    /// Take the event stream; only the first call returns it
    fn take_events(&self) -> Option<AdapterEvents>;
}

/// Check a description before handing it to the engine
///
/// # Errors
///
/// Returns `InvalidDescription` if the type does not match or the SDP body is empty
pub fn expect_description(desc: &SessionDescription, expected: SdpType) -> Result<(), AdapterError> {
    if desc.sdp_type != expected {
        return Err(AdapterError::InvalidDescription(format!(
            "expected {expected:?}, got {:?}",
            desc.sdp_type
        )));
    }
    if desc.sdp.trim().is_empty() {
        return Err(AdapterError::InvalidDescription("empty SDP".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lost_states() {
        assert!(EngineConnectionState::Failed.is_lost());
        assert!(EngineConnectionState::Disconnected.is_lost());
        assert!(EngineConnectionState::Closed.is_lost());
        assert!(!EngineConnectionState::Connecting.is_lost());
        assert!(!EngineConnectionState::Connected.is_lost());
    }

    #[test]
    fn test_expect_description() {
        assert!(expect_description(&SessionDescription::offer("v=0"), SdpType::Offer).is_ok());
        assert!(matches!(
            expect_description(&SessionDescription::answer("v=0"), SdpType::Offer),
            Err(AdapterError::InvalidDescription(_))
        ));
        assert!(matches!(
            expect_description(&SessionDescription::offer("  "), SdpType::Offer),
            Err(AdapterError::InvalidDescription(_))
        ));
    }
}
