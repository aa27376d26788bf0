//! Webcall - one-to-one call negotiation over a shared signaling document
//!
//! Two participants negotiate a WebRTC session through a single mutable record per
//! call (the [`CallSession`]). The caller publishes an offer, the callee rings, accepts
//! and answers, and both sides trickle ICE candidates into the same record until the
//! peer connection comes up. It features:
//!
//! - **Single-writer negotiation**: one coordinator task per call owns the offer/answer
//!   exchange and the pending ICE queue
//! - **Field-level merges**: session updates never regress status or drop candidates
//! - **Exactly-once teardown**: hang-up, rejection, remote end and failures all funnel
//!   through one stop signal
//! - **Pluggable seams**: the signaling store and the media engine are traits
//!
//! # Examples
//!
//! ```rust,no_run
//! use webcall_core::{CallService, InMemorySignalingChannel, Participant, WebRtcAdapterFactory};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let channel = Arc::new(InMemorySignalingChannel::new());
//! let service = CallService::builder(channel, WebRtcAdapterFactory).build();
//!
//! let call = service
//!     .start_call(Participant::new("alice"), Some(Participant::new("bob")))
//!     .await?;
//! println!("share this id: {}", call.call_id());
//!
//! let summary = call.wait_for_end().await;
//! println!("call ended after {}s", summary.duration_secs);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Participant identity
pub mod identity;

/// Shared call session document and merge rules
pub mod session;

/// Pending remote ICE candidates
pub mod ice_queue;

/// Peer connection engine abstraction
pub mod adapter;

/// Signaling channel abstraction and retrying handler
pub mod signaling;

/// In-process signaling channel
pub mod memory;

/// Offer/answer negotiation coordinator
pub mod negotiation;

/// Call lifecycle management
pub mod call;

/// Call service and configuration
pub mod service;

/// Adapter backed by the webrtc crate (requires webrtc-engine feature)
#[cfg(feature = "webrtc-engine")]
pub mod webrtc_adapter;

/// Scripted adapter for tests (requires test-utils feature)
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export main types at crate root
pub use adapter::{
    AdapterError, AdapterEvent, AdapterEvents, EngineConnectionState, LocalStream,
    PeerConnectionAdapter, RemoteStream,
};
pub use call::{CallError, CallEvent, CallLifecycleManager, CallOptions, CallSummary};
pub use ice_queue::IceCandidateQueue;
pub use identity::{Participant, ParticipantId};
pub use memory::InMemorySignalingChannel;
pub use negotiation::{NegotiationCoordinator, NegotiationPhase, StopReason, StopSignal};
pub use service::{
    AdapterFactory, CallService, CallServiceBuilder, ServiceError, WebCallConfig,
};
pub use session::{CallSession, MergeReport, SessionUpdate};
pub use signaling::{
    create_or_join, RetryPolicy, SignalingChannel, SignalingError, SignalingHandler,
    SnapshotCallback, Subscription,
};
pub use types::*;
#[cfg(feature = "webrtc-engine")]
pub use webrtc_adapter::{WebRtcAdapterFactory, WebRtcPeerAdapter};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallEvent, CallLifecycleManager, CallOptions, CallSummary};
    pub use crate::identity::Participant;
    pub use crate::memory::InMemorySignalingChannel;
    pub use crate::service::{CallService, WebCallConfig};
    pub use crate::signaling::{SignalingChannel, SignalingHandler};
    pub use crate::types::{CallId, CallRole, CallStatus, CameraFacing, MediaConstraints};
    #[cfg(feature = "webrtc-engine")]
    pub use crate::webrtc_adapter::WebRtcAdapterFactory;
}
