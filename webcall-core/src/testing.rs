//! Scripted peer connection adapter for tests
//!
//! [`RecordingAdapter`] follows the engine contract closely enough for negotiation
//! tests (remote description gating, idempotent close) and records every call.

use crate::adapter::{
    expect_description, AdapterError, AdapterEvent, AdapterEvents, LocalStream,
    PeerConnectionAdapter,
};
use crate::types::{CameraFacing, IceCandidate, MediaConstraints, MediaKind, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// One recorded adapter invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    /// `acquire_local_media`
    AcquireLocalMedia,
    /// `create_offer`
    CreateOffer,
    /// `create_answer`
    CreateAnswer,
    /// `set_local_description`
    SetLocalDescription(SdpType),
    /// `set_remote_description`
    SetRemoteDescription(SdpType),
    /// `add_ice_candidate`
    AddIceCandidate(IceCandidate),
    /// `replace_video_track`
    ReplaceVideoTrack(CameraFacing),
    /// `set_track_enabled`
    SetTrackEnabled(MediaKind, bool),
    /// `close`
    Close,
}

#[derive(Default)]
struct State {
    calls: Vec<AdapterCall>,
    remote: Option<SdpType>,
    added: Vec<IceCandidate>,
    has_video: bool,
}

/// Adapter double that records calls
pub struct RecordingAdapter {
    state: Mutex<State>,
    events_tx: mpsc::UnboundedSender<AdapterEvent>,
    events_rx: Mutex<Option<AdapterEvents>>,
    offer_gate: Option<Arc<Notify>>,
    fail_media: bool,
    closes: AtomicUsize,
    closed: AtomicBool,
}

impl RecordingAdapter {
    /// Adapter where every operation succeeds
    #[must_use]
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(State::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            offer_gate: None,
            fail_media: false,
            closes: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Block `create_offer` until [`release_create_offer`](Self::release_create_offer)
    #[must_use]
    pub fn gate_create_offer(mut self) -> Self {
        self.offer_gate = Some(Arc::new(Notify::new()));
        self
    }

    /// Make `acquire_local_media` fail
    #[must_use]
    pub fn fail_media(mut self) -> Self {
        self.fail_media = true;
        self
    }

    /// Let a gated `create_offer` complete
    pub fn release_create_offer(&self) {
        if let Some(gate) = &self.offer_gate {
            gate.notify_one();
        }
    }

    /// Inject an engine event
    pub fn emit(&self, event: AdapterEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Recorded calls in order
    #[must_use]
    pub fn calls(&self) -> Vec<AdapterCall> {
        self.state.lock().calls.clone()
    }

    /// Candidates accepted by `add_ice_candidate`
    #[must_use]
    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().added.clone()
    }

    /// Number of `close` invocations
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn record(&self, call: AdapterCall) {
        self.state.lock().calls.push(call);
    }

    fn ensure_open(&self) -> Result<(), AdapterError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(AdapterError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Default for RecordingAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerConnectionAdapter for RecordingAdapter {
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, AdapterError> {
        self.record(AdapterCall::AcquireLocalMedia);
        if self.fail_media {
            return Err(AdapterError::MediaUnavailable("camera busy".to_string()));
        }
        self.state.lock().has_video = constraints.has_video();
        Ok(LocalStream {
            id: "local-stream".to_string(),
            kinds: constraints.to_media_kinds(),
            facing: constraints.facing,
        })
    }

    async fn create_offer(&self) -> Result<SessionDescription, AdapterError> {
        self.ensure_open()?;
        self.record(AdapterCall::CreateOffer);
        if let Some(gate) = &self.offer_gate {
            gate.notified().await;
        }
        Ok(SessionDescription::offer("v=0\r\nrecording-offer\r\n"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, AdapterError> {
        self.ensure_open()?;
        self.record(AdapterCall::CreateAnswer);
        if self.state.lock().remote != Some(SdpType::Offer) {
            return Err(AdapterError::InvalidState("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer("v=0\r\nrecording-answer\r\n"))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), AdapterError> {
        self.ensure_open()?;
        self.record(AdapterCall::SetLocalDescription(desc.sdp_type));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), AdapterError> {
        self.ensure_open()?;
        self.record(AdapterCall::SetRemoteDescription(desc.sdp_type));
        expect_description(desc, desc.sdp_type)?;
        let mut state = self.state.lock();
        match state.remote {
            Some(current) if current == desc.sdp_type => Ok(()),
            Some(current) => Err(AdapterError::InvalidState(format!(
                "remote {current:?} already applied"
            ))),
            None => {
                state.remote = Some(desc.sdp_type);
                Ok(())
            }
        }
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), AdapterError> {
        self.ensure_open()?;
        self.record(AdapterCall::AddIceCandidate(candidate.clone()));
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(AdapterError::NoRemoteDescription);
        }
        state.added.push(candidate.clone());
        Ok(())
    }

    async fn replace_video_track(&self, facing: CameraFacing) -> Result<(), AdapterError> {
        self.ensure_open()?;
        self.record(AdapterCall::ReplaceVideoTrack(facing));
        if self.state.lock().has_video {
            Ok(())
        } else {
            Err(AdapterError::NoActiveSender)
        }
    }

    async fn set_track_enabled(&self, kind: MediaKind, enabled: bool) -> Result<(), AdapterError> {
        self.ensure_open()?;
        self.record(AdapterCall::SetTrackEnabled(kind, enabled));
        Ok(())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.record(AdapterCall::Close);
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn take_events(&self) -> Option<AdapterEvents> {
        self.events_rx.lock().take()
    }
}
