//! Call lifecycle management
//!
//! A [`CallLifecycleManager`] owns one call from the local participant's point of view.
//! It subscribes to the shared session, surfaces ringing, starts the
//! [`NegotiationCoordinator`] when the call is accepted, and guarantees that the
//! adapter is closed and the subscription cancelled exactly once however the call
//! ends.
//!
//! # Call flow
//!
//! ```text
//! caller: dial ──► calling ──► waiting (offer) ─────────────────────► connected ──► ended
//! callee:               join ──► ringing ──► accepted ──► (answer) ──► connected ──► ended
//!                                   └──► rejected
//! ```
//!
//! Whatever fires first among hang-up, reject, remote termination, leave and failure
//! wins; a single watchdog task performs the terminal write-back and teardown.

use crate::adapter::{AdapterError, EngineConnectionState, LocalStream, PeerConnectionAdapter, RemoteStream};
use crate::identity::{Participant, ParticipantId};
use crate::negotiation::{NegotiationCoordinator, NegotiationPhase, StopReason, StopSignal};
use crate::session::{CallSession, SessionUpdate};
use crate::signaling::{create_or_join, SignalingChannel, SignalingError, SnapshotCallback, Subscription};
use crate::types::{CallId, CallRole, CallStatus, CameraFacing, MediaConstraints, MediaKind};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Call errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Camera or microphone unavailable
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// Signaling channel failure
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Offer/answer exchange failed
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// A candidate could not be applied
    #[error("ICE candidate error: {0}")]
    IceCandidate(String),

    /// Releasing resources failed
    #[error("Cleanup error: {0}")]
    Cleanup(String),

    /// Media path lost
    #[error("Connection lost: {0}")]
    ConnectionLost(EngineConnectionState),

    /// Operation not valid for the call's current state
    #[error("Invalid call state: {0}")]
    InvalidState(String),
}

impl CallError {
    /// Whether the error ends the call
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::IceCandidate(_) | Self::Cleanup(_))
    }

    /// Short message fit for showing to a user
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Signaling(e) => e.user_message(),
            Self::MediaAcquisition(_) => "Could not access camera or microphone",
            Self::ConnectionLost(_) => "Connection lost",
            Self::Negotiation(_) => "Failed to initialize call",
            Self::IceCandidate(_) | Self::Cleanup(_) | Self::InvalidState(_) => {
                "Operation failed. Please try again."
            }
        }
    }
}

/// Per-call options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOptions {
    /// Local media constraints
    pub constraints: MediaConstraints,
    /// Accept incoming calls as soon as they ring
    pub auto_accept: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            constraints: MediaConstraints::video_call(),
            auto_accept: false,
        }
    }
}

/// Outcome of a finished call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSummary {
    /// Call identifier
    pub call_id: CallId,
    /// Local role
    pub role: CallRole,
    /// Final shared status as far as this participant knows
    pub status: CallStatus,
    /// Why the call stopped
    pub reason: StopReason,
    /// Connected time in whole seconds
    pub duration_secs: u64,
    /// Failure message, if any
    pub error: Option<String>,
}

/// Events surfaced to the application
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Incoming call is ringing
    Ringing {
        /// Call identifier
        call_id: CallId,
        /// Who is calling
        caller: ParticipantId,
        /// Caller display email
        caller_email: Option<String>,
    },
    /// Shared status changed
    StatusChanged(CallStatus),
    /// Local capture started
    LocalStream(LocalStream),
    /// Remote media arrived
    RemoteStream(RemoteStream),
    /// Media path established
    Connected,
    /// Call finished and resources were released
    Ended(CallSummary),
}

/// Releases the adapter and the subscription exactly once
#[derive(Default)]
struct Teardown {
    done: AtomicBool,
    subscription: Mutex<Option<Subscription>>,
}

impl Teardown {
    fn attach(&self, subscription: Subscription) {
        let mut slot = self.subscription.lock();
        if self.done.load(Ordering::SeqCst) {
            drop(slot);
            subscription.cancel();
        } else {
            *slot = Some(subscription);
        }
    }

    async fn run(&self, adapter: &dyn PeerConnectionAdapter) -> bool {
        if self.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
        if let Err(e) = adapter.close().await {
            let err = CallError::Cleanup(e.to_string());
            tracing::warn!(error = %err, "Adapter close failed");
        }
        true
    }
}

struct CallInner {
    call_id: CallId,
    me: Participant,
    role: CallRole,
    options: CallOptions,
    channel: Arc<dyn SignalingChannel>,
    adapter: Arc<dyn PeerConnectionAdapter>,
    stop: StopSignal,
    phase: Arc<watch::Sender<NegotiationPhase>>,
    latest: Mutex<CallSession>,
    forward: Mutex<Option<mpsc::UnboundedSender<CallSession>>>,
    coordinator: Mutex<Option<JoinHandle<NegotiationPhase>>>,
    events: mpsc::UnboundedSender<CallEvent>,
    rang: AtomicBool,
    negotiating: AtomicBool,
    facing: Mutex<CameraFacing>,
    teardown: Teardown,
    summary: watch::Sender<Option<CallSummary>>,
}

impl CallInner {
    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    async fn on_snapshot(self: &Arc<Self>, session: CallSession) {
        let changed = {
            let forward = self.forward.lock();
            let mut latest = self.latest.lock();
            let changed = latest.status != session.status;
            *latest = session.clone();
            if let Some(tx) = forward.as_ref() {
                let _ = tx.send(session.clone());
            }
            changed
        };
        if changed {
            tracing::debug!(call_id = %self.call_id, status = %session.status, "Session status changed");
            self.emit(CallEvent::StatusChanged(session.status));
        }

        if self.role == CallRole::Callee
            && !session.status.is_terminal()
            && session.offer().is_some()
            && !self.negotiating.load(Ordering::SeqCst)
        {
            self.ring(&session).await;
        }
    }

    async fn ring(self: &Arc<Self>, session: &CallSession) {
        if self.rang.swap(true, Ordering::SeqCst) {
            return;
        }
        let update = SessionUpdate::new()
            .status(CallStatus::Ringing)
            .callee(&self.me);
        if let Err(e) = self.channel.update(&self.call_id, update).await {
            tracing::warn!(call_id = %self.call_id, error = %e, "Failed to publish ringing status");
        }
        tracing::info!(call_id = %self.call_id, caller = %session.caller_id, "Incoming call ringing");
        self.emit(CallEvent::Ringing {
            call_id: self.call_id.clone(),
            caller: session.caller_id.clone(),
            caller_email: session.caller_email.clone(),
        });

        if self.options.auto_accept {
            if let Err(e) = self.accept().await {
                tracing::warn!(call_id = %self.call_id, error = %e, "Auto-accept failed");
            }
        }
    }

    async fn accept(self: &Arc<Self>) -> Result<(), CallError> {
        if self.role != CallRole::Callee {
            return Err(CallError::InvalidState("only the callee can accept".to_string()));
        }
        if self.stop.is_raised() {
            return Err(CallError::InvalidState("call is over".to_string()));
        }
        if self.negotiating.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !self.rang.load(Ordering::SeqCst) {
            return Err(CallError::InvalidState("call is not ringing".to_string()));
        }

        self.channel
            .update(
                &self.call_id,
                SessionUpdate::new()
                    .status(CallStatus::Accepted)
                    .callee(&self.me),
            )
            .await?;
        tracing::info!(call_id = %self.call_id, "Call accepted");
        self.start_negotiation();
        Ok(())
    }

    fn start_negotiation(self: &Arc<Self>) {
        if self.stop.is_raised() || self.negotiating.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let attempt = {
            let mut forward = self.forward.lock();
            let latest = self.latest.lock();
            let _ = tx.send(latest.clone());
            *forward = Some(tx);
            latest.attempt
        };

        let coordinator = NegotiationCoordinator::new(
            self.call_id.clone(),
            self.role,
            self.adapter.clone(),
            self.channel.clone(),
            self.stop.clone(),
        )
        .with_attempt(attempt)
        .with_constraints(self.options.constraints.clone())
        .with_phase(self.phase.clone())
        .with_events(self.events.clone());

        tracing::debug!(call_id = %self.call_id, role = %self.role, attempt, "Starting negotiation");
        *self.coordinator.lock() = Some(tokio::spawn(coordinator.run(rx)));
    }

    async fn finish(&self, reason: StopReason) {
        let now = Utc::now();
        let latest = self.latest.lock().clone();

        let (update, duration_secs) = match &reason {
            StopReason::LocalHangup => {
                let secs = latest.duration_secs_until(now);
                let update = SessionUpdate::new()
                    .status(CallStatus::Ended)
                    .ended_at(now)
                    .duration(secs);
                (Some(update), secs)
            }
            StopReason::LocalReject => (
                Some(
                    SessionUpdate::new()
                        .status(CallStatus::Rejected)
                        .ended_at(now),
                ),
                0,
            ),
            StopReason::Failed(CallError::Signaling(e)) if e.is_transient() => (None, 0),
            StopReason::Failed(err) => (
                Some(
                    SessionUpdate::new()
                        .status(CallStatus::Failed)
                        .ended_at(now)
                        .error(err.to_string()),
                ),
                0,
            ),
            _ => {
                let secs = latest.duration.unwrap_or_else(|| {
                    latest.duration_secs_until(latest.ended_at.unwrap_or(now))
                });
                (None, secs)
            }
        };

        if let Some(update) = update {
            if let Err(e) = self.channel.update(&self.call_id, update).await {
                let err = CallError::Cleanup(e.to_string());
                tracing::warn!(call_id = %self.call_id, error = %err, "Terminal status not written");
            }
        }

        if self.teardown.run(self.adapter.as_ref()).await {
            tracing::debug!(call_id = %self.call_id, "Call resources released");
        }

        let terminal = reason.terminal_phase();
        self.phase.send_if_modified(|phase| {
            if phase.is_terminal() {
                return false;
            }
            *phase = terminal;
            true
        });

        let status = match &reason {
            StopReason::LocalHangup => CallStatus::Ended,
            StopReason::LocalReject => CallStatus::Rejected,
            StopReason::Failed(_) => CallStatus::Failed,
            StopReason::RemoteStatus(status) => *status,
            StopReason::Left | StopReason::Superseded => latest.status,
        };
        let error = match &reason {
            StopReason::Failed(err) => Some(err.to_string()),
            _ => latest.error.clone(),
        };
        let summary = CallSummary {
            call_id: self.call_id.clone(),
            role: self.role,
            status,
            reason,
            duration_secs,
            error,
        };
        tracing::info!(
            call_id = %self.call_id,
            status = %summary.status,
            duration_secs = summary.duration_secs,
            "Call finished"
        );
        self.emit(CallEvent::Ended(summary.clone()));
        self.summary.send_replace(Some(summary));
    }
}

async fn pump(inner: Arc<CallInner>, mut snapshots: mpsc::UnboundedReceiver<CallSession>) {
    let stop = inner.stop.clone();
    loop {
        tokio::select! {
            biased;
            _ = stop.stopped() => break,
            snapshot = snapshots.recv() => match snapshot {
                Some(session) => inner.on_snapshot(session).await,
                None => break,
            },
        }
    }
}

async fn watchdog(inner: Arc<CallInner>) {
    let reason = inner.stop.stopped().await;
    tracing::debug!(call_id = %inner.call_id, ?reason, "Stop signal raised");
    let coordinator = inner.coordinator.lock().take();
    if let Some(handle) = coordinator {
        if let Err(e) = handle.await {
            tracing::warn!(call_id = %inner.call_id, error = %e, "Coordinator task aborted");
        }
    }
    inner.finish(reason).await;
}

/// Lifecycle of one call for the local participant
///
/// Dropping the manager counts as navigating away: the call stops without a status
/// write and its resources are released in the background.
pub struct CallLifecycleManager {
    inner: Arc<CallInner>,
    events: Mutex<Option<mpsc::UnboundedReceiver<CallEvent>>>,
    summary: watch::Receiver<Option<CallSummary>>,
}

impl CallLifecycleManager {
    /// Create the call session, or join it if another participant created it first.
    ///
    /// The creator becomes the caller and starts negotiating at once. A participant that
    /// loses the creation race joins as callee and accepts implicitly.
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be created or read, or has already ended
    #[tracing::instrument(skip(channel, adapter, caller, callee, options), fields(call_id = %call_id))]
    pub async fn dial(
        channel: Arc<dyn SignalingChannel>,
        adapter: Arc<dyn PeerConnectionAdapter>,
        call_id: CallId,
        caller: Participant,
        callee: Option<Participant>,
        options: CallOptions,
    ) -> Result<Self, CallError> {
        let opened = open_session(channel.as_ref(), &call_id, &caller, callee.as_ref()).await;
        let (role, current) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                release_unused(adapter.as_ref()).await;
                return Err(e);
            }
        };

        tracing::info!(%role, "Dialing");
        let manager = Self::start(channel, adapter, caller, role, current, options).await?;
        manager.inner.start_negotiation();
        Ok(manager)
    }

    /// Join an existing call as callee.
    ///
    /// The call rings once the caller's offer is visible; see [`accept`](Self::accept).
    ///
    /// # Errors
    ///
    /// Returns error if the session does not exist or has already ended
    #[tracing::instrument(skip(channel, adapter, me, options), fields(call_id = %call_id))]
    pub async fn join(
        channel: Arc<dyn SignalingChannel>,
        adapter: Arc<dyn PeerConnectionAdapter>,
        call_id: CallId,
        me: Participant,
        options: CallOptions,
    ) -> Result<Self, CallError> {
        let current = match read_live(channel.as_ref(), &call_id).await {
            Ok(current) => current,
            Err(e) => {
                release_unused(adapter.as_ref()).await;
                return Err(e);
            }
        };
        tracing::info!("Joining call");
        Self::start(channel, adapter, me, CallRole::Callee, current, options).await
    }

    async fn start(
        channel: Arc<dyn SignalingChannel>,
        adapter: Arc<dyn PeerConnectionAdapter>,
        me: Participant,
        role: CallRole,
        current: CallSession,
        options: CallOptions,
    ) -> Result<Self, CallError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (summary_tx, summary_rx) = watch::channel(None);
        let (phase, _) = watch::channel(NegotiationPhase::Idle);
        let facing = options.constraints.facing;

        let inner = Arc::new(CallInner {
            call_id: current.id.clone(),
            me,
            role,
            options,
            channel,
            adapter,
            stop: StopSignal::new(),
            phase: Arc::new(phase),
            latest: Mutex::new(current),
            forward: Mutex::new(None),
            coordinator: Mutex::new(None),
            events: events_tx,
            rang: AtomicBool::new(false),
            negotiating: AtomicBool::new(false),
            facing: Mutex::new(facing),
            teardown: Teardown::default(),
            summary: summary_tx,
        });

        tokio::spawn(watchdog(inner.clone()));

        let (pump_tx, pump_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(inner.clone(), pump_rx));

        let stop = inner.stop.clone();
        let on_change: SnapshotCallback = Arc::new(move |session: CallSession| {
            if session.status.is_terminal() {
                stop.raise(StopReason::RemoteStatus(session.status));
            }
            let _ = pump_tx.send(session);
        });

        let manager = Self {
            inner,
            events: Mutex::new(Some(events_rx)),
            summary: summary_rx,
        };
        match manager.inner.channel.subscribe(&manager.inner.call_id, on_change).await {
            Ok(subscription) => manager.inner.teardown.attach(subscription),
            Err(e) => {
                manager
                    .inner
                    .stop
                    .raise(StopReason::Failed(CallError::Signaling(e.clone())));
                return Err(e.into());
            }
        }
        Ok(manager)
    }

    /// Accept a ringing call and start negotiating
    ///
    /// # Errors
    ///
    /// Returns error if this side is not the callee, the call is not ringing, or the
    /// accepted status cannot be written
    #[tracing::instrument(skip(self), fields(call_id = %self.inner.call_id))]
    pub async fn accept(&self) -> Result<(), CallError> {
        self.inner.accept().await
    }

    /// Reject an incoming call before it connects
    ///
    /// # Errors
    ///
    /// Returns error if this side is not the callee or the call is already connected
    #[tracing::instrument(skip(self), fields(call_id = %self.inner.call_id))]
    pub async fn reject(&self) -> Result<CallSummary, CallError> {
        if self.inner.role != CallRole::Callee {
            return Err(CallError::InvalidState("only the callee can reject".to_string()));
        }
        let status = self.status();
        if status.rank() >= CallStatus::Connected.rank() {
            return Err(CallError::InvalidState(format!("cannot reject a {status} call")));
        }
        self.inner.stop.raise(StopReason::LocalReject);
        Ok(self.wait_for_end().await)
    }

    /// End the call
    #[tracing::instrument(skip(self), fields(call_id = %self.inner.call_id))]
    pub async fn hang_up(&self) -> CallSummary {
        self.inner.stop.raise(StopReason::LocalHangup);
        self.wait_for_end().await
    }

    /// Stop participating without writing a status
    pub async fn leave(&self) -> CallSummary {
        self.inner.stop.raise(StopReason::Left);
        self.wait_for_end().await
    }

    /// Switch between front and rear camera
    ///
    /// # Errors
    ///
    /// Returns error if there is no video sender or the camera cannot be opened
    pub async fn switch_camera(&self) -> Result<CameraFacing, CallError> {
        let next = self.inner.facing.lock().toggled();
        self.inner
            .adapter
            .replace_video_track(next)
            .await
            .map_err(media_control_error)?;
        *self.inner.facing.lock() = next;
        tracing::debug!(call_id = %self.inner.call_id, facing = ?next, "Camera switched");
        Ok(next)
    }

    /// Mute or unmute the microphone
    ///
    /// # Errors
    ///
    /// Returns error if the adapter is closed
    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.inner
            .adapter
            .set_track_enabled(MediaKind::Audio, enabled)
            .await
            .map_err(media_control_error)
    }

    /// Turn the camera on or off
    ///
    /// # Errors
    ///
    /// Returns error if the adapter is closed
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.inner
            .adapter
            .set_track_enabled(MediaKind::Video, enabled)
            .await
            .map_err(media_control_error)
    }

    /// Take the event stream; only the first call returns it
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<CallEvent>> {
        self.events.lock().take()
    }

    /// Call identifier
    #[must_use]
    pub fn call_id(&self) -> &CallId {
        &self.inner.call_id
    }

    /// Local role
    #[must_use]
    pub fn role(&self) -> CallRole {
        self.inner.role
    }

    /// Latest known shared status
    #[must_use]
    pub fn status(&self) -> CallStatus {
        self.inner.latest.lock().status
    }

    /// Latest known session snapshot
    #[must_use]
    pub fn session(&self) -> CallSession {
        self.inner.latest.lock().clone()
    }

    /// Current negotiation phase
    #[must_use]
    pub fn phase(&self) -> NegotiationPhase {
        *self.inner.phase.borrow()
    }

    /// Connected time so far, or the final duration once ended
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.inner.latest.lock().call_duration()
    }

    /// Summary, once the call has finished
    #[must_use]
    pub fn summary(&self) -> Option<CallSummary> {
        self.summary.borrow().clone()
    }

    /// Wait until the call has finished and its resources are released
    pub async fn wait_for_end(&self) -> CallSummary {
        let mut rx = self.summary.clone();
        let summary = match rx.wait_for(Option::is_some).await {
            Ok(summary) => summary.clone(),
            Err(_) => None,
        };
        summary.unwrap_or_else(|| CallSummary {
            call_id: self.inner.call_id.clone(),
            role: self.inner.role,
            status: self.status(),
            reason: self.inner.stop.reason().unwrap_or(StopReason::Left),
            duration_secs: 0,
            error: None,
        })
    }
}

impl Drop for CallLifecycleManager {
    fn drop(&mut self) {
        if self.inner.stop.raise(StopReason::Left) {
            tracing::debug!(call_id = %self.inner.call_id, "Call manager dropped, leaving call");
        }
    }
}

/// Create or join the session for `dial`; the creation loser registers as callee
async fn open_session(
    channel: &dyn SignalingChannel,
    call_id: &CallId,
    caller: &Participant,
    callee: Option<&Participant>,
) -> Result<(CallRole, CallSession), CallError> {
    let session = CallSession::new(call_id.clone(), caller, callee, Utc::now());
    let (role, current) = create_or_join(channel, session).await?;
    ensure_live(&current)?;
    if role == CallRole::Callee {
        channel
            .update(call_id, SessionUpdate::new().callee(caller))
            .await?;
    }
    Ok((role, current))
}

async fn read_live(channel: &dyn SignalingChannel, call_id: &CallId) -> Result<CallSession, CallError> {
    let current = channel.read(call_id).await?;
    ensure_live(&current)?;
    Ok(current)
}

fn ensure_live(session: &CallSession) -> Result<(), CallError> {
    if session.status.is_terminal() {
        return Err(CallError::InvalidState(format!("call already {}", session.status)));
    }
    Ok(())
}

/// Close an adapter whose call never started
async fn release_unused(adapter: &dyn PeerConnectionAdapter) {
    if let Err(e) = adapter.close().await {
        let err = CallError::Cleanup(e.to_string());
        tracing::warn!(error = %err, "Adapter close failed");
    }
}

fn media_control_error(err: AdapterError) -> CallError {
    match err {
        AdapterError::NoActiveSender | AdapterError::Closed => CallError::InvalidState(err.to_string()),
        other => CallError::MediaAcquisition(other.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::InMemorySignalingChannel;
    use crate::testing::{AdapterCall, RecordingAdapter};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::timeout;

    fn alice() -> Participant {
        Participant::new("uid-alice").with_email("alice@example.com")
    }

    fn bob() -> Participant {
        Participant::new("uid-bob").with_email("bob@example.com")
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<CallEvent>, pred: impl Fn(&CallEvent) -> bool) -> CallEvent {
        timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    async fn dial_alice(
        channel: &InMemorySignalingChannel,
        adapter: Arc<RecordingAdapter>,
    ) -> CallLifecycleManager {
        CallLifecycleManager::dial(
            Arc::new(channel.clone()),
            adapter,
            CallId::new("call-1"),
            alice(),
            Some(bob()),
            CallOptions::default(),
        )
        .await
        .unwrap()
    }

    async fn wait_status(channel: &InMemorySignalingChannel, status: CallStatus) {
        timeout(Duration::from_secs(2), async {
            while channel.snapshot(&CallId::new("call-1")).map(|s| s.status) != Some(status) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_error_classification() {
        assert!(CallError::MediaAcquisition("x".into()).is_fatal());
        assert!(CallError::ConnectionLost(EngineConnectionState::Failed).is_fatal());
        assert!(!CallError::IceCandidate("x".into()).is_fatal());
        assert!(!CallError::Cleanup("x".into()).is_fatal());
        assert_eq!(
            CallError::Signaling(SignalingError::QuotaExceeded("q".into())).user_message(),
            "Too many requests. Try again later"
        );
    }

    #[tokio::test]
    async fn test_caller_waits_for_answer() {
        let channel = InMemorySignalingChannel::new();
        let adapter = Arc::new(RecordingAdapter::new());
        let call = dial_alice(&channel, adapter.clone()).await;
        assert_eq!(call.role(), CallRole::Caller);

        wait_status(&channel, CallStatus::Waiting).await;
        assert!(!adapter.calls().contains(&AdapterCall::CreateAnswer));

        let summary = call.hang_up().await;
        assert_eq!(summary.status, CallStatus::Ended);
        assert_eq!(summary.duration_secs, 0);
        assert_eq!(adapter.close_count(), 1);
        assert_eq!(channel.subscriber_count(&CallId::new("call-1")), 0);
        assert_eq!(call.phase(), NegotiationPhase::Ended);
    }

    #[tokio::test]
    async fn test_callee_rings_then_accepts() {
        let channel = InMemorySignalingChannel::new();
        let caller_adapter = Arc::new(RecordingAdapter::new());
        let caller = dial_alice(&channel, caller_adapter).await;
        wait_status(&channel, CallStatus::Waiting).await;

        let callee_adapter = Arc::new(RecordingAdapter::new());
        let callee = CallLifecycleManager::join(
            Arc::new(channel.clone()),
            callee_adapter.clone(),
            CallId::new("call-1"),
            bob(),
            CallOptions::default(),
        )
        .await
        .unwrap();
        let mut events = callee.take_events().unwrap();
        assert!(callee.take_events().is_none());

        let ringing = next_event(&mut events, |e| matches!(e, CallEvent::Ringing { .. })).await;
        assert_eq!(
            ringing,
            CallEvent::Ringing {
                call_id: CallId::new("call-1"),
                caller: ParticipantId::new("uid-alice"),
                caller_email: Some("alice@example.com".to_string()),
            }
        );
        assert!(!callee_adapter.calls().contains(&AdapterCall::AcquireLocalMedia));

        callee.accept().await.unwrap();
        wait_status(&channel, CallStatus::Connected).await;

        let session = channel.snapshot(&CallId::new("call-1")).unwrap();
        assert_eq!(session.callee_id, Some(ParticipantId::new("uid-bob")));
        assert!(session.answer().is_some());

        let summary = callee.hang_up().await;
        assert_eq!(summary.status, CallStatus::Ended);
        let caller_summary = caller.wait_for_end().await;
        assert_eq!(caller_summary.reason, StopReason::RemoteStatus(CallStatus::Ended));
        assert_eq!(callee_adapter.close_count(), 1);
    }

    #[tokio::test]
    async fn test_accept_before_ringing_is_invalid() {
        let channel = InMemorySignalingChannel::new();
        channel
            .create(CallSession::new(CallId::new("call-1"), &alice(), None, Utc::now()))
            .await
            .unwrap();
        let callee = CallLifecycleManager::join(
            Arc::new(channel.clone()),
            Arc::new(RecordingAdapter::new()),
            CallId::new("call-1"),
            bob(),
            CallOptions::default(),
        )
        .await
        .unwrap();

        assert!(matches!(callee.accept().await, Err(CallError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_reject_during_initiating_closes_once() {
        let channel = InMemorySignalingChannel::new();
        let adapter = Arc::new(RecordingAdapter::new().gate_create_offer());
        let caller = dial_alice(&channel, adapter.clone()).await;

        timeout(Duration::from_secs(2), async {
            while !adapter.calls().contains(&AdapterCall::CreateOffer) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        channel
            .update(&CallId::new("call-1"), SessionUpdate::new().status(CallStatus::Rejected))
            .await
            .unwrap();
        adapter.release_create_offer();

        let summary = caller.wait_for_end().await;
        assert_eq!(summary.status, CallStatus::Rejected);
        assert_eq!(adapter.close_count(), 1);
        assert!(channel.snapshot(&CallId::new("call-1")).unwrap().offer.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_triggers_clean_up_once() {
        let channel = InMemorySignalingChannel::new();
        let adapter = Arc::new(RecordingAdapter::new());
        let call = dial_alice(&channel, adapter.clone()).await;
        wait_status(&channel, CallStatus::Waiting).await;

        let remote = channel.clone();
        let id = CallId::new("call-1");
        let (a, b, _) = tokio::join!(
            call.hang_up(),
            call.leave(),
            remote.update(&id, SessionUpdate::new().status(CallStatus::Failed)),
        );
        assert_eq!(a, b);
        assert_eq!(adapter.close_count(), 1);
        assert_eq!(channel.subscriber_count(&CallId::new("call-1")), 0);
    }

    #[tokio::test]
    async fn test_callee_reject_writes_status() {
        let channel = InMemorySignalingChannel::new();
        let caller = dial_alice(&channel, Arc::new(RecordingAdapter::new())).await;
        wait_status(&channel, CallStatus::Waiting).await;

        let callee_adapter = Arc::new(RecordingAdapter::new());
        let callee = CallLifecycleManager::join(
            Arc::new(channel.clone()),
            callee_adapter.clone(),
            CallId::new("call-1"),
            bob(),
            CallOptions::default(),
        )
        .await
        .unwrap();
        wait_status(&channel, CallStatus::Ringing).await;

        let summary = callee.reject().await.unwrap();
        assert_eq!(summary.status, CallStatus::Rejected);
        assert_eq!(callee_adapter.close_count(), 1);

        let session = channel.snapshot(&CallId::new("call-1")).unwrap();
        assert_eq!(session.status, CallStatus::Rejected);
        assert!(session.ended_at.is_some());
        assert_eq!(caller.wait_for_end().await.status, CallStatus::Rejected);
    }

    #[tokio::test]
    async fn test_media_failure_writes_failed() {
        let channel = InMemorySignalingChannel::new();
        let adapter = Arc::new(RecordingAdapter::new().fail_media());
        let call = dial_alice(&channel, adapter.clone()).await;

        let summary = call.wait_for_end().await;
        assert_eq!(summary.status, CallStatus::Failed);
        assert!(matches!(
            summary.reason,
            StopReason::Failed(CallError::MediaAcquisition(_))
        ));

        let session = channel.snapshot(&CallId::new("call-1")).unwrap();
        assert_eq!(session.status, CallStatus::Failed);
        assert!(session.error.unwrap().contains("camera busy"));
        assert_eq!(adapter.close_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_not_written_when_unreachable() {
        let channel = InMemorySignalingChannel::new();
        let adapter = Arc::new(RecordingAdapter::new());
        let call = dial_alice(&channel, adapter.clone()).await;
        wait_status(&channel, CallStatus::Waiting).await;

        channel.set_reachable(false);
        adapter.emit(crate::adapter::AdapterEvent::LocalIceCandidate(
            crate::types::IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host", Some("0".into()), Some(0)),
        ));

        let summary = call.wait_for_end().await;
        assert_eq!(summary.status, CallStatus::Failed);
        assert_eq!(adapter.close_count(), 1);
        assert_eq!(
            channel.snapshot(&CallId::new("call-1")).unwrap().status,
            CallStatus::Waiting
        );
    }

    #[tokio::test]
    async fn test_losing_create_race_joins_as_callee() {
        let channel = InMemorySignalingChannel::new();
        let _caller = dial_alice(&channel, Arc::new(RecordingAdapter::new())).await;

        let adapter = Arc::new(RecordingAdapter::new());
        let second = CallLifecycleManager::dial(
            Arc::new(channel.clone()),
            adapter.clone(),
            CallId::new("call-1"),
            bob(),
            None,
            CallOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(second.role(), CallRole::Callee);

        wait_status(&channel, CallStatus::Connected).await;
        assert!(adapter.calls().contains(&AdapterCall::CreateAnswer));
    }

    #[tokio::test]
    async fn test_newer_attempt_ends_local_call() {
        let channel = InMemorySignalingChannel::new();
        let adapter = Arc::new(RecordingAdapter::new());
        let call = dial_alice(&channel, adapter.clone()).await;
        wait_status(&channel, CallStatus::Waiting).await;

        channel
            .update(&CallId::new("call-1"), SessionUpdate::new().attempt(1))
            .await
            .unwrap();
        let summary = timeout(Duration::from_secs(2), call.wait_for_end())
            .await
            .unwrap();

        assert_eq!(summary.reason, StopReason::Superseded);
        assert_eq!(summary.status, CallStatus::Waiting);
        assert_eq!(adapter.close_count(), 1);
        let stored = channel.snapshot(&CallId::new("call-1")).unwrap();
        assert_eq!(stored.attempt, 1);
        assert_eq!(stored.status, CallStatus::Waiting);
        assert!(stored.ended_at.is_none());
    }

    #[tokio::test]
    async fn test_join_missing_call_closes_adapter() {
        let channel = InMemorySignalingChannel::new();
        let adapter = Arc::new(RecordingAdapter::new());
        let result = CallLifecycleManager::join(
            Arc::new(channel.clone()),
            adapter.clone(),
            CallId::new("missing"),
            bob(),
            CallOptions::default(),
        )
        .await;

        assert!(matches!(
            result,
            Err(CallError::Signaling(SignalingError::NotFound(_)))
        ));
        assert_eq!(adapter.close_count(), 1);
    }

    #[tokio::test]
    async fn test_dial_ended_call_closes_adapter() {
        let channel = InMemorySignalingChannel::new();
        let session = CallSession::new(CallId::new("call-1"), &alice(), Some(&bob()), Utc::now());
        channel.create(session).await.unwrap();
        channel
            .update(&CallId::new("call-1"), SessionUpdate::new().status(CallStatus::Ended))
            .await
            .unwrap();

        let adapter = Arc::new(RecordingAdapter::new());
        let result = CallLifecycleManager::dial(
            Arc::new(channel.clone()),
            adapter.clone(),
            CallId::new("call-1"),
            bob(),
            None,
            CallOptions::default(),
        )
        .await;

        assert!(matches!(result, Err(CallError::InvalidState(_))));
        assert_eq!(adapter.close_count(), 1);
        assert_eq!(channel.subscriber_count(&CallId::new("call-1")), 0);
    }

    #[tokio::test]
    async fn test_dial_unreachable_channel_closes_adapter() {
        let channel = InMemorySignalingChannel::new();
        channel.set_reachable(false);
        let adapter = Arc::new(RecordingAdapter::new());
        let result = CallLifecycleManager::dial(
            Arc::new(channel.clone()),
            adapter.clone(),
            CallId::new("call-1"),
            alice(),
            Some(bob()),
            CallOptions::default(),
        )
        .await;

        assert!(matches!(result, Err(CallError::Signaling(_))));
        assert_eq!(adapter.close_count(), 1);
    }

    #[tokio::test]
    async fn test_drop_counts_as_leave() {
        let channel = InMemorySignalingChannel::new();
        let adapter = Arc::new(RecordingAdapter::new());
        let call = dial_alice(&channel, adapter.clone()).await;
        wait_status(&channel, CallStatus::Waiting).await;
        drop(call);

        timeout(Duration::from_secs(2), async {
            while adapter.close_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            channel.snapshot(&CallId::new("call-1")).unwrap().status,
            CallStatus::Waiting
        );
    }

    #[tokio::test]
    async fn test_media_controls() {
        let channel = InMemorySignalingChannel::new();
        let adapter = Arc::new(RecordingAdapter::new());
        let call = dial_alice(&channel, adapter.clone()).await;
        wait_status(&channel, CallStatus::Waiting).await;

        assert_eq!(call.switch_camera().await.unwrap(), CameraFacing::Environment);
        call.set_audio_enabled(false).await.unwrap();
        call.set_video_enabled(false).await.unwrap();

        let calls = adapter.calls();
        assert!(calls.contains(&AdapterCall::ReplaceVideoTrack(CameraFacing::Environment)));
        assert!(calls.contains(&AdapterCall::SetTrackEnabled(MediaKind::Audio, false)));
        assert!(calls.contains(&AdapterCall::SetTrackEnabled(MediaKind::Video, false)));

        call.hang_up().await;
        assert!(matches!(call.set_audio_enabled(true).await, Err(CallError::InvalidState(_))));
    }
}
