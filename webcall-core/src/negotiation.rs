//! Offer/answer/ICE negotiation
//!
//! One [`NegotiationCoordinator`] drives one negotiation attempt. It runs as a single
//! task that consumes session snapshots and adapter events in order, so two snapshot
//! diffs never interleave. Every engine or channel step races the shared
//! [`StopSignal`]; once the signal is raised nothing further is published.
//!
//! ```text
//!        Idle
//!     ┌───┴──────────┐
//!     ▼              ▼
//! Initiating    AwaitingOffer
//!  (caller)       (callee)
//!     └───┬──────────┘
//!         ▼
//!   OfferExchanged
//!         ▼
//!   AnswerExchanged
//!         ▼
//!    Negotiating
//!         ▼
//!     Connected ───► Ended | Rejected | Failed
//! ```

use crate::adapter::{
    AdapterError, AdapterEvent, AdapterEvents, EngineConnectionState, PeerConnectionAdapter,
};
use crate::call::{CallError, CallEvent};
use crate::ice_queue::IceCandidateQueue;
use crate::session::{CallSession, SessionUpdate};
use crate::signaling::SignalingChannel;
use crate::types::{
    CallId, CallRole, CallStatus, IceCandidate, MediaConstraints, SdpType, SessionDescription,
};
use chrono::Utc;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Coordinator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationPhase {
    /// Not started
    Idle,
    /// Caller producing its offer
    Initiating,
    /// Callee waiting for an offer
    AwaitingOffer,
    /// Offer applied on both ends of the exchange that concern us
    OfferExchanged,
    /// Answer applied
    AnswerExchanged,
    /// Candidates flowing
    Negotiating,
    /// Media path established
    Connected,
    /// Hung up, left or superseded
    Ended,
    /// Rejected by the callee
    Rejected,
    /// Failed
    Failed,
}

impl NegotiationPhase {
    /// Whether the phase is final
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Rejected | Self::Failed)
    }

    /// Validate a phase transition
    ///
    /// Any non-terminal phase may end; nothing leaves a terminal phase.
    #[must_use]
    pub fn is_valid_transition(from: NegotiationPhase, to: NegotiationPhase) -> bool {
        use NegotiationPhase::{
            AnswerExchanged, AwaitingOffer, Connected, Idle, Initiating, Negotiating,
            OfferExchanged,
        };
        if from.is_terminal() {
            return false;
        }
        if to.is_terminal() {
            return true;
        }
        matches!(
            (from, to),
            (Idle, Initiating)
                | (Idle, AwaitingOffer)
                | (Initiating, OfferExchanged)
                | (AwaitingOffer, OfferExchanged)
                | (OfferExchanged, AnswerExchanged)
                | (AnswerExchanged, Negotiating)
                | (AnswerExchanged, Connected)
                | (Negotiating, Connected)
        )
    }
}

impl std::fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Why a call attempt stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Local participant hung up
    LocalHangup,
    /// Local participant rejected the call
    LocalReject,
    /// Local participant navigated away
    Left,
    /// The session reached a terminal status written by someone else
    RemoteStatus(CallStatus),
    /// A newer attempt took over.
    ///
    /// Ends the local call: resources are released and nothing is written back, so
    /// whoever bumped the attempt keeps the session. Rejoining means a new
    /// [`CallLifecycleManager`](crate::call::CallLifecycleManager).
    Superseded,
    /// Fatal error
    Failed(CallError),
}

impl StopReason {
    /// Phase a coordinator ends in for this reason
    #[must_use]
    pub fn terminal_phase(&self) -> NegotiationPhase {
        match self {
            Self::LocalReject | Self::RemoteStatus(CallStatus::Rejected) => {
                NegotiationPhase::Rejected
            }
            Self::Failed(_) | Self::RemoteStatus(CallStatus::Failed) => NegotiationPhase::Failed,
            _ => NegotiationPhase::Ended,
        }
    }
}

/// First-reason-wins stop flag shared by the coordinator, the lifecycle manager and
/// the subscription callback
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<Option<StopReason>>>,
}

impl StopSignal {
    /// Create a lowered signal
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal; returns `false` if it was already raised
    pub fn raise(&self, reason: StopReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    /// Check if the signal is raised
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The winning reason, if raised
    #[must_use]
    pub fn reason(&self) -> Option<StopReason> {
        self.tx.borrow().clone()
    }

    /// Wait until the signal is raised
    pub async fn stopped(&self) -> StopReason {
        let mut rx = self.tx.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(current) => current.clone(),
            Err(_) => None,
        };
        reason.unwrap_or(StopReason::Left)
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a step did not complete
#[derive(Debug)]
enum Interrupt {
    Stopped,
    Failed(CallError),
}

impl From<CallError> for Interrupt {
    fn from(err: CallError) -> Self {
        Interrupt::Failed(err)
    }
}

type Step<T> = Result<T, Interrupt>;

/// Per-attempt negotiation state machine
pub struct NegotiationCoordinator {
    call_id: CallId,
    role: CallRole,
    attempt: u32,
    constraints: MediaConstraints,
    adapter: Arc<dyn PeerConnectionAdapter>,
    channel: Arc<dyn SignalingChannel>,
    stop: StopSignal,
    phase: Arc<watch::Sender<NegotiationPhase>>,
    events: Option<mpsc::UnboundedSender<CallEvent>>,
    queue: IceCandidateQueue,
    seen_candidates: HashSet<String>,
    local_candidates: HashSet<String>,
    offer_published: bool,
    remote_applied: bool,
}

impl NegotiationCoordinator {
    /// Create a coordinator for one side of a call
    pub fn new(
        call_id: CallId,
        role: CallRole,
        adapter: Arc<dyn PeerConnectionAdapter>,
        channel: Arc<dyn SignalingChannel>,
        stop: StopSignal,
    ) -> Self {
        let (phase, _) = watch::channel(NegotiationPhase::Idle);
        Self {
            call_id,
            role,
            attempt: 0,
            constraints: MediaConstraints::default(),
            adapter,
            channel,
            stop,
            phase: Arc::new(phase),
            events: None,
            queue: IceCandidateQueue::new(),
            seen_candidates: HashSet::new(),
            local_candidates: HashSet::new(),
            offer_published: false,
            remote_applied: false,
        }
    }

    /// Negotiate within the given attempt
    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Set local media constraints
    #[must_use]
    pub fn with_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Publish phases into a shared watch
    #[must_use]
    pub fn with_phase(mut self, phase: Arc<watch::Sender<NegotiationPhase>>) -> Self {
        self.phase = phase;
        self
    }

    /// Forward media and connection events
    #[must_use]
    pub fn with_events(mut self, events: mpsc::UnboundedSender<CallEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> NegotiationPhase {
        *self.phase.borrow()
    }

    /// Run until the stop signal is raised or a fatal error occurs.
    ///
    /// A fatal error raises the stop signal with [`StopReason::Failed`]. Returns the
    /// terminal phase.
    #[tracing::instrument(skip_all, fields(call_id = %self.call_id, role = %self.role, attempt = self.attempt))]
    pub async fn run(mut self, mut snapshots: mpsc::UnboundedReceiver<CallSession>) -> NegotiationPhase {
        match self.drive(&mut snapshots).await {
            Ok(()) | Err(Interrupt::Stopped) => {}
            Err(Interrupt::Failed(err)) => {
                tracing::error!(error = %err, phase = %self.phase(), "Negotiation failed");
                self.stop.raise(StopReason::Failed(err));
            }
        }
        self.queue.discard();

        let terminal = self
            .stop
            .reason()
            .map_or(NegotiationPhase::Ended, |r| r.terminal_phase());
        self.set_phase(terminal);
        tracing::debug!(phase = %terminal, "Coordinator stopped");
        terminal
    }

    async fn drive(&mut self, snapshots: &mut mpsc::UnboundedReceiver<CallSession>) -> Step<()> {
        let constraints = self.constraints.clone();
        let local = self
            .step(self.adapter.acquire_local_media(&constraints))
            .await?
            .map_err(|e| CallError::MediaAcquisition(e.to_string()))?;
        tracing::debug!(stream = %local.id, kinds = ?local.kinds, "Local media acquired");
        self.emit(CallEvent::LocalStream(local));

        let mut adapter_events = self.adapter.take_events();

        match self.role {
            CallRole::Caller => {
                self.set_phase(NegotiationPhase::Initiating);
                self.publish_offer().await?;
            }
            CallRole::Callee => {
                self.set_phase(NegotiationPhase::AwaitingOffer);
            }
        }

        let stop = self.stop.clone();
        loop {
            tokio::select! {
                biased;
                _ = stop.stopped() => return Err(Interrupt::Stopped),
                snapshot = snapshots.recv() => match snapshot {
                    Some(session) => self.on_snapshot(session).await?,
                    None => {
                        self.stop.raise(StopReason::Left);
                        return Ok(());
                    }
                },
                event = next_event(&mut adapter_events) => match event {
                    Some(event) => self.on_adapter_event(event).await?,
                    None => adapter_events = None,
                },
            }
        }
    }

    async fn publish_offer(&mut self) -> Step<()> {
        let offer = self
            .step(self.adapter.create_offer())
            .await?
            .map_err(|e| negotiation("create offer", &e))?;
        self.step(self.adapter.set_local_description(&offer))
            .await?
            .map_err(|e| negotiation("set local offer", &e))?;

        let current = self
            .step(self.channel.read(&self.call_id))
            .await?
            .map_err(CallError::from)?;
        self.check_epoch(&current)?;
        if !matches!(current.status, CallStatus::Calling | CallStatus::Waiting)
            || current.offer().is_some()
        {
            return Err(CallError::Negotiation(format!(
                "session no longer accepts an offer (status {})",
                current.status
            ))
            .into());
        }

        let wire = offer
            .to_wire()
            .map_err(|e| CallError::Negotiation(e.to_string()))?;
        self.checkpoint()?;
        self.step(self.channel.update(
            &self.call_id,
            SessionUpdate::new()
                .attempt(self.attempt)
                .offer(wire.clone())
                .status(CallStatus::Waiting),
        ))
        .await?
        .map_err(CallError::from)?;

        // The merge drops an offer that lost to a concurrent writer
        let stored = self
            .step(self.channel.read(&self.call_id))
            .await?
            .map_err(CallError::from)?;
        self.check_epoch(&stored)?;
        if stored.offer() != Some(wire.as_str()) {
            return Err(CallError::Negotiation(format!(
                "offer not accepted by session (status {})",
                stored.status
            ))
            .into());
        }

        self.offer_published = true;
        self.set_phase(NegotiationPhase::OfferExchanged);
        tracing::info!("Offer published, waiting for answer");
        Ok(())
    }

    async fn on_snapshot(&mut self, session: CallSession) -> Step<()> {
        if session.attempt < self.attempt {
            tracing::debug!(seen = session.attempt, "Ignoring snapshot from an older attempt");
            return Ok(());
        }
        self.check_epoch(&session)?;

        match self.role {
            CallRole::Callee if !self.remote_applied => {
                if let Some(offer) = session.offer() {
                    self.answer_offer(offer).await?;
                }
            }
            CallRole::Caller if self.offer_published && !self.remote_applied => {
                if let Some(answer) = session.answer() {
                    self.apply_answer(answer).await?;
                }
            }
            _ => {}
        }

        self.absorb_candidates(&session.ice_candidates).await
    }

    /// Stop on terminal status or on a newer attempt
    fn check_epoch(&self, session: &CallSession) -> Step<()> {
        if session.status.is_terminal() {
            self.stop.raise(StopReason::RemoteStatus(session.status));
            return Err(Interrupt::Stopped);
        }
        if session.attempt > self.attempt {
            tracing::info!(newer = session.attempt, "Attempt superseded");
            self.stop.raise(StopReason::Superseded);
            return Err(Interrupt::Stopped);
        }
        Ok(())
    }

    async fn answer_offer(&mut self, raw: &str) -> Step<()> {
        let offer = parse_description(raw, SdpType::Offer)?;
        self.step(self.adapter.set_remote_description(&offer))
            .await?
            .map_err(|e| negotiation("set remote offer", &e))?;
        self.remote_applied = true;
        self.set_phase(NegotiationPhase::OfferExchanged);
        self.flush_queue().await?;

        let answer = self
            .step(self.adapter.create_answer())
            .await?
            .map_err(|e| negotiation("create answer", &e))?;
        self.step(self.adapter.set_local_description(&answer))
            .await?
            .map_err(|e| negotiation("set local answer", &e))?;

        let wire = answer
            .to_wire()
            .map_err(|e| CallError::Negotiation(e.to_string()))?;
        self.checkpoint()?;
        self.step(self.channel.update(
            &self.call_id,
            SessionUpdate::new()
                .attempt(self.attempt)
                .answer(wire)
                .status(CallStatus::Connected)
                .connected_at(Utc::now()),
        ))
        .await?
        .map_err(CallError::from)?;

        self.set_phase(NegotiationPhase::AnswerExchanged);
        self.set_phase(NegotiationPhase::Negotiating);
        tracing::info!("Answer published");
        Ok(())
    }

    async fn apply_answer(&mut self, raw: &str) -> Step<()> {
        let answer = parse_description(raw, SdpType::Answer)?;
        self.step(self.adapter.set_remote_description(&answer))
            .await?
            .map_err(|e| negotiation("set remote answer", &e))?;
        self.remote_applied = true;
        self.set_phase(NegotiationPhase::AnswerExchanged);
        self.flush_queue().await?;
        self.set_phase(NegotiationPhase::Negotiating);
        tracing::info!("Answer applied");
        Ok(())
    }

    async fn absorb_candidates(&mut self, candidates: &[String]) -> Step<()> {
        for raw in candidates {
            if self.local_candidates.contains(raw) || !self.seen_candidates.insert(raw.clone()) {
                continue;
            }
            let candidate = match IceCandidate::from_wire(raw) {
                Ok(c) => c,
                Err(reason) => {
                    tracing::warn!(%reason, "Skipping malformed ICE candidate");
                    continue;
                }
            };
            if let Some(ready) = self.queue.enqueue(candidate) {
                self.apply_candidate(ready).await?;
            } else {
                tracing::trace!(queued = self.queue.len(), "Queued ICE candidate");
            }
        }
        Ok(())
    }

    async fn flush_queue(&mut self) -> Step<()> {
        let pending = self.queue.drain();
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "Applying queued ICE candidates");
        }
        for candidate in pending {
            self.apply_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn apply_candidate(&self, candidate: IceCandidate) -> Step<()> {
        if let Err(e) = self.step(self.adapter.add_ice_candidate(&candidate)).await? {
            let err = CallError::IceCandidate(e.to_string());
            tracing::warn!(error = %err, candidate = %candidate.candidate, "Candidate not applied");
        }
        Ok(())
    }

    async fn on_adapter_event(&mut self, event: AdapterEvent) -> Step<()> {
        match event {
            AdapterEvent::LocalIceCandidate(candidate) => {
                let wire = candidate
                    .to_wire()
                    .map_err(|e| CallError::IceCandidate(e.to_string()));
                let wire = match wire {
                    Ok(w) => w,
                    Err(err) => {
                        tracing::warn!(error = %err, "Dropping local candidate");
                        return Ok(());
                    }
                };
                self.local_candidates.insert(wire.clone());
                self.checkpoint()?;
                self.step(self.channel.update(
                    &self.call_id,
                    SessionUpdate::new()
                        .attempt(self.attempt)
                        .append_candidate(wire),
                ))
                .await?
                .map_err(CallError::from)?;
                tracing::trace!("Local ICE candidate published");
            }
            AdapterEvent::RemoteTrackAdded(stream) => {
                tracing::debug!(stream = %stream.id, kind = ?stream.kind, "Remote track added");
                self.emit(CallEvent::RemoteStream(stream));
            }
            AdapterEvent::ConnectionStateChanged(state) => {
                tracing::debug!(%state, "Engine connection state changed");
                if state == EngineConnectionState::Connected {
                    if self.set_phase(NegotiationPhase::Connected) {
                        tracing::info!("Media connected");
                        self.emit(CallEvent::Connected);
                    }
                } else if state.is_lost() {
                    return Err(CallError::ConnectionLost(state).into());
                }
            }
        }
        Ok(())
    }

    async fn step<T>(&self, fut: impl Future<Output = T>) -> Step<T> {
        tokio::select! {
            biased;
            _ = self.stop.stopped() => Err(Interrupt::Stopped),
            out = fut => Ok(out),
        }
    }

    fn checkpoint(&self) -> Step<()> {
        if self.stop.is_raised() {
            Err(Interrupt::Stopped)
        } else {
            Ok(())
        }
    }

    fn set_phase(&self, to: NegotiationPhase) -> bool {
        let from = *self.phase.borrow();
        if from == to {
            return false;
        }
        if !NegotiationPhase::is_valid_transition(from, to) {
            tracing::warn!(%from, %to, "Ignoring invalid phase transition");
            return false;
        }
        self.phase.send_replace(to);
        tracing::debug!(%from, %to, "Phase changed");
        true
    }

    fn emit(&self, event: CallEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

async fn next_event(events: &mut Option<AdapterEvents>) -> Option<AdapterEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn parse_description(raw: &str, expected: SdpType) -> Result<SessionDescription, CallError> {
    let desc = SessionDescription::from_wire(raw)
        .map_err(|e| CallError::Negotiation(format!("malformed {expected:?}: {e}")))?;
    if desc.sdp_type != expected {
        return Err(CallError::Negotiation(format!(
            "expected {expected:?}, found {:?}",
            desc.sdp_type
        )));
    }
    Ok(desc)
}

fn negotiation(step: &str, err: &AdapterError) -> CallError {
    CallError::Negotiation(format!("{step}: {err}"))
}
