//! Signaling channel contract
//!
//! Both participants share one [`CallSession`] document per call. A channel exposes
//! read, subscribe, partial update and first-writer-wins create over that document.
//! [`SignalingHandler`] decorates any channel with tracing and bounded retries.

use crate::session::{CallSession, SessionUpdate};
use crate::types::{CallId, CallRole};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// No session under this id
    #[error("Session not found: {0}")]
    NotFound(CallId),

    /// A session already exists under this id
    #[error("Session already exists: {0}")]
    AlreadyExists(CallId),

    /// Caller is not signed in
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Caller lacks access to the session
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Store rate limit hit
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Store unreachable
    #[error("Signaling unavailable: {0}")]
    Unavailable(String),

    /// Document could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Update refused by the store
    #[error("Invalid update: {0}")]
    InvalidUpdate(String),
}

impl SignalingError {
    /// Short message fit for showing to a user
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::PermissionDenied(_) => "You don't have permission for this action",
            Self::Unauthenticated(_) => "Please sign in to continue",
            Self::QuotaExceeded(_) => "Too many requests. Try again later",
            Self::InvalidUpdate(_) => "Call already ended",
            Self::NotFound(_) => "Call session expired",
            Self::AlreadyExists(_) | Self::Unavailable(_) | Self::Serialization(_) => {
                "Operation failed. Please try again."
            }
        }
    }

    /// Whether retrying the same operation may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<serde_json::Error> for SignalingError {
    fn from(err: serde_json::Error) -> Self {
        SignalingError::Serialization(err.to_string())
    }
}

/// Callback receiving every materialized session state
pub type SnapshotCallback = Arc<dyn Fn(CallSession) + Send + Sync>;

/// Cancel token for a subscription
///
/// Cancelling twice is harmless; dropping the token cancels it.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Wrap an unsubscribe action
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Stop receiving snapshots
    pub fn cancel(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Shared-document signaling channel
///
/// Implement this for your realtime store (document database, key-value watch, etc.).
/// Every implementation applies updates with [`CallSession::merge`].
#[async_trait]
pub trait SignalingChannel: Send + Sync + 'static {
    /// Read the current session
    async fn read(&self, call_id: &CallId) -> Result<CallSession, SignalingError>;

    /// Subscribe to session changes.
    ///
    /// The state current at subscribe time is delivered first. Callbacks must not block.
    async fn subscribe(
        &self,
        call_id: &CallId,
        on_change: SnapshotCallback,
    ) -> Result<Subscription, SignalingError>;

    /// Merge a partial update into the session
    async fn update(&self, call_id: &CallId, update: SessionUpdate) -> Result<(), SignalingError>;

    /// Create a session; the first writer wins
    async fn create(&self, session: CallSession) -> Result<(), SignalingError>;
}

/// Create the session, or join it as callee when another participant created it first
///
/// # Errors
///
/// Returns error if neither creating nor reading the session succeeds
#[tracing::instrument(skip(channel, session), fields(call_id = %session.id))]
pub async fn create_or_join(
    channel: &dyn SignalingChannel,
    session: CallSession,
) -> Result<(CallRole, CallSession), SignalingError> {
    match channel.create(session.clone()).await {
        Ok(()) => {
            tracing::debug!("Session created");
            Ok((CallRole::Caller, session))
        }
        Err(SignalingError::AlreadyExists(_)) => {
            tracing::info!("Session already exists, joining as callee");
            let existing = channel.read(&session.id).await?;
            Ok((CallRole::Callee, existing))
        }
        Err(e) => Err(e),
    }
}

/// Retry policy for transient channel failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first try
    pub max_retries: u32,
    /// Backoff unit; the n-th retry waits `n * base_delay`
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// Signaling handler with tracing and retry
///
/// Retrying is safe because every write is idempotent under the merge rules.
pub struct SignalingHandler<C: SignalingChannel> {
    channel: Arc<C>,
    retry: RetryPolicy,
}

impl<C: SignalingChannel> SignalingHandler<C> {
    /// Create new signaling handler
    #[must_use]
    pub fn new(channel: Arc<C>) -> Self {
        Self {
            channel,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Get access to the underlying channel
    #[must_use]
    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }

    async fn with_retries<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T, SignalingError>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = Result<T, SignalingError>> + Send,
        T: Send,
    {
        let mut retries = 0u32;
        loop {
            match f().await {
                Err(e) if e.is_transient() && retries < self.retry.max_retries => {
                    retries += 1;
                    let backoff = self.retry.base_delay * retries.min(10);
                    tracing::warn!(
                        op,
                        error = %e,
                        retry = retries,
                        backoff_ms = backoff.as_millis(),
                        "Transient signaling failure, backing off"
                    );
                    sleep(backoff).await;
                }
                Err(e) => {
                    tracing::debug!(op, error = %e, "Signaling operation failed");
                    return Err(e);
                }
                Ok(value) => return Ok(value),
            }
        }
    }
}

#[async_trait]
impl<C: SignalingChannel> SignalingChannel for SignalingHandler<C> {
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    async fn read(&self, call_id: &CallId) -> Result<CallSession, SignalingError> {
        self.with_retries("read", || self.channel.read(call_id)).await
    }

    #[tracing::instrument(skip(self, on_change), fields(call_id = %call_id))]
    async fn subscribe(
        &self,
        call_id: &CallId,
        on_change: SnapshotCallback,
    ) -> Result<Subscription, SignalingError> {
        tracing::debug!("Subscribing to session");
        self.with_retries("subscribe", || self.channel.subscribe(call_id, on_change.clone()))
            .await
    }

    #[tracing::instrument(skip(self, update), fields(call_id = %call_id, status = ?update.status))]
    async fn update(&self, call_id: &CallId, update: SessionUpdate) -> Result<(), SignalingError> {
        tracing::trace!(
            offer = update.offer.is_some(),
            answer = update.answer.is_some(),
            candidates = update.append_ice_candidates.len(),
            "Publishing session update"
        );
        self.with_retries("update", || self.channel.update(call_id, update.clone()))
            .await
    }

    #[tracing::instrument(skip(self, session), fields(call_id = %session.id))]
    async fn create(&self, session: CallSession) -> Result<(), SignalingError> {
        self.with_retries("create", || self.channel.create(session.clone()))
            .await
    }
}
