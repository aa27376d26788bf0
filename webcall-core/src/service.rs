//! Call service orchestration
//!
//! [`CallService`] owns the configuration, wraps the signaling channel in a
//! [`SignalingHandler`], and builds a fresh peer connection adapter for every call.

use crate::adapter::{AdapterError, PeerConnectionAdapter};
use crate::call::{CallError, CallLifecycleManager, CallOptions};
use crate::identity::Participant;
use crate::signaling::{RetryPolicy, SignalingChannel, SignalingHandler};
use crate::types::{CallId, IceConfig, IceServer, MediaConstraints};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Peer connection could not be created
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Call error
    #[error("Call error: {0}")]
    Call(#[from] CallError),
}

/// Service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebCallConfig {
    /// STUN/TURN servers handed to every adapter
    pub ice_servers: Vec<IceServer>,
    /// Constraints used for new calls
    pub default_constraints: MediaConstraints,
    /// Accept incoming calls as soon as they ring
    pub auto_accept: bool,
    /// Retries for transient signaling failures
    pub signaling_retries: u32,
}

impl Default for WebCallConfig {
    fn default() -> Self {
        Self {
            ice_servers: IceConfig::default().ice_servers,
            default_constraints: MediaConstraints::video_call(),
            auto_accept: false,
            signaling_retries: 3,
        }
    }
}

impl WebCallConfig {
    /// Parse a JSON configuration; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed
    pub fn from_json(raw: &str) -> Result<Self, ServiceError> {
        serde_json::from_str(raw).map_err(|e| ServiceError::Config(e.to_string()))
    }

    /// Load a JSON configuration file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self, ServiceError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ServiceError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    /// ICE configuration for adapters
    #[must_use]
    pub fn ice_config(&self) -> IceConfig {
        IceConfig {
            ice_servers: self.ice_servers.clone(),
        }
    }

    /// Options for a new call
    #[must_use]
    pub fn call_options(&self) -> CallOptions {
        CallOptions {
            constraints: self.default_constraints.clone(),
            auto_accept: self.auto_accept,
        }
    }

    /// Retry policy for the signaling handler
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.signaling_retries,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// Builds one peer connection adapter per call
#[async_trait]
pub trait AdapterFactory: Send + Sync + 'static {
    /// Create a fresh adapter
    async fn create(&self, ice: &IceConfig) -> Result<Arc<dyn PeerConnectionAdapter>, AdapterError>;
}

/// Main call service
pub struct CallService<C: SignalingChannel, F: AdapterFactory> {
    signaling: Arc<SignalingHandler<C>>,
    factory: F,
    config: WebCallConfig,
}

impl<C: SignalingChannel, F: AdapterFactory> CallService<C, F> {
    /// Create new call service
    #[must_use]
    pub fn new(channel: Arc<C>, factory: F, config: WebCallConfig) -> Self {
        let signaling = SignalingHandler::new(channel).with_retry(config.retry_policy());
        Self {
            signaling: Arc::new(signaling),
            factory,
            config,
        }
    }

    /// Create a builder
    #[must_use]
    pub fn builder(channel: Arc<C>, factory: F) -> CallServiceBuilder<C, F> {
        CallServiceBuilder::new(channel, factory)
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &WebCallConfig {
        &self.config
    }

    /// Signaling handler shared by all calls
    #[must_use]
    pub fn signaling(&self) -> &Arc<SignalingHandler<C>> {
        &self.signaling
    }

    /// Start a call under a freshly generated id
    ///
    /// # Errors
    ///
    /// Returns error if the adapter cannot be built or the session cannot be created
    pub async fn start_call(
        &self,
        caller: Participant,
        callee: Option<Participant>,
    ) -> Result<CallLifecycleManager, ServiceError> {
        self.dial(CallId::generate(), caller, callee).await
    }

    /// Create or join the call under `call_id`
    ///
    /// # Errors
    ///
    /// Returns error if the adapter cannot be built or the session cannot be created
    #[tracing::instrument(skip(self, caller, callee), fields(call_id = %call_id, caller = %caller))]
    pub async fn dial(
        &self,
        call_id: CallId,
        caller: Participant,
        callee: Option<Participant>,
    ) -> Result<CallLifecycleManager, ServiceError> {
        let adapter = self.factory.create(&self.config.ice_config()).await?;
        let call = CallLifecycleManager::dial(
            self.channel(),
            adapter,
            call_id,
            caller,
            callee,
            self.config.call_options(),
        )
        .await?;
        tracing::info!(role = %call.role(), "Call started");
        Ok(call)
    }

    /// Join an existing call as callee
    ///
    /// # Errors
    ///
    /// Returns error if the adapter cannot be built or the session is missing or over
    #[tracing::instrument(skip(self, me), fields(call_id = %call_id, me = %me))]
    pub async fn join_call(
        &self,
        call_id: CallId,
        me: Participant,
    ) -> Result<CallLifecycleManager, ServiceError> {
        let adapter = self.factory.create(&self.config.ice_config()).await?;
        let call = CallLifecycleManager::join(
            self.channel(),
            adapter,
            call_id,
            me,
            self.config.call_options(),
        )
        .await?;
        tracing::info!("Joined call");
        Ok(call)
    }

    fn channel(&self) -> Arc<dyn SignalingChannel> {
        self.signaling.clone()
    }
}

/// Call service builder
pub struct CallServiceBuilder<C: SignalingChannel, F: AdapterFactory> {
    channel: Arc<C>,
    factory: F,
    config: WebCallConfig,
}

impl<C: SignalingChannel, F: AdapterFactory> CallServiceBuilder<C, F> {
    /// Create new builder
    #[must_use]
    pub fn new(channel: Arc<C>, factory: F) -> Self {
        Self {
            channel,
            factory,
            config: WebCallConfig::default(),
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: WebCallConfig) -> Self {
        self.config = config;
        self
    }

    /// Accept incoming calls automatically
    #[must_use]
    pub fn auto_accept(mut self, enabled: bool) -> Self {
        self.config.auto_accept = enabled;
        self
    }

    /// Build the service
    #[must_use]
    pub fn build(self) -> CallService<C, F> {
        CallService::new(self.channel, self.factory, self.config)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::call::CallEvent;
    use crate::memory::InMemorySignalingChannel;
    use crate::testing::RecordingAdapter;
    use crate::types::{CallRole, CallStatus};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{timeout, Duration as TokioDuration};

    #[derive(Default)]
    struct CountingFactory {
        built: AtomicUsize,
    }

    #[async_trait]
    impl AdapterFactory for CountingFactory {
        async fn create(
            &self,
            _ice: &IceConfig,
        ) -> Result<Arc<dyn PeerConnectionAdapter>, AdapterError> {
            self.built.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(RecordingAdapter::new()))
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = WebCallConfig::from_json("{}").unwrap();
        assert_eq!(config, WebCallConfig::default());
        assert_eq!(
            config.ice_servers[0].urls,
            vec!["stun:stun.l.google.com:19302".to_string()]
        );
        assert_eq!(config.signaling_retries, 3);
        assert!(!config.auto_accept);
    }

    #[test]
    fn test_config_from_json() {
        let raw = r#"{
            "iceServers": [
                {"urls": "stun:stun.example.org:3478"},
                {"urls": ["turn:turn.example.org"], "username": "u", "credential": "p"}
            ],
            "defaultConstraints": {"audio": true, "video": false},
            "autoAccept": true,
            "signalingRetries": 5
        }"#;
        let config = WebCallConfig::from_json(raw).unwrap();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].username.as_deref(), Some("u"));
        assert!(!config.default_constraints.video);
        assert!(config.call_options().auto_accept);
        assert_eq!(config.retry_policy().max_retries, 5);
    }

    #[test]
    fn test_config_rejects_garbage() {
        assert!(matches!(
            WebCallConfig::from_json("not json"),
            Err(ServiceError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_auto_accept_call() {
        let channel = Arc::new(InMemorySignalingChannel::new());
        let caller_service = CallService::builder(channel.clone(), CountingFactory::default()).build();
        let callee_service = CallService::builder(channel.clone(), CountingFactory::default())
            .auto_accept(true)
            .build();

        let caller = caller_service
            .start_call(Participant::new("alice"), Some(Participant::new("bob")))
            .await
            .unwrap();
        assert_eq!(caller.role(), CallRole::Caller);
        assert_eq!(caller.call_id().as_str().len(), 10);

        let callee = callee_service
            .join_call(caller.call_id().clone(), Participant::new("bob"))
            .await
            .unwrap();
        let mut events = callee.take_events().unwrap();

        timeout(TokioDuration::from_secs(2), async {
            loop {
                if let Some(CallEvent::StatusChanged(CallStatus::Connected)) = events.recv().await {
                    break;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(callee_service.factory.built.load(Ordering::SeqCst), 1);
        let summary = caller.hang_up().await;
        assert_eq!(summary.status, CallStatus::Ended);
        assert_eq!(callee.wait_for_end().await.status, CallStatus::Ended);
    }

    #[tokio::test]
    async fn test_join_missing_call() {
        let channel = Arc::new(InMemorySignalingChannel::new());
        let service = CallService::builder(channel, CountingFactory::default()).build();
        let result = service
            .join_call(CallId::new("missing"), Participant::new("bob"))
            .await;
        assert!(matches!(result, Err(ServiceError::Call(CallError::Signaling(_)))));
    }
}
