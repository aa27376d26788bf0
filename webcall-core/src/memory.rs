//! In-process signaling channel
//!
//! Holds session documents in memory and notifies subscribers synchronously after each
//! merge. Cloning the channel shares the store, so two participants in one process can
//! talk through it.

use crate::session::{CallSession, SessionUpdate};
use crate::signaling::{SignalingChannel, SignalingError, SnapshotCallback, Subscription};
use crate::types::CallId;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

struct Subscriber {
    id: u64,
    call_id: CallId,
    on_change: SnapshotCallback,
}

struct Store {
    sessions: HashMap<CallId, CallSession>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    reachable: bool,
}

impl Store {
    fn notify(&self, session: &CallSession) {
        for sub in self.subscribers.iter().filter(|s| s.call_id == session.id) {
            (sub.on_change)(session.clone());
        }
    }

    fn check_reachable(&self) -> Result<(), SignalingError> {
        if self.reachable {
            Ok(())
        } else {
            Err(SignalingError::Unavailable("in-memory store offline".to_string()))
        }
    }
}

/// Signaling channel backed by a shared in-memory map
#[derive(Clone)]
pub struct InMemorySignalingChannel {
    store: Arc<Mutex<Store>>,
}

impl InMemorySignalingChannel {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(Store {
                sessions: HashMap::new(),
                subscribers: Vec::new(),
                next_subscriber: 0,
                reachable: true,
            })),
        }
    }

    /// Simulate losing or regaining connectivity; reads and writes fail while offline
    pub fn set_reachable(&self, reachable: bool) {
        self.store.lock().reachable = reachable;
    }

    /// Current session state, bypassing reachability
    #[must_use]
    pub fn snapshot(&self, call_id: &CallId) -> Option<CallSession> {
        self.store.lock().sessions.get(call_id).cloned()
    }

    /// Number of live subscriptions on a session
    #[must_use]
    pub fn subscriber_count(&self, call_id: &CallId) -> usize {
        self.store
            .lock()
            .subscribers
            .iter()
            .filter(|s| &s.call_id == call_id)
            .count()
    }
}

impl Default for InMemorySignalingChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingChannel for InMemorySignalingChannel {
    async fn read(&self, call_id: &CallId) -> Result<CallSession, SignalingError> {
        let store = self.store.lock();
        store.check_reachable()?;
        store
            .sessions
            .get(call_id)
            .cloned()
            .ok_or_else(|| SignalingError::NotFound(call_id.clone()))
    }

    async fn subscribe(
        &self,
        call_id: &CallId,
        on_change: SnapshotCallback,
    ) -> Result<Subscription, SignalingError> {
        let mut store = self.store.lock();
        let id = store.next_subscriber;
        store.next_subscriber += 1;

        if let Some(current) = store.sessions.get(call_id) {
            on_change(current.clone());
        }
        store.subscribers.push(Subscriber {
            id,
            call_id: call_id.clone(),
            on_change,
        });

        let weak: Weak<Mutex<Store>> = Arc::downgrade(&self.store);
        Ok(Subscription::new(move || {
            if let Some(store) = weak.upgrade() {
                store.lock().subscribers.retain(|s| s.id != id);
            }
        }))
    }

    async fn update(&self, call_id: &CallId, update: SessionUpdate) -> Result<(), SignalingError> {
        let mut store = self.store.lock();
        store.check_reachable()?;
        let session = store
            .sessions
            .get_mut(call_id)
            .ok_or_else(|| SignalingError::NotFound(call_id.clone()))?;

        let report = session.merge(update, Utc::now());
        if !report.is_clean() {
            tracing::debug!(
                call_id = %call_id,
                rejected = ?report.rejected,
                "Ignored fields in session update"
            );
        }
        let merged = session.clone();
        store.notify(&merged);
        Ok(())
    }

    async fn create(&self, session: CallSession) -> Result<(), SignalingError> {
        let mut store = self.store.lock();
        store.check_reachable()?;
        if store.sessions.contains_key(&session.id) {
            return Err(SignalingError::AlreadyExists(session.id));
        }
        store.sessions.insert(session.id.clone(), session.clone());
        store.notify(&session);
        Ok(())
    }
}
