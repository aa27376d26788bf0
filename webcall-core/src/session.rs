//! Shared call session record
//!
//! A [`CallSession`] is the document both participants read and write through the
//! signaling channel. Nobody owns it exclusively: every mutation is a partial
//! [`SessionUpdate`] merged field by field with [`CallSession::merge`], so concurrent
//! writers never clobber each other's candidates or descriptions.

use crate::identity::{Participant, ParticipantId};
use crate::types::{CallId, CallStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One call's shared negotiation state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    /// Call identifier, also the document key
    pub id: CallId,
    /// Participant who created the session
    pub caller_id: ParticipantId,
    /// Participant who joined, unknown until accept
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callee_id: Option<ParticipantId>,
    /// Caller display email
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_email: Option<String>,
    /// Callee display email
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callee_email: Option<String>,
    /// Shared call status
    pub status: CallStatus,
    /// Negotiation attempt epoch
    #[serde(default)]
    pub attempt: u32,
    /// Serialized offer, set once per attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<String>,
    /// Serialized answer, set once per attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    /// Serialized candidates from both sides, append-only
    #[serde(default)]
    pub ice_candidates: Vec<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
    /// Time the answer was published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    /// Time the call reached a terminal status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Call duration in whole seconds, set when the call ends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// Failure message written with `status = failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallSession {
    /// Create a session in `calling` status
    pub fn new(
        id: CallId,
        caller: &Participant,
        callee: Option<&Participant>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            caller_id: caller.id.clone(),
            callee_id: callee.map(|c| c.id.clone()),
            caller_email: caller.email.clone(),
            callee_email: callee.and_then(|c| c.email.clone()),
            status: CallStatus::Calling,
            attempt: 0,
            offer: None,
            answer: None,
            ice_candidates: Vec::new(),
            created_at: now,
            updated_at: now,
            connected_at: None,
            ended_at: None,
            duration: None,
            error: None,
        }
    }

    /// Non-empty offer, if published
    pub fn offer(&self) -> Option<&str> {
        self.offer.as_deref().filter(|o| !o.is_empty())
    }

    /// Non-empty answer, if published
    pub fn answer(&self) -> Option<&str> {
        self.answer.as_deref().filter(|a| !a.is_empty())
    }

    /// Get call duration
    ///
    /// Derived from `connectedAt` and `endedAt`; an ongoing call is measured up to now.
    pub fn call_duration(&self) -> Option<chrono::Duration> {
        let start = self.connected_at?;
        Some(self.ended_at.unwrap_or_else(Utc::now) - start)
    }

    /// Whole seconds between `connectedAt` and `ended_at`, zero if never connected
    pub fn duration_secs_until(&self, ended_at: DateTime<Utc>) -> u64 {
        self.connected_at
            .map(|start| (ended_at - start).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }

    /// Merge a partial update into this session.
    ///
    /// Candidates are union-appended, descriptions are set once per attempt, the status
    /// only moves forward, and nothing but metadata changes once the call is terminal.
    /// Rejected fields are reported, never treated as errors.
    pub fn merge(&mut self, update: SessionUpdate, now: DateTime<Utc>) -> MergeReport {
        let mut report = MergeReport::default();
        let prior_status = self.status;
        let mut current_attempt = true;

        if let Some(attempt) = update.attempt {
            if attempt < self.attempt {
                current_attempt = false;
                report.reject("attempt");
            } else if attempt > self.attempt {
                if prior_status.is_terminal() {
                    current_attempt = false;
                    report.reject("attempt");
                } else {
                    self.attempt = attempt;
                    self.offer = None;
                    self.answer = None;
                    self.ice_candidates.clear();
                }
            }
        }

        let negotiable = current_attempt && !prior_status.is_terminal();

        if let Some(offer) = update.offer {
            let allowed = negotiable
                && !offer.is_empty()
                && prior_status.rank() <= CallStatus::Waiting.rank();
            match &self.offer {
                Some(current) if *current == offer => {}
                None if allowed => self.offer = Some(offer),
                _ => report.reject("offer"),
            }
        }

        if let Some(answer) = update.answer {
            let allowed = negotiable && !answer.is_empty() && self.offer.is_some();
            match &self.answer {
                Some(current) if *current == answer => {}
                None if allowed => self.answer = Some(answer),
                _ => report.reject("answer"),
            }
        }

        if !update.append_ice_candidates.is_empty() {
            if negotiable {
                for candidate in update.append_ice_candidates {
                    if !self.ice_candidates.contains(&candidate) {
                        self.ice_candidates.push(candidate);
                    }
                }
            } else {
                report.reject("iceCandidates");
            }
        }

        if let Some(status) = update.status {
            if status == self.status {
                // no-op
            } else if self.status.can_transition_to(status) {
                self.status = status;
            } else {
                report.reject("status");
            }
        }

        set_once(&mut self.callee_id, update.callee_id, "calleeId", &mut report);
        set_once(&mut self.callee_email, update.callee_email, "calleeEmail", &mut report);
        set_once(&mut self.connected_at, update.connected_at, "connectedAt", &mut report);
        set_once(&mut self.ended_at, update.ended_at, "endedAt", &mut report);
        set_once(&mut self.error, update.error, "error", &mut report);

        if let Some(duration) = update.duration {
            if self.status == CallStatus::Ended && self.duration.is_none() {
                self.duration = Some(duration);
            } else if self.duration != Some(duration) {
                report.reject("duration");
            }
        }

        self.updated_at = now;
        report
    }
}

fn set_once<T: PartialEq>(
    slot: &mut Option<T>,
    value: Option<T>,
    field: &'static str,
    report: &mut MergeReport,
) {
    let Some(value) = value else {
        return;
    };
    match slot {
        None => *slot = Some(value),
        Some(current) if *current == value => {}
        Some(_) => report.reject(field),
    }
}

/// Partial set of session fields to merge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    /// Attempt the update belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// New status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CallStatus>,
    /// Serialized offer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<String>,
    /// Serialized answer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    /// Candidates to union into `iceCandidates`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub append_ice_candidates: Vec<String>,
    /// Callee identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callee_id: Option<ParticipantId>,
    /// Callee display email
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callee_email: Option<String>,
    /// Connection time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    /// End time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Duration in whole seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// Failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionUpdate {
    /// Empty update
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope the update to a negotiation attempt
    #[must_use]
    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Set the status
    #[must_use]
    pub fn status(mut self, status: CallStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Publish the offer
    #[must_use]
    pub fn offer(mut self, offer: impl Into<String>) -> Self {
        self.offer = Some(offer.into());
        self
    }

    /// Publish the answer
    #[must_use]
    pub fn answer(mut self, answer: impl Into<String>) -> Self {
        self.answer = Some(answer.into());
        self
    }

    /// Append a candidate
    #[must_use]
    pub fn append_candidate(mut self, candidate: impl Into<String>) -> Self {
        self.append_ice_candidates.push(candidate.into());
        self
    }

    /// Record the callee
    #[must_use]
    pub fn callee(mut self, callee: &Participant) -> Self {
        self.callee_id = Some(callee.id.clone());
        self.callee_email = callee.email.clone();
        self
    }

    /// Record the connection time
    #[must_use]
    pub fn connected_at(mut self, at: DateTime<Utc>) -> Self {
        self.connected_at = Some(at);
        self
    }

    /// Record the end time
    #[must_use]
    pub fn ended_at(mut self, at: DateTime<Utc>) -> Self {
        self.ended_at = Some(at);
        self
    }

    /// Record the duration
    #[must_use]
    pub fn duration(mut self, secs: u64) -> Self {
        self.duration = Some(secs);
        self
    }

    /// Record a failure message
    #[must_use]
    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    /// Check whether the update carries no fields
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Fields a merge refused to apply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Wire names of the rejected fields
    pub rejected: Vec<&'static str>,
}

impl MergeReport {
    fn reject(&mut self, field: &'static str) {
        self.rejected.push(field);
    }

    /// Check if every field applied
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}
