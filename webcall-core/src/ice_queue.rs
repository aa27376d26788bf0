//! Remote ICE candidate buffering
//!
//! Candidates frequently reach the callee before the offer (and the caller before the
//! answer). The engine refuses candidates until a remote description is set, so they
//! wait here and are released in receipt order once.

use crate::types::IceCandidate;
use std::collections::VecDeque;

/// FIFO of remote candidates awaiting the remote description
#[derive(Debug, Default)]
pub struct IceCandidateQueue {
    pending: VecDeque<IceCandidate>,
    drained: bool,
}

impl IceCandidateQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a candidate.
    ///
    /// Once the queue has been drained the candidate is handed back for direct
    /// application instead.
    #[must_use = "a returned candidate must be applied by the caller"]
    pub fn enqueue(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.drained {
            return Some(candidate);
        }
        self.pending.push_back(candidate);
        None
    }

    /// Release buffered candidates in receipt order.
    ///
    /// Only the first call yields anything.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        if self.drained {
            return Vec::new();
        }
        self.drained = true;
        self.pending.drain(..).collect()
    }

    /// Drop buffered candidates without applying them
    pub fn discard(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!(count = self.pending.len(), "Discarding queued ICE candidates");
        }
        self.pending.clear();
    }

    /// Number of buffered candidates
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Check if the queue has been drained
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn candidate(n: usize) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.1 {n} typ host"), Some("0".into()), Some(0))
    }

    #[test]
    fn test_buffers_until_drained() {
        let mut queue = IceCandidateQueue::new();
        assert!(queue.enqueue(candidate(1)).is_none());
        assert!(queue.enqueue(candidate(2)).is_none());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.drain(), vec![candidate(1), candidate(2)]);
        assert!(queue.is_drained());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_second_drain_is_empty() {
        let mut queue = IceCandidateQueue::new();
        let _ = queue.enqueue(candidate(1));
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_enqueue_after_drain_returns_candidate() {
        let mut queue = IceCandidateQueue::new();
        queue.drain();
        assert_eq!(queue.enqueue(candidate(3)), Some(candidate(3)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_discard() {
        let mut queue = IceCandidateQueue::new();
        let _ = queue.enqueue(candidate(1));
        queue.discard();
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }

    proptest! {
        #[test]
        fn every_candidate_applied_once_in_order(before in 0usize..20, after in 0usize..20) {
            let mut queue = IceCandidateQueue::new();
            let mut applied = Vec::new();

            for n in 0..before {
                if let Some(c) = queue.enqueue(candidate(n)) {
                    applied.push(c);
                }
            }
            applied.extend(queue.drain());
            for n in before..before + after {
                if let Some(c) = queue.enqueue(candidate(n)) {
                    applied.push(c);
                }
            }
            applied.extend(queue.drain());

            let expected: Vec<_> = (0..before + after).map(candidate).collect();
            prop_assert_eq!(applied, expected);
        }
    }
}
