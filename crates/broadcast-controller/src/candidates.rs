//! Per-session buffer for ICE candidates that arrive before their endpoint.
//!
//! Browsers start trickling candidates as soon as they create the offer, so
//! candidates routinely reach the controller while the media server endpoint
//! is still being created. They are held here, per session, and flushed in
//! arrival order once the endpoint exists. Each session's queue is capped;
//! candidates past the cap are refused.

use crate::backend::IceCandidate;

use std::collections::{HashMap, VecDeque};

/// Connection-scoped session identifier.
pub type SessionId = String;

/// Queued candidates keyed by session.
#[derive(Debug)]
pub struct CandidateQueue {
    queues: HashMap<SessionId, VecDeque<IceCandidate>>,
    limit: usize,
}

impl Default for CandidateQueue {
    fn default() -> Self {
        Self::with_limit(usize::MAX)
    }
}

impl CandidateQueue {
    /// An uncapped queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A queue holding at most `limit` candidates per session.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            queues: HashMap::new(),
            limit,
        }
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Append a candidate to the session's queue. Returns false, leaving the
    /// queue unchanged, if the session already has `limit` candidates queued.
    pub fn push(&mut self, session_id: &str, candidate: IceCandidate) -> bool {
        if self.len_for(session_id) >= self.limit {
            return false;
        }
        self.queues
            .entry(session_id.to_string())
            .or_default()
            .push_back(candidate);
        true
    }

    /// Remove and return the session's queued candidates, oldest first.
    pub fn take(&mut self, session_id: &str) -> VecDeque<IceCandidate> {
        self.queues.remove(session_id).unwrap_or_default()
    }

    /// Drop the session's queued candidates. Returns how many were dropped.
    pub fn discard(&mut self, session_id: &str) -> usize {
        self.queues.remove(session_id).map_or(0, |q| q.len())
    }

    /// Number of candidates queued for the session.
    #[must_use]
    pub fn len_for(&self, session_id: &str) -> usize {
        self.queues.get(session_id).map_or(0, VecDeque::len)
    }

    /// Total candidates queued across all sessions.
    #[must_use]
    pub fn total(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    #[test]
    fn test_take_preserves_arrival_order() {
        let mut queue = CandidateQueue::new();
        queue.push("s1", candidate(1));
        queue.push("s2", candidate(9));
        queue.push("s1", candidate(2));
        queue.push("s1", candidate(3));

        let taken: Vec<_> = queue.take("s1").into_iter().collect();
        assert_eq!(taken, vec![candidate(1), candidate(2), candidate(3)]);

        // Taken exactly once
        assert!(queue.take("s1").is_empty());
        assert_eq!(queue.len_for("s2"), 1);
    }

    #[test]
    fn test_discard() {
        let mut queue = CandidateQueue::new();
        queue.push("s1", candidate(1));
        queue.push("s1", candidate(2));

        assert_eq!(queue.discard("s1"), 2);
        assert_eq!(queue.discard("s1"), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_limit_is_per_session() {
        let mut queue = CandidateQueue::with_limit(2);
        assert!(queue.push("s1", candidate(1)));
        assert!(queue.push("s1", candidate(2)));
        assert!(!queue.push("s1", candidate(3)));
        assert!(queue.push("s2", candidate(4)));

        let taken: Vec<_> = queue.take("s1").into_iter().collect();
        assert_eq!(taken, vec![candidate(1), candidate(2)]);

        // Room again once drained.
        assert!(queue.push("s1", candidate(5)));
        assert_eq!(queue.total(), 2);
    }

    #[test]
    fn test_zero_limit_queues_nothing() {
        let mut queue = CandidateQueue::with_limit(0);
        assert!(!queue.push("s1", candidate(1)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_totals() {
        let mut queue = CandidateQueue::new();
        assert_eq!(queue.total(), 0);

        queue.push("a", candidate(1));
        queue.push("b", candidate(2));
        queue.push("b", candidate(3));

        assert_eq!(queue.total(), 3);
        assert_eq!(queue.len_for("b"), 2);
        assert_eq!(queue.len_for("missing"), 0);
        assert!(!queue.is_empty());
    }
}
