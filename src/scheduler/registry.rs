use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Serialize;

use crate::scheduler::request::RequestId;
use crate::scheduler::timer::ScheduledTask;

/// Bookkeeping for one job type.
///
/// Created the first time a request for the type arrives and kept for the lifetime of the
/// scheduler, together with its probe timer.
#[derive(Debug, Default)]
pub struct JobTypeState {
    /// Blocked requests in the order they are retried.
    blocked: VecDeque<RequestId>,
    /// Requests currently sweeping partitions.
    active: BTreeSet<RequestId>,
    empty_rounds: u32,
    probe: Option<ScheduledTask>,
}

impl JobTypeState {
    pub fn with_probe(probe: ScheduledTask) -> Self {
        Self {
            probe: Some(probe),
            ..Self::default()
        }
    }

    pub fn block(&mut self, request_id: RequestId) {
        self.active.remove(&request_id);
        if !self.blocked.contains(&request_id) {
            self.blocked.push_back(request_id);
        }
    }

    pub fn unblock(&mut self, request_id: RequestId) -> bool {
        match self.blocked.iter().position(|id| *id == request_id) {
            Some(index) => {
                self.blocked.remove(index);
                true
            }
            None => false,
        }
    }

    /// Remove and return every blocked request, oldest first.
    pub fn take_blocked(&mut self) -> Vec<RequestId> {
        self.blocked.drain(..).collect()
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }

    pub fn has_blocked(&self) -> bool {
        !self.blocked.is_empty()
    }

    pub fn mark_active(&mut self, request_id: RequestId) {
        self.active.insert(request_id);
    }

    pub fn mark_inactive(&mut self, request_id: RequestId) {
        self.active.remove(&request_id);
    }

    pub fn active(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.active.iter().copied()
    }

    pub fn record_empty_round(&mut self) -> u32 {
        self.empty_rounds = self.empty_rounds.saturating_add(1);
        self.empty_rounds
    }

    pub fn reset_empty_rounds(&mut self) {
        self.empty_rounds = 0;
    }

    pub fn empty_rounds(&self) -> u32 {
        self.empty_rounds
    }

    /// Whether enough back-to-back empty rounds were seen to skip polling for new requests.
    pub fn is_known_empty(&self, threshold: u32) -> bool {
        self.empty_rounds >= threshold
    }

    pub fn cancel_probe(&mut self) {
        if let Some(probe) = self.probe.as_mut() {
            probe.cancel();
        }
    }

    pub fn stats(&self) -> JobTypeStats {
        JobTypeStats {
            blocked: self.blocked.iter().copied().collect(),
            active: self.active.iter().copied().collect(),
            empty_rounds: self.empty_rounds,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobTypeStats {
    pub blocked: Vec<RequestId>,
    pub active: Vec<RequestId>,
    pub empty_rounds: u32,
}

/// Snapshot of the scheduler state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub inflight_requests: usize,
    pub job_types: BTreeMap<String, JobTypeStats>,
}

impl SchedulerStats {
    /// Number of blocked requests of `job_type`.
    pub fn blocked(&self, job_type: &str) -> usize {
        self.job_types
            .get(job_type)
            .map(|stats| stats.blocked.len())
            .unwrap_or(0)
    }

    pub fn is_blocked(&self, request_id: RequestId) -> bool {
        self.job_types
            .values()
            .any(|stats| stats.blocked.contains(&request_id))
    }

    pub fn empty_rounds(&self, job_type: &str) -> u32 {
        self.job_types
            .get(job_type)
            .map(|stats| stats.empty_rounds)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_requests_keep_arrival_order() {
        let mut state = JobTypeState::default();
        state.block(3);
        state.block(1);
        state.block(2);
        state.block(1);

        assert!(state.unblock(1));
        assert!(!state.unblock(1));
        assert_eq!(state.take_blocked(), vec![3, 2]);
        assert!(!state.has_blocked());
    }

    #[test]
    fn blocking_clears_active_mark() {
        let mut state = JobTypeState::default();
        state.mark_active(7);
        state.block(7);
        assert_eq!(state.active().count(), 0);
        assert_eq!(state.take_blocked(), vec![7]);
    }

    #[test]
    fn empty_round_threshold() {
        let mut state = JobTypeState::default();
        assert!(!state.is_known_empty(2));
        state.record_empty_round();
        state.record_empty_round();
        assert!(state.is_known_empty(2));
        state.reset_empty_rounds();
        assert_eq!(state.empty_rounds(), 0);
    }

    #[test]
    fn stats_lookup_by_type() {
        let mut state = JobTypeState::default();
        state.block(4);
        state.record_empty_round();

        let mut stats = SchedulerStats::default();
        stats.job_types.insert("pay".to_string(), state.stats());

        assert_eq!(stats.blocked("pay"), 1);
        assert_eq!(stats.blocked("ship"), 0);
        assert!(stats.is_blocked(4));
        assert_eq!(stats.empty_rounds("pay"), 1);
    }
}
