//! Per-participant submission history with an aging cutoff.
//!
//! Participants may revise their forecast for an event any number of times
//! before settlement. Only an answer that has sat for at least the cutoff
//! duration is eligible as final, so observing the outcome a moment before
//! settlement and sniping a zero-risk revision buys nothing.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use crate::models::{EventKey, ParticipantId, Submission};

/// Serializable view of all retained histories, for checkpointing.
pub type LedgerSnapshot = HashMap<EventKey, HashMap<ParticipantId, VecDeque<Submission>>>;

/// Time-ordered answer histories keyed by (event, participant).
///
/// Histories are single-use: the first settlement read for a pair destroys
/// that pair's history so nothing leaks into a later round for the same key.
pub struct SubmissionLedger {
    cutoff_secs: i64,
    inner: Mutex<LedgerSnapshot>,
}

impl SubmissionLedger {
    pub fn new(cutoff_secs: i64) -> Self {
        Self {
            cutoff_secs,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn cutoff_secs(&self) -> i64 {
        self.cutoff_secs
    }

    /// Records a new answer, newest first. Re-submitting the value already at
    /// the front is a no-op; a changed value always appends, even inside the
    /// same time window.
    pub fn insert(
        &self,
        participant: ParticipantId,
        event_key: &str,
        observed_at: i64,
        value: f64,
    ) {
        let mut inner = self.inner.lock();
        let history = inner
            .entry(event_key.to_string())
            .or_default()
            .entry(participant)
            .or_default();

        if let Some(newest) = history.front() {
            if newest.value == value {
                return;
            }
        }
        history.push_front(Submission {
            submitted_at: observed_at,
            value,
        });
    }

    /// Returns the most recent answer old enough to be trusted: the first
    /// entry, scanning newest to oldest, whose age at `as_of` is at least the
    /// cutoff. None when every entry is too fresh or there is no history.
    ///
    /// Destructive single-use read: the pair's entire history is discarded
    /// before returning, hit or miss. Intended to be called exactly once per
    /// settlement per participant.
    pub fn get_final(
        &self,
        participant: ParticipantId,
        event_key: &str,
        as_of: i64,
    ) -> Option<f64> {
        let mut inner = self.inner.lock();
        let per_event = inner.get_mut(event_key)?;
        let history = per_event.remove(&participant);
        if per_event.is_empty() {
            inner.remove(event_key);
        }

        history?
            .iter()
            .find(|sub| as_of - sub.submitted_at >= self.cutoff_secs)
            .map(|sub| sub.value)
    }

    /// Number of retained entries for a pair. Diagnostic read, no side effects.
    pub fn submission_count(&self, participant: ParticipantId, event_key: &str) -> usize {
        self.inner
            .lock()
            .get(event_key)
            .and_then(|per_event| per_event.get(&participant))
            .map(|history| history.len())
            .unwrap_or(0)
    }

    /// Participants with recorded history for an event.
    pub fn participants(&self, event_key: &str) -> Vec<ParticipantId> {
        self.inner
            .lock()
            .get(event_key)
            .map(|per_event| per_event.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Drops whatever is left for an event, e.g. when it is discarded
    /// upstream and will never settle.
    pub fn drop_event(&self, event_key: &str) {
        self.inner.lock().remove(event_key);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.inner.lock().clone()
    }

    /// Replaces all histories, e.g. when restoring a checkpoint at startup.
    pub fn restore(&self, snapshot: LedgerSnapshot) {
        *self.inner.lock() = snapshot;
    }
}
