//! Step deadlines, ordered by expiry.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use common::SagaId;

/// Deadlines of in-flight forward steps.
///
/// At most one deadline per saga. Expired deadlines are handed out in
/// deadline order and forgotten.
#[derive(Debug, Default)]
pub struct DeadlineTracker {
    by_deadline: BTreeSet<(DateTime<Utc>, SagaId)>,
    by_saga: HashMap<SagaId, DateTime<Utc>>,
}

impl DeadlineTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the deadline of a saga, replacing any earlier one.
    pub fn schedule(&mut self, saga_id: SagaId, deadline: DateTime<Utc>) {
        if let Some(previous) = self.by_saga.insert(saga_id, deadline) {
            self.by_deadline.remove(&(previous, saga_id));
        }
        self.by_deadline.insert((deadline, saga_id));
    }

    /// Removes a saga's deadline. Returns true if there was one.
    pub fn cancel(&mut self, saga_id: SagaId) -> bool {
        match self.by_saga.remove(&saga_id) {
            Some(deadline) => {
                self.by_deadline.remove(&(deadline, saga_id));
                true
            }
            None => false,
        }
    }

    /// Removes and returns every saga whose deadline is at or before `now`.
    pub fn expired(&mut self, now: DateTime<Utc>) -> Vec<SagaId> {
        let mut expired = Vec::new();
        while let Some(&(deadline, saga_id)) = self.by_deadline.first() {
            if deadline > now {
                break;
            }
            self.by_deadline.pop_first();
            self.by_saga.remove(&saga_id);
            expired.push(saga_id);
        }
        expired
    }

    /// Returns the deadline of a saga.
    pub fn deadline_of(&self, saga_id: SagaId) -> Option<DateTime<Utc>> {
        self.by_saga.get(&saga_id).copied()
    }

    /// Returns the earliest deadline.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.by_deadline.first().map(|(deadline, _)| *deadline)
    }

    pub fn len(&self) -> usize {
        self.by_saga.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_saga.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_deadline.clear();
        self.by_saga.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn expired_in_deadline_order() {
        let mut tracker = DeadlineTracker::new();
        let now = Utc::now();
        let (a, b, c) = (SagaId::new(), SagaId::new(), SagaId::new());

        tracker.schedule(a, now + Duration::seconds(2));
        tracker.schedule(b, now + Duration::seconds(1));
        tracker.schedule(c, now + Duration::seconds(10));

        assert!(tracker.expired(now).is_empty());
        assert_eq!(tracker.expired(now + Duration::seconds(5)), vec![b, a]);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.next_deadline(), Some(now + Duration::seconds(10)));
    }

    #[test]
    fn reschedule_replaces_deadline() {
        let mut tracker = DeadlineTracker::new();
        let now = Utc::now();
        let id = SagaId::new();

        tracker.schedule(id, now);
        tracker.schedule(id, now + Duration::seconds(30));

        assert_eq!(tracker.len(), 1);
        assert!(tracker.expired(now + Duration::seconds(1)).is_empty());
        assert_eq!(tracker.deadline_of(id), Some(now + Duration::seconds(30)));
    }

    #[test]
    fn cancel_forgets_saga() {
        let mut tracker = DeadlineTracker::new();
        let id = SagaId::new();
        tracker.schedule(id, Utc::now());

        assert!(tracker.cancel(id));
        assert!(!tracker.cancel(id));
        assert!(tracker.is_empty());
        assert!(tracker.expired(Utc::now() + Duration::days(1)).is_empty());
    }
}
