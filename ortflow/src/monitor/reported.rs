use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Jobs whose outcome was already sent, keyed by Kubernetes UID.
///
/// The watch stream and the periodic sweep both see every Job, usually more
/// than once. Entries are evicted oldest-first once the capacity is exceeded
/// or they are older than the retention window.
#[derive(Debug)]
pub struct ReportedJobs {
    capacity: usize,
    retention: Duration,
    uids: HashSet<String>,
    order: VecDeque<(String, DateTime<Utc>)>,
}

impl ReportedJobs {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            retention,
            uids: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.uids.contains(uid)
    }

    /// Remember `uid` as reported at `at`. Returns `false` if it already was.
    pub fn insert(&mut self, uid: impl Into<String>, at: DateTime<Utc>) -> bool {
        let uid = uid.into();
        if !self.uids.insert(uid.clone()) {
            return false;
        }
        self.order.push_back((uid, at));

        while self.order.len() > self.capacity {
            self.evict_oldest();
        }
        true
    }

    /// Drop entries older than the retention window. Returns how many were
    /// removed.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
        else {
            return 0;
        };

        let mut removed = 0;
        while self.order.front().is_some_and(|(_, at)| *at < cutoff) {
            self.evict_oldest();
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn evict_oldest(&mut self) {
        if let Some((uid, _)) = self.order.pop_front() {
            self.uids.remove(&uid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_deduplicated() {
        let mut reported = ReportedJobs::new(10, Duration::from_secs(60));
        let now = Utc::now();

        assert!(reported.insert("a", now));
        assert!(!reported.insert("a", now));
        assert!(reported.contains("a"));
        assert_eq!(reported.len(), 1);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut reported = ReportedJobs::new(2, Duration::from_secs(60));
        let now = Utc::now();

        reported.insert("a", now);
        reported.insert("b", now);
        reported.insert("c", now);

        assert!(!reported.contains("a"));
        assert!(reported.contains("b"));
        assert!(reported.contains("c"));
    }

    #[test]
    fn test_prune_drops_expired_entries() {
        let mut reported = ReportedJobs::new(10, Duration::from_secs(60));
        let now = Utc::now();

        reported.insert("old", now - chrono::Duration::seconds(120));
        reported.insert("fresh", now - chrono::Duration::seconds(10));

        assert_eq!(reported.prune(now), 1);
        assert!(!reported.contains("old"));
        assert!(reported.contains("fresh"));
    }
}
