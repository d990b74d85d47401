//! Last-input-time tracking per pane target.
//!
//! The status FSM uses these timestamps to tell a user's keystroke echo
//! apart from genuine pane activity.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

#[derive(Debug, Default)]
pub struct InputTracker {
    last: HashMap<String, DateTime<Utc>>,
}

impl InputTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, target: &str, at: DateTime<Utc>) {
        self.last.insert(target.to_owned(), at);
    }

    pub fn last(&self, target: &str) -> Option<DateTime<Utc>> {
        self.last.get(target).copied()
    }

    pub fn remove(&mut self, target: &str) {
        self.last.remove(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_read_back() {
        let mut tracker = InputTracker::new();
        assert!(tracker.last("main:0.0").is_none());

        let t = Utc::now();
        tracker.record("main:0.0", t);
        assert_eq!(tracker.last("main:0.0"), Some(t));
        assert!(tracker.last("main:0.1").is_none());
    }

    #[test]
    fn later_record_wins() {
        let mut tracker = InputTracker::new();
        let t = Utc::now();
        tracker.record("a:0.0", t);
        let t2 = t + chrono::TimeDelta::seconds(2);
        tracker.record("a:0.0", t2);
        assert_eq!(tracker.last("a:0.0"), Some(t2));
    }

    #[test]
    fn remove_clears_entry() {
        let mut tracker = InputTracker::new();
        tracker.record("a:0.0", Utc::now());
        tracker.remove("a:0.0");
        assert!(tracker.last("a:0.0").is_none());
    }
}
