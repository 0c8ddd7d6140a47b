//! Source state-change feed.
//!
//! Every creation is reported as `(key, 1, t)` and every removal as
//! `(key, 0, t)`. Subscribers (a metrics exporter, say) get a broadcast
//! stream; the most recent transitions are also kept for polling.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::source::SourceKey;

/// Transitions kept for polling.
pub const RECENT_TRANSITIONS: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceTransition {
    pub source: SourceKey,
    /// 1 = became active, 0 = removed.
    pub state: u8,
    /// Unix time in milliseconds.
    pub timestamp_ms: u64,
}

pub struct TransitionLog {
    recent: VecDeque<SourceTransition>,
    capacity: usize,
    tx: broadcast::Sender<SourceTransition>,
}

impl TransitionLog {
    pub fn new(capacity: usize, tx: broadcast::Sender<SourceTransition>) -> Self {
        Self {
            recent: VecDeque::with_capacity(capacity),
            capacity,
            tx,
        }
    }

    pub fn record(&mut self, source: SourceKey, active: bool) {
        let transition = SourceTransition {
            source,
            state: u8::from(active),
            timestamp_ms: unix_millis(),
        };
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(transition.clone());
        // No subscribers is fine.
        let _ = self.tx.send(transition);
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<SourceTransition> {
        self.recent.iter().cloned().collect()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> SourceKey {
        SourceKey {
            name: name.to_string(),
            address: "10.0.0.1".parse().unwrap(),
            port: 5961,
        }
    }

    #[test]
    fn records_and_broadcasts() {
        let (tx, mut rx) = broadcast::channel(8);
        let mut log = TransitionLog::new(4, tx);
        log.record(key("a"), true);
        log.record(key("a"), false);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.state, 1);
        assert_eq!(rx.try_recv().unwrap().state, 0);
        assert!(first.timestamp_ms > 0);
        assert_eq!(log.recent().len(), 2);
    }

    #[test]
    fn keeps_only_most_recent() {
        let (tx, _) = broadcast::channel(8);
        let mut log = TransitionLog::new(2, tx);
        log.record(key("a"), true);
        log.record(key("b"), true);
        log.record(key("c"), true);

        let names: Vec<String> = log.recent().into_iter().map(|t| t.source.name).collect();
        assert_eq!(names, vec!["b", "c"]);
    }
}
