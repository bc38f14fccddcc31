//! Reconnect-storm detection.
//!
//! A peer that opens a connection, fails and immediately retries shows up
//! here as a burst of attempts under the same `os-device-app` key. The
//! tracker only reports the burst, it never refuses a connection.

use devlink_types::PeerQuery;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

pub const CONNECTION_WINDOW: Duration = Duration::from_secs(20);
pub const CONNECTION_PROBLEM_THRESHOLD: usize = 4;

#[derive(Default)]
struct AttemptLog {
    attempts: VecDeque<Instant>,
    looping: bool,
}

pub struct ConnectionTracker {
    window: Duration,
    threshold: usize,
    logs: Mutex<HashMap<String, AttemptLog>>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new(CONNECTION_WINDOW, CONNECTION_PROBLEM_THRESHOLD)
    }
}

impl ConnectionTracker {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            window,
            threshold,
            logs: Mutex::new(HashMap::new()),
        }
    }

    /// Record an attempt now. Returns true when this attempt crossed the threshold.
    pub fn log_connection_attempt(&self, query: &PeerQuery) -> bool {
        self.log_attempt_at(query, Instant::now())
    }

    pub fn log_attempt_at(&self, query: &PeerQuery, now: Instant) -> bool {
        let key = query.tracker_key();
        let mut logs = self.logs.lock().unwrap_or_else(|p| p.into_inner());
        let log = logs.entry(key).or_default();

        log.attempts.push_back(now);
        if let Some(cutoff) = now.checked_sub(self.window) {
            while log.attempts.front().is_some_and(|t| *t < cutoff) {
                log.attempts.pop_front();
            }
        }

        if log.attempts.len() < self.threshold {
            log.looping = false;
            return false;
        }
        if log.looping {
            return false;
        }

        log.looping = true;
        warn!(
            "Connection loop detected with {} on {} ({}). Connected {} times within {}s.",
            query.app,
            query.device,
            query.os,
            log.attempts.len(),
            self.window.as_secs()
        );
        true
    }

    /// Attempts still inside the window for this peer.
    pub fn attempts_in_window(&self, query: &PeerQuery) -> usize {
        let logs = self.logs.lock().unwrap_or_else(|p| p.into_inner());
        logs.get(&query.tracker_key())
            .map(|log| log.attempts.len())
            .unwrap_or(0)
    }
}
