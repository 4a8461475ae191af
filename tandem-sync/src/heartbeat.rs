//! Liveness schedule for the room HTTP API.
//!
//! A liveness call is due every `interval` while joined, and immediately
//! when the view becomes visible again.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Heartbeat {
    interval: Duration,
    next_due: Option<Instant>,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_due: None,
        }
    }

    /// Start the schedule; the first call is due one interval from now.
    pub fn start(&mut self, now: Instant) {
        self.next_due = Some(now + self.interval);
    }

    pub fn stop(&mut self) {
        self.next_due = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_due.is_some()
    }

    /// Returns true when a call is due, and schedules the next one.
    pub fn due(&mut self, now: Instant) -> bool {
        match self.next_due {
            Some(at) if at <= now => {
                self.next_due = Some(now + self.interval);
                true
            }
            _ => false,
        }
    }

    /// The view became visible: a call is due right away if running.
    pub fn visibility_regained(&mut self, now: Instant) -> bool {
        if !self.is_running() {
            return false;
        }
        self.next_due = Some(now + self.interval);
        true
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_due
    }
}
