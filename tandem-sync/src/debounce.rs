//! Trailing-edge debouncing of local mutations.
//!
//! Both types here are plain state machines driven by explicit
//! `Instant`s. The async shell sleeps until [`Debouncer::next_deadline`]
//! and then calls [`Debouncer::poll`].
//!
//! ```text
//! notify(a) ─ notify(b) ─ notify(c) ──── quiet window ────► emit(c)
//!     └────── each notify reschedules ──────┘
//! ```

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Pending<T> {
    value: T,
    due: Instant,
}

/// Emits only the latest value, once no new value arrived for `window`.
#[derive(Debug, Clone)]
pub struct Debouncer<T> {
    window: Duration,
    pending: Option<Pending<T>>,
}

impl<T> Debouncer<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
        }
    }

    /// Record a new value, replacing any pending one, and restart the window.
    /// Returns the value it replaced.
    pub fn notify(&mut self, value: T, now: Instant) -> Option<T> {
        let replaced = self.pending.take().map(|p| p.value);
        self.pending = Some(Pending {
            value,
            due: now + self.window,
        });
        replaced
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.due)
    }

    /// Take the pending value if its quiet window has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        match &self.pending {
            Some(p) if p.due <= now => self.pending.take().map(|p| p.value),
            _ => None,
        }
    }

    /// Take the pending value regardless of the timer.
    pub fn flush(&mut self) -> Option<T> {
        self.pending.take().map(|p| p.value)
    }

    /// Drop the pending value without emitting it.
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }

    pub fn pending(&self) -> Option<&T> {
        self.pending.as_ref().map(|p| &p.value)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingTransition {
    Start,
    Pause,
}

/// Typing indicator derived from the same mutation stream as content.
///
/// `Start` fires on the first mutation after an idle period, `Pause` once
/// no mutation arrived for the idle window.
#[derive(Debug, Clone)]
pub struct TypingSignal {
    idle: Debouncer<()>,
}

impl TypingSignal {
    pub fn new(idle_window: Duration) -> Self {
        Self {
            idle: Debouncer::new(idle_window),
        }
    }

    pub fn mutation(&mut self, now: Instant) -> Option<TypingTransition> {
        match self.idle.notify((), now) {
            None => Some(TypingTransition::Start),
            Some(()) => None,
        }
    }

    pub fn poll(&mut self, now: Instant) -> Option<TypingTransition> {
        self.idle.poll(now).map(|()| TypingTransition::Pause)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.idle.next_deadline()
    }

    pub fn is_typing(&self) -> bool {
        self.idle.is_pending()
    }

    /// Stop typing now. Returns `Pause` if typing was in progress.
    pub fn stop(&mut self) -> Option<TypingTransition> {
        self.idle.flush().map(|()| TypingTransition::Pause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(5000);

    #[test]
    fn test_burst_emits_once_with_last_value() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);

        for i in 0..10u64 {
            debouncer.notify(i, t0 + Duration::from_millis(i * 100));
        }

        assert_eq!(debouncer.poll(t0 + Duration::from_millis(5000)), None);
        let last_notify = t0 + Duration::from_millis(900);
        assert_eq!(debouncer.next_deadline(), Some(last_notify + WINDOW));
        assert_eq!(debouncer.poll(last_notify + WINDOW), Some(9));
        assert_eq!(debouncer.poll(last_notify + WINDOW * 2), None);
    }

    #[test]
    fn test_notify_returns_replaced_value() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);
        assert_eq!(debouncer.notify("a", t0), None);
        assert_eq!(debouncer.notify("b", t0), Some("a"));
        assert_eq!(debouncer.pending(), Some(&"b"));
    }

    #[test]
    fn test_flush_ignores_timer() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);
        debouncer.notify("content", t0);

        assert_eq!(debouncer.flush(), Some("content"));
        assert!(!debouncer.is_pending());
        assert_eq!(debouncer.flush(), None);
    }

    #[test]
    fn test_cancel_drops_pending() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);
        debouncer.notify(1, t0);
        assert!(debouncer.cancel());
        assert_eq!(debouncer.poll(t0 + WINDOW), None);
        assert!(!debouncer.cancel());
    }

    #[test]
    fn test_typing_start_then_pause() {
        let t0 = Instant::now();
        let idle = Duration::from_millis(1000);
        let mut typing = TypingSignal::new(idle);

        assert_eq!(typing.mutation(t0), Some(TypingTransition::Start));
        assert_eq!(typing.mutation(t0 + Duration::from_millis(300)), None);
        assert_eq!(typing.mutation(t0 + Duration::from_millis(600)), None);
        assert!(typing.is_typing());

        assert_eq!(typing.poll(t0 + Duration::from_millis(1500)), None);
        assert_eq!(
            typing.poll(t0 + Duration::from_millis(1600)),
            Some(TypingTransition::Pause)
        );

        assert_eq!(
            typing.mutation(t0 + Duration::from_millis(4000)),
            Some(TypingTransition::Start)
        );
    }

    #[test]
    fn test_typing_pause_is_independent_of_content_window() {
        let t0 = Instant::now();
        let mut content = Debouncer::new(WINDOW);
        let mut typing = TypingSignal::new(Duration::from_millis(1000));

        content.notify("x", t0);
        typing.mutation(t0);

        let t1 = t0 + Duration::from_millis(1000);
        assert_eq!(typing.poll(t1), Some(TypingTransition::Pause));
        assert_eq!(content.poll(t1), None);
        assert_eq!(content.poll(t0 + WINDOW), Some("x"));
    }

    #[test]
    fn test_typing_stop() {
        let mut typing = TypingSignal::new(Duration::from_millis(1000));
        assert_eq!(typing.stop(), None);
        typing.mutation(Instant::now());
        assert_eq!(typing.stop(), Some(TypingTransition::Pause));
    }
}
