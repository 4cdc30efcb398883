//! Admission control: a sliding-window throttle plus a cap on outstanding requests.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Answer of the admission check for the head of the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Ready,
    /// Too many requests are dispatched and not yet complete.
    MaxOutstanding { outstanding: usize },
    /// The throttle window is full; the oldest slot frees up after `wait`.
    Throttled { wait: Duration },
}

/// Timestamps of the most recent dispatches, at most `capacity` of them.
#[derive(Debug)]
pub struct ThrottleWindow {
    capacity: usize,
    window: Duration,
    dispatches: VecDeque<Instant>,
}

impl ThrottleWindow {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity,
            window,
            dispatches: VecDeque::with_capacity(capacity),
        }
    }

    /// How long until another dispatch fits, or `None` if one fits now.
    ///
    /// A full window whose oldest entry has aged out drops that entry.
    pub fn check(&mut self, now: Instant) -> Option<Duration> {
        if self.dispatches.len() < self.capacity {
            return None;
        }
        let oldest = *self.dispatches.front()?;
        let wait = self
            .window
            .saturating_sub(now.saturating_duration_since(oldest));
        if !wait.is_zero() {
            return Some(wait);
        }
        self.dispatches.pop_front();
        None
    }

    pub fn record(&mut self, now: Instant) {
        debug_assert!(self.dispatches.len() < self.capacity);
        self.dispatches.push_back(now);
    }

    pub fn len(&self) -> usize {
        self.dispatches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatches.is_empty()
    }

    /// Dispatches recorded within the trailing window ending at `now`.
    pub fn in_window(&self, now: Instant) -> usize {
        self.dispatches
            .iter()
            .filter(|at| now.saturating_duration_since(**at) < self.window)
            .count()
    }
}

/// Combines the throttle window with the max-outstanding cap.
///
/// Remembers whether the current blocking episode was already logged so a stalled head is
/// reported once, not every tick.
#[derive(Debug)]
pub struct AdmissionPolicy {
    max_outstanding: usize,
    window: ThrottleWindow,
    notified_max_outstanding: bool,
    notified_window: bool,
}

impl AdmissionPolicy {
    pub fn new(max_outstanding: usize, window: ThrottleWindow) -> Self {
        Self {
            max_outstanding,
            window,
            notified_max_outstanding: false,
            notified_window: false,
        }
    }

    /// Decides whether the head may go out now. Logs once per blocking episode.
    pub fn admit(&mut self, outstanding: usize, now: Instant, url: &url::Url) -> Admission {
        if outstanding >= self.max_outstanding {
            if !self.notified_max_outstanding {
                info!(message = "Waiting on outstanding requests.", outstanding, %url);
                self.notified_max_outstanding = true;
            }
            return Admission::MaxOutstanding { outstanding };
        }
        self.notified_max_outstanding = false;

        if let Some(wait) = self.window.check(now) {
            if !self.notified_window {
                info!(message = "Waiting on throttle window.", wait_ms = wait.as_millis(), %url);
                self.notified_window = true;
            }
            return Admission::Throttled { wait };
        }
        self.notified_window = false;
        Admission::Ready
    }

    /// Records a dispatch that was admitted at `now`.
    pub fn dispatched(&mut self, now: Instant) {
        self.window.record(now);
    }

    pub fn window(&self) -> &ThrottleWindow {
        &self.window
    }
}
