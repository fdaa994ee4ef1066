//! Process activity tracking for idle shutdown
//!
//! Requests [`touch`](ActivityTracker::touch) the tracker; fetches hold an
//! [`ActivityGuard`] for their whole lifetime, including after a caller
//! stopped waiting on them. The process counts as idle only when no guard
//! is alive.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct ActivityTracker {
    started: Instant,
    /// Milliseconds since `started` of the last recorded activity
    last_activity_ms: AtomicU64,
    active: AtomicUsize,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            active: AtomicUsize::new(0),
        }
    }
}

impl ActivityTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record activity now
    pub fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// Mark a long-running operation as in progress until the guard drops
    pub fn begin(self: &Arc<Self>) -> ActivityGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.touch();
        ActivityGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Time since the last activity; zero while any guard is alive
    pub fn idle_for(&self) -> Duration {
        if self.active_count() > 0 {
            return Duration::ZERO;
        }
        let now = self.started.elapsed().as_millis() as u64;
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }
}

/// Keeps the process active while alive
#[derive(Debug)]
pub struct ActivityGuard {
    tracker: Arc<ActivityTracker>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.tracker.touch();
        self.tracker.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_counts() {
        let tracker = ActivityTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let a = tracker.begin();
        let b = tracker.begin();
        assert_eq!(tracker.active_count(), 2);
        assert_eq!(tracker.idle_for(), Duration::ZERO);

        drop(a);
        assert_eq!(tracker.active_count(), 1);
        drop(b);
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn test_idle_time_grows_and_resets() {
        let tracker = ActivityTracker::new();
        std::thread::sleep(Duration::from_millis(30));
        assert!(tracker.idle_for() >= Duration::from_millis(20));

        tracker.touch();
        assert!(tracker.idle_for() < Duration::from_millis(20));
    }
}
