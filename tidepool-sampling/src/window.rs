#![forbid(unsafe_code)]

//! Wall-clock sampling window. The window is wall time rather than monotonic
//! time so that checkpointed windows stay meaningful across restarts;
//! monotonic clocks reset with the process.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::debug;

type RolloverCallback = Box<dyn Fn(&WindowState) + Send + Sync>;

/// Current window identity and bounds. `end = start + duration`; transitions
/// only on rollover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowState {
    /// Window identifier: the wall second of the rollover instant.
    pub id: i64,
    pub start: SystemTime,
    pub end: SystemTime,
    /// Monotonically increasing across the controller's lifetime.
    pub rollover_count: u64,
}

fn wall_second(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        // Clamp pre-epoch clocks rather than wrapping.
        Err(_) => 0,
    }
}

/// Fires the window rollover on a fixed wall-clock cadence.
///
/// The rollover callback is invoked after the controller lock is released,
/// so it may safely reach the downstream sink.
pub struct WindowController {
    state: Mutex<WindowState>,
    duration: Duration,
    callback: Mutex<Option<RolloverCallback>>,
}

impl WindowController {
    /// Open the first window at `now`.
    pub fn new(duration: Duration, now: SystemTime) -> Self {
        Self {
            state: Mutex::new(WindowState {
                id: wall_second(now),
                start: now,
                end: now + duration,
                rollover_count: 0,
            }),
            duration,
            callback: Mutex::new(None),
        }
    }

    /// Read-only view of the current window.
    pub fn current(&self) -> WindowState {
        self.state.lock().clone()
    }

    /// Roll the window if `now` has passed its end. Returns whether a
    /// rollover happened. The callback never runs under the lock.
    pub fn check_rollover(&self, now: SystemTime) -> bool {
        let rolled = {
            let mut g = self.state.lock();
            if now <= g.end {
                return false;
            }
            g.id = wall_second(now);
            g.start = now;
            g.end = now + self.duration;
            g.rollover_count += 1;
            g.clone()
        };
        debug!(window_id = rolled.id, count = rolled.rollover_count, "window rolled");
        if let Some(cb) = self.callback.lock().as_ref() {
            cb(&rolled);
        }
        true
    }

    /// Replace the window state verbatim, e.g. from a checkpoint.
    pub fn restore(&self, id: i64, start: SystemTime, end: SystemTime, rollover_count: u64) {
        let mut g = self.state.lock();
        *g = WindowState {
            id,
            start,
            end,
            rollover_count,
        };
    }

    /// Install the rollover callback.
    pub fn set_rollover_callback<F>(&self, f: F)
    where
        F: Fn(&WindowState) + Send + Sync + 'static,
    {
        *self.callback.lock() = Some(Box::new(f));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn t(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn no_rollover_before_end() {
        let w = WindowController::new(Duration::from_secs(10), t(100));
        assert!(!w.check_rollover(t(105)));
        assert!(!w.check_rollover(t(110)), "boundary is exclusive");
        let s = w.current();
        assert_eq!(s.rollover_count, 0);
        assert_eq!(s.id, 100);
    }

    #[test]
    fn rollover_advances_window() {
        let w = WindowController::new(Duration::from_secs(10), t(100));
        assert!(w.check_rollover(t(111)));
        let s = w.current();
        assert_eq!(s.id, 111);
        assert_eq!(s.start, t(111));
        assert_eq!(s.end, t(121));
        assert_eq!(s.rollover_count, 1);
    }

    #[test]
    fn callback_fires_per_rollover() {
        let w = WindowController::new(Duration::from_secs(1), t(0));
        let fired = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&fired);
        w.set_rollover_callback(move |s| {
            assert!(s.rollover_count > 0);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert!(w.check_rollover(t(2)));
        assert!(!w.check_rollover(t(2)));
        assert!(w.check_rollover(t(4)));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn restore_replaces_state_verbatim() {
        let w = WindowController::new(Duration::from_secs(10), t(0));
        w.restore(777, t(777), t(787), 42);
        let s = w.current();
        assert_eq!(s.id, 777);
        assert_eq!(s.rollover_count, 42);
        // The next rollover continues from the restored state.
        assert!(w.check_rollover(t(800)));
        assert_eq!(w.current().rollover_count, 43);
    }
}
