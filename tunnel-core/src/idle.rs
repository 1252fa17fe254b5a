//! Per-handler idle-timeout tracking: a shared, lock-protected timestamp
//! that both the handler's own read/write task and the dispatcher's
//! periodic sweep can touch.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Default idle timeout: 60 seconds.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How often the idle sweep wakes up.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// Shared last-activity clock for one handler. Cheap to clone (an `Arc`);
/// handed to the handler's own read/write task as well as kept in the
/// dispatcher's table entry, so both sides can record payload activity
/// without routing it through a channel.
#[derive(Clone)]
pub struct Activity(Arc<Mutex<Instant>>);

impl Activity {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    /// Record payload activity now. Called on any successful read or write
    /// of payload bytes — never on frame overhead alone.
    pub fn touch(&self) {
        let mut at = self.0.lock().expect("activity mutex poisoned");
        *at = Instant::now();
    }

    /// Whether this handler has been idle for longer than `timeout`.
    /// Guards against clock regression: if `Instant::now()` is somehow
    /// before the last recorded activity, reset instead of firing.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        let now = Instant::now();
        let mut at = self.0.lock().expect("activity mutex poisoned");
        if now < *at {
            *at = now;
            return false;
        }
        now.duration_since(*at) > timeout
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn not_idle_before_timeout_elapses() {
        let activity = Activity::new();
        assert!(!activity.is_idle(Duration::from_secs(60)));
    }

    #[test]
    fn idle_after_timeout_elapses() {
        let activity = Activity::new();
        assert!(activity.is_idle(Duration::from_millis(0)));
    }

    #[test]
    fn touch_resets_the_idle_window() {
        let activity = Activity::new();
        sleep(Duration::from_millis(5));
        activity.touch();
        assert!(!activity.is_idle(Duration::from_millis(1)));
    }

    #[test]
    fn clones_share_the_same_clock() {
        let activity = Activity::new();
        let clone = activity.clone();
        clone.touch();
        assert!(!activity.is_idle(Duration::from_secs(60)));
    }
}
