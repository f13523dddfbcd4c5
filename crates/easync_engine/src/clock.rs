//! Time source for the long-poll loops.

use crate::notify::ChangeWatch;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Reads the time and waits between polls.
pub trait Clock: Send + Sync {
    /// Current Unix time in seconds.
    fn now(&self) -> u64;

    /// Waits for `timeout`, returning early with `true` if a folder under
    /// `watch` changes.
    fn wait(&self, timeout: Duration, watch: Option<&ChangeWatch<'_>>) -> bool;
}

/// The wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }

    fn wait(&self, timeout: Duration, watch: Option<&ChangeWatch<'_>>) -> bool {
        match watch {
            Some(watch) => watch.wait(timeout),
            None => {
                std::thread::sleep(timeout);
                false
            }
        }
    }
}

type WaitHook = Box<dyn FnMut(u64) + Send>;

/// A virtual clock for tests.
///
/// Waiting never blocks: it advances the clock by the full timeout and then
/// runs the hook installed with [`ManualClock::on_wait`], which lets a test
/// inject backend changes at a given virtual time.
pub struct ManualClock {
    now: AtomicU64,
    waits: AtomicUsize,
    hook: Mutex<Option<WaitHook>>,
}

impl ManualClock {
    /// Creates a clock reading `start`.
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
            waits: AtomicUsize::new(0),
            hook: Mutex::new(None),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, seconds: u64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }

    /// Number of waits so far.
    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }

    /// Installs a hook called after every wait with the new time.
    pub fn on_wait(&self, hook: impl FnMut(u64) + Send + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn wait(&self, timeout: Duration, watch: Option<&ChangeWatch<'_>>) -> bool {
        self.waits.fetch_add(1, Ordering::SeqCst);
        let now = self.now.fetch_add(timeout.as_secs(), Ordering::SeqCst) + timeout.as_secs();
        if let Some(hook) = self.hook.lock().as_mut() {
            hook(now);
        }
        watch.is_some_and(ChangeWatch::changed)
    }
}

impl std::fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualClock")
            .field("now", &self.now())
            .field("waits", &self.waits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ChangeNotifier;
    use std::sync::Arc;

    #[test]
    fn manual_clock_advances_on_wait() {
        let clock = ManualClock::new(1000);
        assert!(!clock.wait(Duration::from_secs(5), None));
        assert_eq!(clock.now(), 1005);
        clock.advance(10);
        assert_eq!(clock.now(), 1015);
        assert_eq!(clock.waits(), 1);
    }

    #[test]
    fn hook_sees_new_time() {
        let clock = ManualClock::new(0);
        let notifier = Arc::new(ChangeNotifier::new());
        let hooked = Arc::clone(&notifier);
        clock.on_wait(move |now| {
            if now >= 10 {
                hooked.notify_folder("INBOX");
            }
        });

        let folders = vec!["INBOX".to_string()];
        let watch = notifier.watch(&folders);
        assert!(!clock.wait(Duration::from_secs(5), Some(&watch)));
        assert!(clock.wait(Duration::from_secs(5), Some(&watch)));
    }

    #[test]
    fn system_clock_is_unix_time() {
        assert!(SystemClock.now() > 1_600_000_000);
    }
}
