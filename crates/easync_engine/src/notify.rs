//! Change notification between a driver and waiting requests.

use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Default)]
struct Generations {
    /// Changes every waiter cares about, such as the folder list.
    global: u64,
    folders: BTreeMap<String, u64>,
}

impl Generations {
    fn of(&self, folders: &[String]) -> u64 {
        folders
            .iter()
            .filter_map(|folder| self.folders.get(folder))
            .fold(self.global, |sum, generation| sum.wrapping_add(*generation))
    }
}

/// Generation counters drivers bump whenever their data changes.
///
/// Each folder has its own counter, plus one shared counter for changes that
/// concern every folder. Long-poll loops take a [`ChangeWatch`] over the
/// folders they monitor and wait until one of those counters moves or a
/// timeout elapses, instead of sleeping blindly. Changes to other folders do
/// not wake them.
#[derive(Debug, Default)]
pub struct ChangeNotifier {
    generations: Mutex<Generations>,
    changed: Condvar,
}

impl ChangeNotifier {
    /// Creates a notifier with every counter at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Combined generation of `folders` and the shared counter.
    pub fn generation(&self, folders: &[String]) -> u64 {
        self.generations.lock().of(folders)
    }

    /// Signals a change that concerns every waiter.
    pub fn notify(&self) {
        let mut generations = self.generations.lock();
        generations.global += 1;
        self.changed.notify_all();
    }

    /// Signals a change of the items in `folder`.
    pub fn notify_folder(&self, folder: &str) {
        let mut generations = self.generations.lock();
        *generations.folders.entry(folder.to_string()).or_default() += 1;
        self.changed.notify_all();
    }

    /// Snapshots the current generation of `folders`.
    pub fn watch<'a>(&'a self, folders: &'a [String]) -> ChangeWatch<'a> {
        ChangeWatch {
            notifier: self,
            folders,
            seen: self.generation(folders),
        }
    }
}

/// The generation of a set of folders as seen at one point in time.
#[derive(Debug, Clone, Copy)]
pub struct ChangeWatch<'a> {
    notifier: &'a ChangeNotifier,
    folders: &'a [String],
    seen: u64,
}

impl ChangeWatch<'_> {
    /// True if a watched folder changed since the snapshot.
    pub fn changed(&self) -> bool {
        self.notifier.generation(self.folders) != self.seen
    }

    /// Blocks until a watched folder changes or `timeout` elapses. Returns
    /// true if a change was signalled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut generations = self.notifier.generations.lock();
        if generations.of(self.folders) != self.seen {
            return true;
        }
        let result = self.notifier.changed.wait_while_for(
            &mut generations,
            |g| g.of(self.folders) == self.seen,
            timeout,
        );
        !result.timed_out()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn inbox() -> Vec<String> {
        vec!["INBOX".to_string()]
    }

    #[test]
    fn returns_immediately_when_already_changed() {
        let notifier = ChangeNotifier::new();
        let folders = inbox();
        let watch = notifier.watch(&folders);
        notifier.notify_folder("INBOX");
        assert!(watch.changed());
        assert!(watch.wait(Duration::from_secs(60)));
    }

    #[test]
    fn times_out_without_change() {
        let notifier = ChangeNotifier::new();
        let folders = inbox();
        assert!(!notifier.watch(&folders).wait(Duration::from_millis(10)));
    }

    #[test]
    fn other_folders_do_not_wake() {
        let notifier = ChangeNotifier::new();
        let folders = inbox();
        let watch = notifier.watch(&folders);
        let woken = thread::scope(|s| {
            let waiter = s.spawn(move || watch.wait(Duration::from_millis(200)));
            notifier.notify_folder("CAL");
            waiter.join().unwrap()
        });
        assert!(!woken);
        assert_eq!(notifier.generation(&folders), 0);
        assert_eq!(notifier.generation(&["CAL".to_string()]), 1);
    }

    #[test]
    fn wakes_waiter() {
        let notifier = ChangeNotifier::new();
        let folders = inbox();
        let watch = notifier.watch(&folders);
        let woken = thread::scope(|s| {
            let waiter = s.spawn(move || watch.wait(Duration::from_secs(30)));
            thread::sleep(Duration::from_millis(20));
            notifier.notify_folder("INBOX");
            waiter.join().unwrap()
        });
        assert!(woken);
    }

    #[test]
    fn shared_changes_wake_every_watch() {
        let notifier = ChangeNotifier::new();
        let folders = inbox();
        let watch = notifier.watch(&folders);
        let empty = notifier.watch(&[]);
        notifier.notify();
        assert!(watch.changed());
        assert!(empty.changed());
    }
}
