//! Per-file reader/writer locks acquired in a global order.
//!
//! An update locks its destination exclusively and every external copy
//! source shared. The whole set is acquired in ascending [`FileKey`] order,
//! so two workers that each patch a file the other reads from cannot
//! deadlock. The wait for the complete set is bounded; on timeout everything
//! already taken is released and the update is retried on a later pass.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use crate::error::InPlaceError;
use crate::key::FileKey;
use crate::trace;

/// Access an update needs to one file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    /// Readers may share the file; writers are excluded.
    Shared,
    /// The holder is the only reader or writer.
    Exclusive,
}

/// The locks one update needs, keyed in acquisition order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LockSet {
    entries: BTreeMap<FileKey, LockMode>,
}

impl LockSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires exclusive access to `key`.
    pub fn exclusive(&mut self, key: FileKey) {
        self.entries.insert(key, LockMode::Exclusive);
    }

    /// Requires shared access to `key` unless exclusive access is already
    /// required.
    pub fn shared(&mut self, key: FileKey) {
        self.entries.entry(key).or_insert(LockMode::Shared);
    }

    /// Returns the mode required for `key`.
    #[must_use]
    pub fn mode_of(&self, key: &FileKey) -> Option<LockMode> {
        self.entries.get(key).copied()
    }

    /// Returns the number of files in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Reports whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates the set in acquisition order.
    pub fn iter(&self) -> impl Iterator<Item = (&FileKey, LockMode)> {
        self.entries.iter().map(|(key, mode)| (key, *mode))
    }
}

#[derive(Debug, Default)]
struct Holders {
    readers: usize,
    writer: bool,
}

impl Holders {
    const fn admits(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => !self.writer,
            LockMode::Exclusive => !self.writer && self.readers == 0,
        }
    }
}

/// Lock table shared by every worker of the subsystem.
#[derive(Debug, Default)]
pub struct LockTable {
    held: Mutex<FxHashMap<FileKey, Holders>>,
    released: Condvar,
}

impl LockTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquires every lock in `set`, in order, waiting at most `timeout` for
    /// the whole set.
    pub fn acquire(
        self: &Arc<Self>,
        set: &LockSet,
        timeout: Duration,
    ) -> Result<LockGuard, InPlaceError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut guard = LockGuard {
            table: Arc::clone(self),
            held: Vec::with_capacity(set.len()),
        };

        for (key, mode) in set.iter() {
            let mut held = self.lock();
            loop {
                if held.get(key).is_none_or(|holders| holders.admits(mode)) {
                    let holders = held.entry(key.clone()).or_default();
                    match mode {
                        LockMode::Shared => holders.readers += 1,
                        LockMode::Exclusive => holders.writer = true,
                    }
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    drop(held);
                    trace::lock_timeout(key, mode, now - started);
                    // Dropping the guard releases what was taken so far.
                    drop(guard);
                    return Err(InPlaceError::LockTimeout {
                        key: key.clone(),
                        waited: now - started,
                    });
                }
                trace::lock_wait(key, mode);
                held = self
                    .released
                    .wait_timeout(held, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            drop(held);
            guard.held.push((key.clone(), mode));
        }

        trace::lock_acquired(set);
        Ok(guard)
    }

    /// Reports whether any lock on `key` is currently held.
    #[must_use]
    pub fn is_locked(&self, key: &FileKey) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|holders| holders.writer || holders.readers > 0)
    }

    fn release(&self, key: &FileKey, mode: LockMode) {
        let mut held = self.lock();
        if let Some(holders) = held.get_mut(key) {
            match mode {
                LockMode::Shared => holders.readers = holders.readers.saturating_sub(1),
                LockMode::Exclusive => holders.writer = false,
            }
            if !holders.writer && holders.readers == 0 {
                held.remove(key);
            }
        }
        drop(held);
        self.released.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<FileKey, Holders>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Locks held by one update; released in reverse acquisition order on drop.
#[derive(Debug)]
pub struct LockGuard {
    table: Arc<LockTable>,
    held: Vec<(FileKey, LockMode)>,
}

impl LockGuard {
    /// Reports whether the guard holds `key` in at least `mode`.
    #[must_use]
    pub fn holds(&self, key: &FileKey, mode: LockMode) -> bool {
        self.held
            .iter()
            .any(|(held_key, held_mode)| held_key == key && *held_mode >= mode)
    }

    /// Reports whether the guard holds everything `set` requires.
    #[must_use]
    pub fn covers(&self, set: &LockSet) -> bool {
        set.iter().all(|(key, mode)| self.holds(key, mode))
    }

    /// Returns the held locks in acquisition order.
    #[must_use]
    pub fn held(&self) -> &[(FileKey, LockMode)] {
        &self.held
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        while let Some((key, mode)) = self.held.pop() {
            self.table.release(&key, mode);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn key(path: &str) -> FileKey {
        FileKey::new("f", path)
    }

    #[test]
    fn exclusive_requirement_wins_over_shared() {
        let mut set = LockSet::new();
        set.exclusive(key("a"));
        set.shared(key("a"));
        set.shared(key("b"));
        assert_eq!(set.mode_of(&key("a")), Some(LockMode::Exclusive));
        assert_eq!(set.mode_of(&key("b")), Some(LockMode::Shared));
    }

    #[test]
    fn locks_are_acquired_in_key_order_and_released_on_drop() {
        let table = LockTable::new();
        let mut set = LockSet::new();
        set.shared(key("c"));
        set.exclusive(key("a"));
        set.shared(key("b"));

        let guard = table.acquire(&set, Duration::from_millis(10)).expect("acquire");
        let order: Vec<&str> = guard
            .held()
            .iter()
            .map(|(k, _)| k.path().to_str().expect("utf8"))
            .collect();
        assert_eq!(order, ["a", "b", "c"]);
        assert!(guard.covers(&set));
        assert!(table.is_locked(&key("a")));

        drop(guard);
        assert!(!table.is_locked(&key("a")));
        assert!(!table.is_locked(&key("c")));
    }

    #[test]
    fn shared_locks_coexist() {
        let table = LockTable::new();
        let mut set = LockSet::new();
        set.shared(key("a"));
        let first = table.acquire(&set, Duration::from_millis(10)).expect("first");
        let second = table.acquire(&set, Duration::from_millis(10)).expect("second");
        drop(first);
        assert!(table.is_locked(&key("a")));
        drop(second);
        assert!(!table.is_locked(&key("a")));
    }

    #[test]
    fn timeout_releases_partial_acquisition() {
        let table = LockTable::new();
        let mut blocker = LockSet::new();
        blocker.exclusive(key("b"));
        let held = table.acquire(&blocker, Duration::from_millis(10)).expect("blocker");

        let mut wanted = LockSet::new();
        wanted.exclusive(key("a"));
        wanted.shared(key("b"));
        let error = table
            .acquire(&wanted, Duration::from_millis(20))
            .expect_err("times out");
        match error {
            InPlaceError::LockTimeout { key: blocked, .. } => assert_eq!(blocked, key("b")),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!table.is_locked(&key("a")), "partial lock must be released");
        drop(held);
    }

    #[test]
    fn waiter_proceeds_once_holder_releases() {
        let table = LockTable::new();
        let mut set = LockSet::new();
        set.exclusive(key("a"));
        let held = table.acquire(&set, Duration::from_millis(10)).expect("held");
        let barrier = Arc::new(Barrier::new(2));

        let waiter = {
            let table = Arc::clone(&table);
            let set = set.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                table.acquire(&set, Duration::from_secs(5)).map(|_| ())
            })
        };
        barrier.wait();
        thread::sleep(Duration::from_millis(20));
        drop(held);
        assert!(waiter.join().expect("join").is_ok());
    }

    #[test]
    fn crossing_lock_sets_do_not_deadlock() {
        let table = LockTable::new();
        let mut first = LockSet::new();
        first.exclusive(key("a"));
        first.shared(key("b"));
        let mut second = LockSet::new();
        second.exclusive(key("b"));
        second.shared(key("a"));

        let handles: Vec<_> = [first, second]
            .into_iter()
            .map(|set| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let guard = table.acquire(&set, Duration::from_secs(5)).expect("acquire");
                        drop(guard);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
    }
}
