//! A map with one reader-writer lock per entry, so that operations on
//!  different entries never contend and a pair of entries can be updated as a
//!  single atomic step.
//!
//! The per-entry lock is hand-rolled from three counters, a mutex and a
//!  condition variable instead of `std::sync::RwLock` because the protocol
//!  needs *writer preference*: a waiting writer blocks new readers, so a
//!  steady stream of readers can never starve a writer. `RwLock` leaves that
//!  policy to the platform.
//!
//! Entries are reference counted and never removed; a lookup hands out an
//!  owned handle that stays valid after the map's structural mutex is
//!  released. This is what makes the two-phase locking of
//!  [LockedMap::atomic_pair_operation] safe.

use std::cell::UnsafeCell;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;

struct LockState {
    /// number of threads currently holding the read lock
    active_readers: u32,
    /// true while a single thread holds the write lock
    writer_active: bool,
    /// number of threads blocked in [Entry::write_locked] - readers must not
    ///  enter while this is non-zero (writer preference)
    waiting_writers: u32,
}

struct Entry<V> {
    state: Mutex<LockState>,
    state_changed: Condvar,
    value: UnsafeCell<V>,
}

/// Shared access to `value` is coordinated through the reader-writer protocol
///  in `state`, not through the mutex itself.
unsafe impl<V: Send + Sync> Sync for Entry<V> {}

impl<V> Entry<V> {
    fn new(value: V) -> Entry<V> {
        Entry {
            state: Mutex::new(LockState {
                active_readers: 0,
                writer_active: false,
                waiting_writers: 0,
            }),
            state_changed: Condvar::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// A panicking worker thread must not wedge the whole table for everyone
    ///  else, so lock state is recovered from a poisoned mutex.
    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks while a writer is active *or waiting* - the latter is the
    ///  writer preference part.
    fn read_locked(&self) -> ReadGuard<'_, V> {
        let mut state = self.state();
        while state.writer_active || state.waiting_writers > 0 {
            state = self.state_changed.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        state.active_readers += 1;
        ReadGuard { entry: self }
    }

    /// Registers as a waiting writer first (blocking new readers), then blocks
    ///  until the entry is free of both readers and writers.
    fn write_locked(&self) -> WriteGuard<'_, V> {
        let mut state = self.state();
        state.waiting_writers += 1;
        while state.writer_active || state.active_readers > 0 {
            state = self.state_changed.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        state.waiting_writers -= 1;
        state.writer_active = true;
        WriteGuard { entry: self }
    }
}

struct ReadGuard<'a, V> {
    entry: &'a Entry<V>,
}

impl<V> ReadGuard<'_, V> {
    fn value(&self) -> &V {
        // safety: the guard witnesses a successful read acquisition, so no
        //  writer can touch the value until this guard is dropped
        unsafe { &*self.entry.value.get() }
    }
}

impl<V> Drop for ReadGuard<'_, V> {
    fn drop(&mut self) {
        let mut state = self.entry.state();
        state.active_readers -= 1;
        if state.active_readers == 0 {
            self.entry.state_changed.notify_all();
        }
    }
}

struct WriteGuard<'a, V> {
    entry: &'a Entry<V>,
}

impl<V> WriteGuard<'_, V> {
    fn value_mut(&mut self) -> &mut V {
        // safety: the guard witnesses exclusive write acquisition
        unsafe { &mut *self.entry.value.get() }
    }
}

impl<V> Drop for WriteGuard<'_, V> {
    fn drop(&mut self) {
        let mut state = self.entry.state();
        state.writer_active = false;
        // readers and writers race on wakeup; preference is enforced by the
        //  acquisition predicates
        self.entry.state_changed.notify_all();
    }
}

/// The two shapes an atomic pair operation can see: two distinct entries, or
///  one entry referenced under both keys. A sum type instead of passing the
///  same `&mut` twice, which the aliasing rules forbid.
pub enum PairValues<'a, V> {
    Distinct(&'a mut V, &'a mut V),
    Same(&'a mut V),
}

pub struct LockedMap<K, V> {
    /// protects the map *structure* only; entry values are guarded by the
    ///  per-entry locks
    entries: Mutex<FxHashMap<K, Arc<Entry<V>>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> LockedMap<K, V> {
    pub fn new() -> LockedMap<K, V> {
        LockedMap {
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    fn structure(&self) -> MutexGuard<'_, FxHashMap<K, Arc<Entry<V>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_entry(&self, key: &K) -> Option<Arc<Entry<V>>> {
        self.structure().get(key).cloned()
    }

    /// Inserts iff the key is absent. True means this caller created the
    ///  entry.
    pub fn insert(&self, key: K, value: V) -> bool {
        let mut entries = self.structure();
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, Arc::new(Entry::new(value)));
        true
    }

    /// Structural query - does not take any per-entry lock.
    pub fn exists(&self, key: &K) -> bool {
        self.structure().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.structure().len()
    }

    pub fn is_empty(&self) -> bool {
        self.structure().is_empty()
    }

    /// Returns a copy of the value, taken under the entry's read lock.
    pub fn read(&self, key: &K) -> Option<V> {
        let entry = self.get_entry(key)?;
        let guard = entry.read_locked();
        Some(guard.value().clone())
    }

    /// Replaces the value under the entry's write lock. False if the key was
    ///  never inserted - there is no retry and no waiting for a key to appear.
    pub fn write(&self, key: &K, value: V) -> bool {
        self.update(key, |v| *v = value).is_some()
    }

    /// Runs `f` on the value under the entry's write lock. This is the
    ///  single-entry form of [LockedMap::atomic_pair_operation]: a
    ///  read-modify-write that no concurrent writer can interleave with.
    pub fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let entry = self.get_entry(key)?;
        let mut guard = entry.write_locked();
        Some(f(guard.value_mut()))
    }

    /// Executes `f` while holding the write locks on *both* entries, then
    ///  commits. False (without running `f`) if either key was never inserted.
    ///
    /// Deadlock freedom: after both entries are looked up (and the structural
    ///  mutex released), the two write locks are taken in the order of the
    ///  entries' stable heap addresses. Every concurrent caller uses the same
    ///  total order, so no two threads can request the locks in opposite
    ///  sequences and the AB-BA cycle is impossible.
    pub fn atomic_pair_operation(&self, key1: &K, key2: &K, f: impl FnOnce(PairValues<'_, V>)) -> bool {
        let (entry1, entry2) = {
            let entries = self.structure();
            match (entries.get(key1), entries.get(key2)) {
                (Some(e1), Some(e2)) => (e1.clone(), e2.clone()),
                _ => return false,
            }
        };

        if Arc::ptr_eq(&entry1, &entry2) {
            let mut guard = entry1.write_locked();
            f(PairValues::Same(guard.value_mut()));
            return true;
        }

        let (first, second) = if Arc::as_ptr(&entry1) < Arc::as_ptr(&entry2) {
            (&entry1, &entry2)
        }
        else {
            (&entry2, &entry1)
        };

        let mut first_guard = first.write_locked();
        let mut second_guard = second.write_locked();

        // hand the values over in caller order, not lock order
        let (g1, g2) = if std::ptr::eq(first.as_ref(), entry1.as_ref()) {
            (&mut first_guard, &mut second_guard)
        }
        else {
            (&mut second_guard, &mut first_guard)
        };
        f(PairValues::Distinct(g1.value_mut(), g2.value_mut()));

        // guards drop in reverse declaration order, releasing second then first
        true
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for LockedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
