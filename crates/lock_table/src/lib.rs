//! Per-key mutual exclusion for concurrent jobs (C1).
//!
//! A process-wide map from [`Fingerprint`] to acquisition time, guarded by a
//! single mutex. No queueing, no fairness: a failed `try_lock` means another
//! job already owns that fingerprint, and the caller should respond with a
//! contention indicator rather than wait. Distinct operation families
//! (extract, copy, delete, slurp) get their own [`LockTable`] instance so
//! they never contend with one another on the same key.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

use parking_lot::Mutex;

mod metrics;

/// The pair (target storage name, source key), joined on a byte that can't
/// appear in either half so two different splits never collide.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(target: &str, key: &str) -> Self {
        Self(format!("{target}\u{0}{key}"))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.replace('\u{0}', "/"))
    }
}

pub struct LockEntry {
    pub fingerprint: Fingerprint,
    pub acquired_at: Instant,
    pub held_for: Duration,
}

#[derive(Default)]
pub struct LockTable {
    name: &'static str,
    locks: Mutex<HashMap<Fingerprint, Instant>>,
}

impl LockTable {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            locks: Mutex::default(),
        }
    }

    /// Atomically inserts `fp` if absent. Returns `true` on success, `false`
    /// if another job already holds it.
    pub fn try_lock(&self, fp: Fingerprint) -> bool {
        let mut locks = self.locks.lock();
        if locks.contains_key(&fp) {
            metrics::log_contention(self.name);
            return false;
        }
        locks.insert(fp, Instant::now());
        metrics::set_active_entries(self.name, locks.len());
        true
    }

    /// Unconditionally removes `fp`. A no-op if it wasn't held.
    pub fn release(&self, fp: &Fingerprint) {
        let mut locks = self.locks.lock();
        locks.remove(fp);
        metrics::set_active_entries(self.name, locks.len());
    }

    /// Read-only snapshot for operational introspection.
    pub fn entries(&self) -> Vec<LockEntry> {
        let now = Instant::now();
        self.locks
            .lock()
            .iter()
            .map(|(fp, acquired_at)| LockEntry {
                fingerprint: fp.clone(),
                acquired_at: *acquired_at,
                held_for: now.saturating_duration_since(*acquired_at),
            })
            .collect()
    }

    pub fn is_held(&self, fp: &Fingerprint) -> bool {
        self.locks.lock().contains_key(fp)
    }
}

/// RAII guard that releases its fingerprint from `table` on drop, so every
/// exit path out of the job coordinator's state machine releases the lock
/// without needing an explicit cleanup call at each `?`.
pub struct LockGuard<'a> {
    table: &'a LockTable,
    fingerprint: Fingerprint,
}

impl LockTable {
    /// Like `try_lock`, but returns a guard that releases on drop instead of
    /// requiring the caller to call `release` explicitly.
    pub fn try_acquire(&self, fp: Fingerprint) -> Option<LockGuard<'_>> {
        if self.try_lock(fp.clone()) {
            Some(LockGuard {
                table: self,
                fingerprint: fp,
            })
        } else {
            None
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.table.release(&self.fingerprint);
    }
}

/// Like [`LockGuard`], but holds its own `Arc<LockTable>` instead of
/// borrowing one. A plain `LockGuard<'a>` can't be moved into a `tokio::spawn`
/// task (its lifetime is tied to whatever reference produced it, not to
/// `'static`); this is for exactly that handoff -- acquire against a cloned
/// `Arc<LockTable>` before spawning, then move the guard into the task.
pub struct OwnedLockGuard {
    table: Arc<LockTable>,
    fingerprint: Fingerprint,
}

impl LockTable {
    /// Like `try_acquire`, but against an `Arc<LockTable>` the caller already
    /// holds, returning a guard that owns its own clone of that `Arc` rather
    /// than borrowing it.
    pub fn try_acquire_owned(table: &Arc<LockTable>, fp: Fingerprint) -> Option<OwnedLockGuard> {
        if table.try_lock(fp.clone()) {
            Some(OwnedLockGuard {
                table: table.clone(),
                fingerprint: fp,
            })
        } else {
            None
        }
    }
}

impl Drop for OwnedLockGuard {
    fn drop(&mut self) {
        self.table.release(&self.fingerprint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_try_lock_fails_while_first_is_held() {
        let table = LockTable::new("extract");
        let fp = Fingerprint::new("bucket", "key");
        assert!(table.try_lock(fp.clone()));
        assert!(!table.try_lock(fp.clone()));
        table.release(&fp);
        assert!(table.try_lock(fp));
    }

    #[test]
    fn distinct_fingerprints_dont_contend() {
        let table = LockTable::new("extract");
        assert!(table.try_lock(Fingerprint::new("bucket", "a")));
        assert!(table.try_lock(Fingerprint::new("bucket", "b")));
    }

    #[test]
    fn guard_releases_on_drop() {
        let table = LockTable::new("extract");
        let fp = Fingerprint::new("bucket", "key");
        {
            let _guard = table.try_acquire(fp.clone()).expect("not held");
            assert!(table.is_held(&fp));
        }
        assert!(!table.is_held(&fp));
    }

    #[test]
    fn fingerprint_does_not_collide_across_the_split() {
        let a = Fingerprint::new("bucket", "a/b");
        let b = Fingerprint::new("bucket/a", "b");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn owned_guard_survives_a_spawned_task() {
        let table = Arc::new(LockTable::new("extract"));
        let fp = Fingerprint::new("bucket", "key");
        let guard = LockTable::try_acquire_owned(&table, fp.clone()).expect("not held");
        assert!(LockTable::try_acquire_owned(&table, fp.clone()).is_none());

        let table_for_task = table.clone();
        let fp_for_task = fp.clone();
        tokio::spawn(async move {
            let _guard = guard;
            assert!(table_for_task.is_held(&fp_for_task));
        })
        .await
        .unwrap();

        assert!(!table.is_held(&fp));
    }

    #[test]
    fn entries_reports_held_duration() {
        let table = LockTable::new("extract");
        let fp = Fingerprint::new("bucket", "key");
        table.try_lock(fp.clone());
        let entries = table.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fingerprint, fp);
    }
}
