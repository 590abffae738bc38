//! Per-unit mutual exclusion.
//!
//! Keyed by unit id rather than path: a unit keeps its lock while it moves
//! between namespaces. Entries live only while someone holds or waits on
//! them, so the table stays as small as the set of units in flight.

use docflow_protocol::UnitId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

#[derive(Debug, Default)]
pub struct UnitLocks {
    inner: Mutex<HashMap<UnitId, Arc<Mutex<()>>>>,
}

impl UnitLocks {
    pub fn new() -> Self {
        Self::default()
    }

    // The table holds no invariant a panicking holder could break.
    fn table(&self) -> MutexGuard<'_, HashMap<UnitId, Arc<Mutex<()>>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, unit: &UnitId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.table()
                .entry(unit.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Run `f` while holding the unit's lock.
    ///
    /// A lock poisoned by a panicking holder is taken over: the guarded
    /// data is on disk and every write to it is atomic.
    pub fn with_lock<T>(&self, unit: &UnitId, f: impl FnOnce() -> T) -> T {
        let handle = self.handle(unit);
        let value = {
            let _guard = handle.lock().unwrap_or_else(|poisoned| {
                warn!(unit = %unit, "Recovered poisoned unit lock");
                poisoned.into_inner()
            });
            f()
        };
        self.release(unit, handle);
        value
    }

    /// Drop the table entry once no other thread holds a handle to it.
    fn release(&self, unit: &UnitId, handle: Arc<Mutex<()>>) {
        let mut table = self.table();
        // one count for the table, one for `handle`
        if Arc::strong_count(&handle) == 2 {
            table.remove(unit);
        }
    }

    /// Number of units currently locked or waited on.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_same_unit_is_serialized() {
        let locks = Arc::new(UnitLocks::new());
        let unit = UnitId::parse("U1").unwrap();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let unit = unit.clone();
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    locks.with_lock(&unit, || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(std::time::Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_entries_are_dropped_after_use() {
        let locks = UnitLocks::new();
        for n in 0..50 {
            let unit = UnitId::parse(&format!("U{}", n)).unwrap();
            let inside = locks.with_lock(&unit, || locks.len());
            assert_eq!(inside, 1);
        }
        assert_eq!(locks.len(), 0);
    }

    #[test]
    fn test_poisoned_lock_is_recovered() {
        let locks = Arc::new(UnitLocks::new());
        let unit = UnitId::parse("U1").unwrap();

        let panicked = {
            let locks = Arc::clone(&locks);
            let unit = unit.clone();
            thread::spawn(move || {
                locks.with_lock(&unit, || panic!("holder died"));
            })
            .join()
        };
        assert!(panicked.is_err());

        assert_eq!(locks.with_lock(&unit, || 7), 7);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_poison_held_while_another_waits_is_recovered() {
        let locks = Arc::new(UnitLocks::new());
        let unit = UnitId::parse("U1").unwrap();
        // keep the entry alive so the waiter sees the poisoned mutex itself
        let held = locks.handle(&unit);

        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            locks.with_lock(&unit, || panic!("holder died"))
        }));
        assert!(result.is_err());
        assert!(held.is_poisoned());

        assert_eq!(locks.with_lock(&unit, || "ok"), "ok");
        drop(held);
    }
}
