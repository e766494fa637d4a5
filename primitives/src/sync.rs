//! Reader/writer-locked container.
//!
//! `Synced<T>` keeps a lock and the data it guards in one value, so shared
//! maps (ledger, peer table, pending requests) can never be touched without
//! going through the lock.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
pub struct Synced<T> {
    inner: RwLock<T>,
}

impl<T> Synced<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(value),
        }
    }

    /// Shared access. Many readers may hold this at once.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    /// Exclusive access.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write()
    }

    /// Run `f` under the shared lock.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.read())
    }

    /// Run `f` under the exclusive lock.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.write())
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[test]
    fn test_with_and_with_mut() {
        let map: Synced<HashMap<u32, u32>> = Synced::default();
        map.with_mut(|m| m.insert(1, 10));
        assert_eq!(map.with(|m| m.get(&1).copied()), Some(10));
    }

    #[test]
    fn test_concurrent_writers() {
        let counter = Arc::new(Synced::new(0u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.with_mut(|c| *c += 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.read(), 8000);
    }
}
