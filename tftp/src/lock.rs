//! Per-file locking across concurrent sessions.
//!
//! Reads take a shared lock, writes an exclusive one.  A request that would
//! conflict is rejected immediately with an access violation; nobody waits.
//! The lock is held by a [`LockGuard`] owned by the session and released when
//! the session is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
enum Holders {
    Shared(usize),
    Exclusive,
}

/// Thread-safe lock table keyed by filename.
#[derive(Debug, Clone, Default)]
pub struct FileLocks {
    inner: Arc<Mutex<HashMap<String, Holders>>>,
}

impl FileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a lock on `name`, or `None` if it conflicts with a held one.
    pub fn try_lock(&self, name: &str, mode: LockMode) -> Option<LockGuard> {
        let mut table = self.table();
        match (table.get_mut(name), mode) {
            (None, LockMode::Shared) => {
                table.insert(name.to_string(), Holders::Shared(1));
            }
            (None, LockMode::Exclusive) => {
                table.insert(name.to_string(), Holders::Exclusive);
            }
            (Some(Holders::Shared(n)), LockMode::Shared) => *n += 1,
            (Some(_), _) => return None,
        }
        Some(LockGuard {
            locks: self.clone(),
            name: name.to_string(),
        })
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.table().contains_key(name)
    }

    fn release(&self, name: &str) {
        let mut table = self.table();
        let remove = match table.get_mut(name) {
            Some(Holders::Shared(n)) if *n > 1 => {
                *n -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };
        if remove {
            table.remove(name);
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Holders>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases its lock on drop.
#[derive(Debug)]
pub struct LockGuard {
    locks: FileLocks,
    name: String,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.locks.release(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_share() {
        let locks = FileLocks::new();
        let a = locks.try_lock("f", LockMode::Shared);
        let b = locks.try_lock("f", LockMode::Shared);
        assert!(a.is_some() && b.is_some());
        assert!(locks.try_lock("f", LockMode::Exclusive).is_none());
        drop(a);
        assert!(locks.is_locked("f"));
        drop(b);
        assert!(!locks.is_locked("f"));
    }

    #[test]
    fn writer_excludes_everyone() {
        let locks = FileLocks::new();
        let w = locks.try_lock("f", LockMode::Exclusive).unwrap();
        assert!(locks.try_lock("f", LockMode::Shared).is_none());
        assert!(locks.try_lock("f", LockMode::Exclusive).is_none());
        assert!(locks.try_lock("g", LockMode::Exclusive).is_some());
        drop(w);
        assert!(locks.try_lock("f", LockMode::Shared).is_some());
    }
}
