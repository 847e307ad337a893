//! Per-tree locking
//!
//! Mount and unmount requests for the same tree are serialized; requests for
//! different trees proceed in parallel. An entry lives only while someone
//! holds or waits on it.

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

pub struct TreeLockManager {
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

/// Held lock on one tree; the map entry is pruned on drop when unused.
pub struct TreeGuard<'a> {
    manager: &'a TreeLockManager,
    tree_hash: String,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl TreeLockManager {
    pub fn new() -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
        }
    }

    /// Block until the tree's lock is held.
    pub fn lock(&self, tree_hash: &str) -> TreeGuard<'_> {
        let handle = self.handle(tree_hash);
        TreeGuard {
            manager: self,
            tree_hash: tree_hash.to_string(),
            guard: Some(Mutex::lock_arc(&handle)),
        }
    }

    fn handle(&self, tree_hash: &str) -> Arc<Mutex<()>> {
        {
            let map = self.locks.read();
            if let Some(lock) = map.get(tree_hash) {
                return lock.clone();
            }
        }
        let mut map = self.locks.write();
        map.entry(tree_hash.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // Clones are only taken under the map lock, so a count of one under the
    // write lock means nobody holds or waits on the entry.
    fn prune(&self, tree_hash: &str) {
        let mut map = self.locks.write();
        if map.get(tree_hash).is_some_and(|l| Arc::strong_count(l) == 1) {
            map.remove(tree_hash);
        }
    }

    pub fn len(&self) -> usize {
        self.locks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TreeLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TreeGuard<'_> {
    fn drop(&mut self) {
        // the guard owns an Arc clone; release it before pruning
        self.guard.take();
        self.manager.prune(&self.tree_hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_same_tree_serialized() {
        let manager = Arc::new(TreeLockManager::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let manager = manager.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                let _guard = manager.lock("tree");
                let current = counter.load(Ordering::SeqCst);
                thread::yield_now();
                counter.store(current + 1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_different_trees_lock_independently() {
        let manager = TreeLockManager::new();
        let _a = manager.lock("a");
        let b = manager.lock("b");
        assert_eq!(manager.len(), 2);
        drop(b);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_entry_pruned_after_last_guard() {
        let manager = TreeLockManager::new();
        for i in 0..100 {
            let _guard = manager.lock(&format!("tree-{}", i));
        }
        assert!(manager.is_empty());
    }
}
