//! Shares of `[x < p/2]` predicates already computed for caller-identified secret values.
//!
//! Whether a lookup hits decides how many rounds a comparison takes, so every peer must observe
//! the same cache contents at the same round. Inserts are therefore staged and only become
//! visible once [`PredicateCache::commit`] runs at the end of a round. When several operations
//! compute the same key in one round, the share of the operation with the lowest id is kept.
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError, RwLock},
};

#[derive(Debug, Default)]
pub struct PredicateCache {
    committed: RwLock<HashMap<u64, i64>>,
    /// `(key, operation id, share)` in insertion order.
    staged: Mutex<Vec<(u64, usize, i64)>>,
}

impl PredicateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: u64) -> Option<i64> {
        self.committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .copied()
    }

    pub fn insert(&self, key: u64, operation: usize, share: i64) {
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((key, operation, share));
    }

    /// Makes the staged inserts visible.
    pub fn commit(&self) {
        let mut staged = {
            let mut guard = self.staged.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        if staged.is_empty() {
            return;
        }
        // stable, so inserts of one operation keep their order
        staged.sort_by_key(|(_, operation, _)| *operation);
        let mut committed = self
            .committed
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for (key, _, share) in staged {
            committed.entry(key).or_insert(share);
        }
    }

    pub fn len(&self) -> usize {
        self.committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.committed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserts_are_visible_after_commit() {
        let cache = PredicateCache::new();
        cache.insert(7, 3, 100);
        assert_eq!(cache.get(7), None);
        cache.commit();
        assert_eq!(cache.get(7), Some(100));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn lowest_operation_wins_regardless_of_insert_order() {
        let cache = PredicateCache::new();
        cache.insert(1, 9, 900);
        cache.insert(1, 2, 200);
        cache.insert(1, 5, 500);
        cache.commit();
        assert_eq!(cache.get(1), Some(200));

        // committed entries are never replaced
        cache.insert(1, 0, 0);
        cache.commit();
        assert_eq!(cache.get(1), Some(200));

        cache.clear();
        assert!(cache.is_empty());
    }
}
