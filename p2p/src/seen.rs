//! Bounded broadcast deduplication.
//!
//! Hashes live in two generations. When the current generation passes its
//! capacity it becomes the previous one and the old previous generation is
//! dropped, so at most `2 * capacity` hashes are held and a hash is
//! remembered for at least `capacity` later insertions.

use std::collections::HashSet;

use halcyon_primitives::Hash;

#[derive(Debug)]
pub struct SeenSet {
    capacity: usize,
    current: HashSet<Hash>,
    previous: HashSet<Hash>,
}

impl SeenSet {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            current: HashSet::new(),
            previous: HashSet::new(),
        }
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.current.contains(hash) || self.previous.contains(hash)
    }

    /// Record `hash`. Returns `true` if it was not already remembered.
    pub fn insert(&mut self, hash: Hash) -> bool {
        if self.contains(&hash) {
            return false;
        }
        self.current.insert(hash);
        if self.current.len() > self.capacity {
            std::mem::swap(&mut self.current, &mut self.previous);
            self.current.clear();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.current.len() + self.previous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.current.clear();
        self.previous.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u32) -> Hash {
        let mut h = [0u8; 32];
        h[..4].copy_from_slice(&n.to_be_bytes());
        h
    }

    #[test]
    fn test_insert_reports_new_hashes_once() {
        let mut seen = SeenSet::new(4);
        assert!(seen.insert(hash(1)));
        assert!(!seen.insert(hash(1)));
        assert!(seen.contains(&hash(1)));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_size_stays_bounded() {
        let mut seen = SeenSet::new(100);
        for n in 0..10_000 {
            seen.insert(hash(n));
            assert!(seen.len() <= 2 * 100 + 1);
        }
        // The most recent hashes are still remembered; the oldest are not.
        assert!(seen.contains(&hash(9_999)));
        assert!(seen.contains(&hash(9_900)));
        assert!(!seen.contains(&hash(0)));
    }

    #[test]
    fn test_rotation_keeps_previous_generation() {
        let mut seen = SeenSet::new(2);
        seen.insert(hash(1));
        seen.insert(hash(2));
        // Third insert rotates: 1, 2, 3 move to the previous generation.
        seen.insert(hash(3));
        assert!(seen.contains(&hash(1)));
        assert!(!seen.insert(hash(2)));
        seen.insert(hash(4));
        seen.insert(hash(5));
        seen.insert(hash(6));
        assert!(!seen.contains(&hash(1)));
        assert!(seen.contains(&hash(6)));
    }

    #[test]
    fn test_clear() {
        let mut seen = SeenSet::new(0);
        seen.insert(hash(1));
        seen.clear();
        assert!(seen.is_empty());
        assert!(seen.insert(hash(1)));
    }
}
