//! Address to pool-size lookup table.
//!
//! Fixed bucket count chosen at creation, no resize and no deletion. A `put`
//! always inserts, so a repeated key shadows the older entry instead of
//! replacing it; `get` returns the newest entry for a key or 0.

/// Chained hash table from a 64-bit pool key to a 16-bit allocation size.
#[derive(Clone, Debug)]
pub struct AddressSizeTable {
    buckets: Box<[Vec<(u64, u16)>]>,
    len: usize,
}

impl AddressSizeTable {
    /// Creates an empty table with `capacity` buckets (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buckets: vec![Vec::new(); capacity].into_boxed_slice(),
            len: 0,
        }
    }

    fn bucket(&self, key: u64) -> usize {
        (key % self.buckets.len() as u64) as usize
    }

    /// Inserts `key -> size`, shadowing any earlier entry for `key`.
    pub fn put(&mut self, key: u64, size: u16) {
        let index = self.bucket(key);
        self.buckets[index].push((key, size));
        self.len += 1;
    }

    /// Returns the most recently inserted size for `key`, or 0.
    pub fn get(&self, key: u64) -> u16 {
        self.buckets[self.bucket(key)]
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, size)| *size)
            .unwrap_or(0)
    }

    /// Number of buckets.
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Number of inserted entries, shadowed ones included.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for AddressSizeTable {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_key_is_zero() {
        let table = AddressSizeTable::new(8);
        assert_eq!(table.get(3), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn latest_put_wins() {
        let mut table = AddressSizeTable::new(4);
        table.put(1, 16);
        table.put(5, 32);
        table.put(1, 64);
        assert_eq!(table.get(1), 64);
        assert_eq!(table.get(5), 32);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn colliding_keys_stay_distinct() {
        let mut table = AddressSizeTable::new(3);
        for key in [0u64, 3, 6, 9] {
            table.put(key, key as u16 + 1);
        }
        for key in [0u64, 3, 6, 9] {
            assert_eq!(table.get(key), key as u16 + 1);
        }
        assert_eq!(table.get(12), 0);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut table = AddressSizeTable::new(0);
        assert_eq!(table.capacity(), 1);
        table.put(u64::MAX, 7);
        assert_eq!(table.get(u64::MAX), 7);
    }

    #[test]
    fn matches_reference_model_for_any_capacity() {
        use std::collections::HashMap;

        // Deterministic pseudo-random sequence of puts.
        let mut seed = 0x2545_f491_4f6c_dd1du64;
        for capacity in 1..20usize {
            let mut table = AddressSizeTable::new(capacity);
            let mut model = HashMap::new();
            for _ in 0..200 {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                let key = seed % 37;
                let size = (seed >> 20) as u16;
                table.put(key, size);
                model.insert(key, size);
            }
            for key in 0..50u64 {
                assert_eq!(table.get(key), model.get(&key).copied().unwrap_or(0));
            }
        }
    }
}
