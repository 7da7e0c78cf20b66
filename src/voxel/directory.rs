//! Block hash directory - concurrent map from block keys to pool slots.
//!
//! Layout:
//! - `bucket_count` buckets of `bucket_size` inline entries
//! - a shared side array of overflow nodes, linked per bucket
//!
//! Entries only move EMPTY -> key while the directory is shared; clearing
//! an entry needs `&mut self`. Together with the insert protocol below
//! this keeps at most one entry per key:
//!
//! 1. look the key up; if present, return its slot
//! 2. acquire a pool slot before racing for an entry
//! 3. walk the chain and CAS the first EMPTY key word to our key; a CAS
//!    that observes our key means another thread won, so our slot goes
//!    back to the pool and the winner's slot is returned
//! 4. when the chain is full, CAS-link a fresh overflow node to its tail
//!
//! The winner publishes the slot right after its key CAS; readers that see
//! the key before the slot spin until it lands.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use rayon::prelude::*;

use crate::core::config::VolumeConfig;
use crate::core::error::Error;
use crate::core::types::Result;
use super::block::BlockKey;
use super::free_list::{FreeList, NIL};
use super::pool::{SlotIndex, VoxelBlockPool};

const EMPTY_KEY: u64 = u64::MAX;
const UNBOUND: SlotIndex = u32::MAX;

/// Outcome of a successful insert
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Insertion {
    /// The key was new; this call bound it to the slot
    Inserted(SlotIndex),
    /// The key was already present (or another caller won the race)
    Existing(SlotIndex),
}

impl Insertion {
    pub fn slot(self) -> SlotIndex {
        match self {
            Insertion::Inserted(slot) | Insertion::Existing(slot) => slot,
        }
    }

    pub fn is_new(self) -> bool {
        matches!(self, Insertion::Inserted(_))
    }
}

enum Claim {
    Won,
    Lost(SlotIndex),
}

struct HashEntry {
    key: AtomicU64,
    slot: AtomicU32,
}

impl HashEntry {
    fn vacant() -> Self {
        Self {
            key: AtomicU64::new(EMPTY_KEY),
            slot: AtomicU32::new(UNBOUND),
        }
    }

    fn vacate(&mut self) {
        *self.key.get_mut() = EMPTY_KEY;
        *self.slot.get_mut() = UNBOUND;
    }

    /// Slot of a claimed entry
    fn wait_slot(&self) -> SlotIndex {
        loop {
            let slot = self.slot.load(Ordering::Acquire);
            if slot != UNBOUND {
                return slot;
            }
            std::hint::spin_loop();
        }
    }

    fn snapshot(&self) -> Option<(BlockKey, SlotIndex)> {
        let key = self.key.load(Ordering::Acquire);
        (key != EMPTY_KEY).then(|| (BlockKey::unpack(key), self.wait_slot()))
    }
}

struct OverflowNode {
    entry: HashEntry,
    next: AtomicU32,
}

/// Fixed-capacity concurrent hash map `BlockKey -> SlotIndex`
pub struct BlockHashDirectory {
    bucket_size: usize,
    max_chain_len: usize,
    /// Inline entries, `bucket_size` per bucket
    entries: Box<[HashEntry]>,
    /// First overflow node of each bucket (or NIL)
    chain_heads: Box<[AtomicU32]>,
    overflow: Box<[OverflowNode]>,
    overflow_free: FreeList,
    len: AtomicUsize,
}

impl BlockHashDirectory {
    pub fn new(bucket_count: usize, bucket_size: usize, max_chain_len: usize, overflow_capacity: usize) -> Self {
        assert!(bucket_count > 0 && bucket_size > 0, "directory needs at least one entry per bucket");
        Self {
            bucket_size,
            max_chain_len,
            entries: (0..bucket_count * bucket_size).map(|_| HashEntry::vacant()).collect(),
            chain_heads: (0..bucket_count).map(|_| AtomicU32::new(NIL)).collect(),
            overflow: (0..overflow_capacity)
                .map(|_| OverflowNode { entry: HashEntry::vacant(), next: AtomicU32::new(NIL) })
                .collect(),
            overflow_free: FreeList::full(overflow_capacity),
            len: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &VolumeConfig) -> Self {
        Self::new(config.bucket_count, config.bucket_size, config.max_chain_len, config.overflow_capacity)
    }

    /// Bytes a directory with this config occupies
    pub fn required_bytes(config: &VolumeConfig) -> u64 {
        let inline = config.bucket_count * config.bucket_size * std::mem::size_of::<HashEntry>();
        let heads = config.bucket_count * std::mem::size_of::<AtomicU32>();
        let overflow = config.overflow_capacity
            * (std::mem::size_of::<OverflowNode>() + std::mem::size_of::<AtomicU32>());
        (inline + heads + overflow) as u64
    }

    pub fn bucket_count(&self) -> usize {
        self.chain_heads.len()
    }

    /// Total entries, inline plus overflow
    pub fn capacity(&self) -> usize {
        self.entries.len() + self.overflow.len()
    }

    /// Number of keys stored
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overflow nodes linked into some chain
    pub fn overflow_in_use(&self) -> usize {
        self.overflow_free.capacity() - self.overflow_free.len()
    }

    /// Fraction of entries holding a key
    pub fn load_factor(&self) -> f32 {
        self.len() as f32 / self.capacity().max(1) as f32
    }

    fn bucket_of(&self, key: &BlockKey) -> usize {
        (key.spatial_hash() % self.bucket_count() as u64) as usize
    }

    /// Inline entries then overflow chain of one bucket
    fn chain(&self, bucket: usize) -> impl Iterator<Item = &HashEntry> + '_ {
        let start = bucket * self.bucket_size;
        let inline = self.entries[start..start + self.bucket_size].iter();
        let first = Some(self.chain_heads[bucket].load(Ordering::Acquire)).filter(|&n| n != NIL);
        let overflow = std::iter::successors(first, move |&n| {
            Some(self.overflow[n as usize].next.load(Ordering::Acquire)).filter(|&n| n != NIL)
        })
        .map(move |n| &self.overflow[n as usize].entry);
        inline.chain(overflow)
    }

    /// Slot bound to `key`, if any
    pub fn find(&self, key: BlockKey) -> Option<SlotIndex> {
        let packed = key.pack()?;
        self.chain(self.bucket_of(&key))
            .find(|entry| entry.key.load(Ordering::Acquire) == packed)
            .map(HashEntry::wait_slot)
    }

    pub fn contains(&self, key: BlockKey) -> bool {
        self.find(key).is_some()
    }

    /// Insert `key`, binding it to a slot from `pool`. Idempotent.
    ///
    /// Safe to call from many threads at once. On error no entry is
    /// claimed and no slot leaks.
    pub fn insert(&self, key: BlockKey, pool: &VoxelBlockPool) -> Result<Insertion> {
        let packed = key.pack().ok_or_else(|| Error::CapacityExceeded {
            key,
            reason: "key outside the representable block range".to_string(),
        })?;

        if let Some(slot) = self.find(key) {
            return Ok(Insertion::Existing(slot));
        }

        let slot = pool.acquire()?;
        match self.claim(key, packed, slot) {
            Ok(Claim::Won) => Ok(Insertion::Inserted(slot)),
            Ok(Claim::Lost(winner)) => {
                pool.release(slot);
                Ok(Insertion::Existing(winner))
            }
            Err(e) => {
                pool.release(slot);
                Err(e)
            }
        }
    }

    fn try_claim(&self, entry: &HashEntry, packed: u64, slot: SlotIndex) -> Option<Claim> {
        match entry.key.compare_exchange(EMPTY_KEY, packed, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                entry.slot.store(slot, Ordering::Release);
                self.len.fetch_add(1, Ordering::AcqRel);
                Some(Claim::Won)
            }
            Err(current) if current == packed => Some(Claim::Lost(entry.wait_slot())),
            Err(_) => None,
        }
    }

    fn claim(&self, key: BlockKey, packed: u64, slot: SlotIndex) -> Result<Claim> {
        let bucket = self.bucket_of(&key);
        let start = bucket * self.bucket_size;
        for entry in &self.entries[start..start + self.bucket_size] {
            if let Some(claim) = self.try_claim(entry, packed, slot) {
                return Ok(claim);
            }
        }

        let mut link = &self.chain_heads[bucket];
        let mut depth = 0;
        loop {
            let mut node = link.load(Ordering::Acquire);
            if node == NIL {
                if depth >= self.max_chain_len {
                    log::warn!("Bucket {} chain reached its limit of {} overflow nodes", bucket, self.max_chain_len);
                    return Err(Error::CapacityExceeded {
                        key,
                        reason: format!("bucket chain longer than {}", self.max_chain_len),
                    });
                }
                let fresh = self.overflow_free.pop().ok_or_else(|| Error::CapacityExceeded {
                    key,
                    reason: format!("all {} overflow nodes in use", self.overflow.len()),
                })?;
                match link.compare_exchange(NIL, fresh, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => node = fresh,
                    Err(actual) => {
                        // Another thread extended the chain first; the
                        // unlinked node is still pristine
                        self.overflow_free.push(fresh);
                        node = actual;
                    }
                }
            }

            let overflow = &self.overflow[node as usize];
            if let Some(claim) = self.try_claim(&overflow.entry, packed, slot) {
                return Ok(claim);
            }
            link = &overflow.next;
            depth += 1;
        }
    }

    /// Unbind `key`, returning the slot it owned. The caller returns the
    /// slot to the pool. Overflow nodes stay linked and are reused.
    pub fn remove(&mut self, key: BlockKey) -> Option<SlotIndex> {
        let packed = key.pack()?;
        let bucket = self.bucket_of(&key);
        let start = bucket * self.bucket_size;

        let mut found: Option<&mut HashEntry> = self.entries[start..start + self.bucket_size]
            .iter_mut()
            .find(|entry| entry.key.load(Ordering::Relaxed) == packed);

        if found.is_none() {
            let mut node = *self.chain_heads[bucket].get_mut();
            while node != NIL {
                let overflow = &self.overflow[node as usize];
                if overflow.entry.key.load(Ordering::Relaxed) == packed {
                    break;
                }
                node = overflow.next.load(Ordering::Relaxed);
            }
            if node != NIL {
                found = Some(&mut self.overflow[node as usize].entry);
            }
        }

        let entry = found?;
        let slot = *entry.slot.get_mut();
        entry.vacate();
        *self.len.get_mut() -= 1;
        Some(slot)
    }

    /// Drop every key and unlink every overflow node.
    pub fn clear(&mut self) {
        self.entries.par_iter_mut().for_each(HashEntry::vacate);
        self.chain_heads.par_iter_mut().for_each(|head| *head.get_mut() = NIL);
        self.overflow.par_iter_mut().for_each(|node| {
            node.entry.vacate();
            *node.next.get_mut() = NIL;
        });
        self.overflow_free.refill();
        *self.len.get_mut() = 0;
    }

    /// Every `(key, slot)` pair, in no particular order
    pub fn entries(&self) -> Vec<(BlockKey, SlotIndex)> {
        let inline = self.entries.par_iter().filter_map(HashEntry::snapshot);
        let overflow = self.overflow.par_iter().filter_map(|node| node.entry.snapshot());
        inline.chain(overflow).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const BUDGET: u64 = 1 << 30;

    fn small_pool(capacity: usize) -> VoxelBlockPool {
        VoxelBlockPool::new(capacity, BUDGET).unwrap()
    }

    #[test]
    fn test_insert_and_find() {
        let dir = BlockHashDirectory::new(16, 2, 4, 16);
        let pool = small_pool(8);
        let key = BlockKey::new(1, -2, 3);

        assert_eq!(dir.find(key), None);
        let slot = dir.insert(key, &pool).unwrap();
        assert!(slot.is_new());
        assert_eq!(dir.find(key), Some(slot.slot()));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_sequential_insert_is_idempotent() {
        let dir = BlockHashDirectory::new(16, 2, 4, 16);
        let pool = small_pool(8);
        let key = BlockKey::new(5, 5, 5);

        let first = dir.insert(key, &pool).unwrap();
        for _ in 0..10 {
            let again = dir.insert(key, &pool).unwrap();
            assert_eq!(again, Insertion::Existing(first.slot()));
        }
        assert_eq!(dir.len(), 1);
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn test_concurrent_insert_same_key_one_winner() {
        let dir = BlockHashDirectory::new(4, 1, 8, 32);
        let pool = small_pool(256);
        let key = BlockKey::new(-7, 3, 11);

        let results: Vec<Insertion> = (0..2000)
            .into_par_iter()
            .map(|_| dir.insert(key, &pool).unwrap())
            .collect();

        let winners = results.iter().filter(|r| r.is_new()).count();
        assert_eq!(winners, 1);
        let slots: HashSet<SlotIndex> = results.iter().map(|r| r.slot()).collect();
        assert_eq!(slots.len(), 1);
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.entries().len(), 1);
        // Losers returned their slots
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn test_concurrent_colliding_keys_get_distinct_slots() {
        // One bucket forces every key through the same chain
        let dir = BlockHashDirectory::new(1, 2, 64, 64);
        let pool = small_pool(512);
        let keys: Vec<BlockKey> = (0..40).map(|i| BlockKey::new(i, -i, i * 2)).collect();

        keys.par_iter()
            .flat_map(|k| vec![*k; 8])
            .for_each(|k| {
                dir.insert(k, &pool).unwrap();
            });

        let entries = dir.entries();
        assert_eq!(entries.len(), 40);
        let slots: HashSet<SlotIndex> = entries.iter().map(|(_, s)| *s).collect();
        assert_eq!(slots.len(), 40, "slot aliasing between entries");
        let stored: HashSet<BlockKey> = entries.iter().map(|(k, _)| *k).collect();
        assert_eq!(stored, keys.iter().copied().collect());
        assert_eq!(pool.in_use(), 40);
    }

    #[test]
    fn test_chain_limit_reports_capacity_exceeded() {
        let dir = BlockHashDirectory::new(1, 1, 1, 8);
        let pool = small_pool(8);

        dir.insert(BlockKey::new(0, 0, 0), &pool).unwrap();
        dir.insert(BlockKey::new(1, 0, 0), &pool).unwrap();
        let err = dir.insert(BlockKey::new(2, 0, 0), &pool).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { .. }));

        assert_eq!(dir.len(), 2);
        assert_eq!(pool.in_use(), 2, "failed insert leaked a slot");
        assert!(!dir.contains(BlockKey::new(2, 0, 0)));
    }

    #[test]
    fn test_overflow_exhaustion_reports_capacity_exceeded() {
        let dir = BlockHashDirectory::new(1, 1, 16, 1);
        let pool = small_pool(8);

        dir.insert(BlockKey::new(0, 0, 0), &pool).unwrap();
        dir.insert(BlockKey::new(0, 1, 0), &pool).unwrap();
        assert!(matches!(
            dir.insert(BlockKey::new(0, 2, 0), &pool),
            Err(Error::CapacityExceeded { .. })
        ));
        assert_eq!(dir.overflow_in_use(), 1);
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn test_empty_pool_reports_out_of_memory() {
        let dir = BlockHashDirectory::new(8, 2, 2, 8);
        let pool = small_pool(0);
        assert!(matches!(dir.insert(BlockKey::new(0, 0, 0), &pool), Err(Error::OutOfMemory(_))));
        assert!(dir.is_empty());
    }

    #[test]
    fn test_remove_then_reinsert_reuses_hole() {
        let mut dir = BlockHashDirectory::new(1, 1, 4, 4);
        let pool = small_pool(8);
        let a = BlockKey::new(0, 0, 0);
        let b = BlockKey::new(1, 1, 1);
        let c = BlockKey::new(2, 2, 2);

        dir.insert(a, &pool).unwrap();
        let slot_b = dir.insert(b, &pool).unwrap().slot();
        assert_eq!(dir.overflow_in_use(), 1);

        assert_eq!(dir.remove(b), Some(slot_b));
        assert_eq!(dir.remove(b), None);
        assert!(!dir.contains(b));
        assert!(dir.contains(a));

        // c lands in the vacated overflow node instead of a new one
        dir.insert(c, &pool).unwrap();
        assert_eq!(dir.overflow_in_use(), 1);
        assert_eq!(dir.len(), 2);

        // Inline entries unbind too, leaving the overflow chain reachable
        let slot_a = dir.find(a).unwrap();
        assert_eq!(dir.remove(a), Some(slot_a));
        assert!(!dir.contains(a));
        assert!(dir.contains(c));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_clear() {
        let mut dir = BlockHashDirectory::new(2, 1, 4, 4);
        let pool = small_pool(8);
        for i in 0..5 {
            dir.insert(BlockKey::new(i, 0, 0), &pool).unwrap();
        }
        dir.clear();
        assert!(dir.is_empty());
        assert!(dir.entries().is_empty());
        assert_eq!(dir.overflow_in_use(), 0);
        assert_eq!(dir.find(BlockKey::new(0, 0, 0)), None);
    }

    #[test]
    fn test_out_of_range_key() {
        let dir = BlockHashDirectory::new(2, 1, 1, 1);
        let pool = small_pool(1);
        let far = BlockKey::new(crate::voxel::block::KEY_LIMIT, 0, 0);
        assert!(dir.insert(far, &pool).is_err());
        assert_eq!(dir.find(far), None);
        assert_eq!(pool.in_use(), 0);
    }
}
