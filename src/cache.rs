//! Slot cache for tiles: fixed buffers, an LRU queue over evictable slots
//! and per-slot locks.
//!
//! The cache itself never touches a file. Loading and eviction go through
//! the [`TileStore`] capability the caller passes into each operation; the
//! map uses this to point eviction at the spill file while writing and at
//! the data file while flushing.

use crate::error::{VoxError, VoxResult};

/// Backing store for cache misses and evictions.
pub trait TileStore {
    /// Fills `buf` with the tile's cells.
    fn load(&mut self, tile_index: usize, buf: &mut [u8]) -> VoxResult<()>;
    /// Persists an evicted tile buffer.
    fn evict(&mut self, tile_index: usize, buf: &[u8]) -> VoxResult<()>;
}

/// A read-only store: evictions are dropped.
pub struct ReadStore<F>(
    /// The loader invoked on cache misses.
    pub F,
);

impl<F: FnMut(usize, &mut [u8]) -> VoxResult<()>> TileStore for ReadStore<F> {
    fn load(&mut self, tile_index: usize, buf: &mut [u8]) -> VoxResult<()> {
        (self.0)(tile_index, buf)
    }

    fn evict(&mut self, _tile_index: usize, _buf: &[u8]) -> VoxResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Holds no tile. Inactive slots sit in the queue so they are reused
    /// before anything live is evicted.
    Inactive,
    Unlocked,
    Locked,
}

/// Direct-map side table from tile index to slot, with a one-entry memo
/// for the common repeated lookup.
struct CacheHash {
    slot_of: Vec<u32>,
    active: Vec<bool>,
    memo: Option<(usize, usize)>,
}

impl CacheHash {
    fn new(nof_names: usize) -> Self {
        Self { slot_of: vec![0; nof_names], active: vec![false; nof_names], memo: None }
    }

    fn reset(&mut self) {
        self.active.fill(false);
        self.memo = None;
    }

    fn get(&mut self, name: usize) -> Option<usize> {
        if let Some((n, slot)) = self.memo {
            if n == name {
                return Some(slot);
            }
        }
        if !self.active[name] {
            return None;
        }
        let slot = self.slot_of[name] as usize;
        self.memo = Some((name, slot));
        Some(slot)
    }

    fn insert(&mut self, name: usize, slot: usize) {
        debug_assert!(!self.active[name]);
        self.slot_of[name] = slot as u32;
        self.active[name] = true;
    }

    fn remove(&mut self, name: usize) {
        debug_assert!(self.active[name]);
        self.active[name] = false;
        if matches!(self.memo, Some((n, _)) if n == name) {
            self.memo = None;
        }
    }
}

/// Outcome of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The slot is pinned.
    Locked,
    /// Locking would starve the queue; the slot stays unlocked.
    Refused,
}

/// Fixed-slot tile cache with LRU eviction and lockable slots.
pub struct TileCache {
    elt_size: usize,
    buffers: Vec<u8>,
    names: Vec<i64>,
    state: Vec<SlotState>,
    next: Vec<i32>,
    prev: Vec<i32>,
    first: i32,
    last: i32,
    nof_unlocked: usize,
    min_unlocked: usize,
    auto_lock: bool,
    hash: CacheHash,
}

impl TileCache {
    /// A cache of `nof_slots` buffers of `elt_size` bytes, addressing tiles
    /// `0..nof_names`.
    #[must_use]
    pub fn new(nof_slots: usize, elt_size: usize, nof_names: usize) -> Self {
        let nof_slots = nof_slots.max(1);
        let mut cache = Self {
            elt_size,
            buffers: vec![0; nof_slots * elt_size],
            names: vec![-1; nof_slots],
            state: vec![SlotState::Inactive; nof_slots],
            next: vec![0; nof_slots],
            prev: vec![0; nof_slots],
            first: 0,
            last: 0,
            nof_unlocked: 0,
            min_unlocked: 1,
            auto_lock: false,
            hash: CacheHash::new(nof_names),
        };
        cache.reset();
        cache
    }

    /// Returns every slot to `Inactive` and rebuilds the queue.
    pub fn reset(&mut self) {
        let n = self.names.len();
        for i in 0..n {
            self.state[i] = SlotState::Inactive;
            self.next[i] = i as i32 + 1;
            self.prev[i] = i as i32 - 1;
            self.names[i] = -1;
        }
        self.next[n - 1] = -1;
        self.first = 0;
        self.last = (n - 1) as i32;
        self.auto_lock = false;
        self.nof_unlocked = n;
        self.min_unlocked = 1;
        self.hash.reset();
    }

    /// Locks slots as they are accessed (while the floor allows).
    pub fn autolock_on(&mut self) {
        self.auto_lock = true;
    }

    /// Back to plain LRU behaviour.
    pub fn autolock_off(&mut self) {
        self.auto_lock = false;
    }

    /// Floor below which the unlocked population may not drop.
    pub fn set_min_unlocked(&mut self, n: usize) {
        self.min_unlocked = n;
    }

    fn is_active(&self, slot: usize) -> bool {
        self.state[slot] != SlotState::Inactive
    }

    fn one_unlocked_only(&self) -> bool {
        self.first == self.last
    }

    fn are_min_unlocked(&self) -> bool {
        self.nof_unlocked <= self.min_unlocked
    }

    fn buf(&self, slot: usize) -> &[u8] {
        &self.buffers[slot * self.elt_size..(slot + 1) * self.elt_size]
    }

    fn buf_mut(&mut self, slot: usize) -> &mut [u8] {
        &mut self.buffers[slot * self.elt_size..(slot + 1) * self.elt_size]
    }

    fn dequeue(&mut self, slot: usize) {
        debug_assert_ne!(self.state[slot], SlotState::Locked);
        let (p, n) = (self.prev[slot], self.next[slot]);
        if slot as i32 == self.first {
            self.first = n;
        }
        if slot as i32 == self.last {
            self.last = p;
        }
        if n != -1 {
            self.prev[n as usize] = p;
        }
        if p != -1 {
            self.next[p as usize] = n;
        }
        self.next[slot] = -1;
        self.prev[slot] = -1;
    }

    fn enqueue_tail(&mut self, slot: usize) {
        self.prev[slot] = self.last;
        self.next[slot] = -1;
        if self.last != -1 {
            self.next[self.last as usize] = slot as i32;
        }
        self.last = slot as i32;
        if self.first == -1 {
            self.first = slot as i32;
        }
    }

    fn enqueue_head(&mut self, slot: usize) {
        self.next[slot] = self.first;
        self.prev[slot] = -1;
        if self.first != -1 {
            self.prev[self.first as usize] = slot as i32;
        }
        self.first = slot as i32;
        if self.last == -1 {
            self.last = slot as i32;
        }
    }

    fn set_locked(&mut self, slot: usize) {
        if self.state[slot] != SlotState::Locked {
            self.nof_unlocked -= 1;
        }
        self.state[slot] = SlotState::Locked;
    }

    fn set_unlocked(&mut self, slot: usize) {
        if self.state[slot] == SlotState::Locked {
            self.nof_unlocked += 1;
        }
        self.state[slot] = SlotState::Unlocked;
    }

    fn set_inactive(&mut self, slot: usize) {
        if self.state[slot] == SlotState::Locked {
            self.nof_unlocked += 1;
        }
        self.state[slot] = SlotState::Inactive;
    }

    fn lock_slot(&mut self, slot: usize) {
        if self.state[slot] == SlotState::Locked {
            return;
        }
        self.dequeue(slot);
        self.set_locked(slot);
    }

    /// Ensures the tile is resident and returns its buffer. On a miss the
    /// LRU head is evicted through `store` first.
    pub fn elt_ptr(
        &mut self,
        name: usize,
        store: &mut dyn TileStore,
    ) -> VoxResult<&mut [u8]> {
        if let Some(slot) = self.hash.get(name) {
            if self.auto_lock
                && self.state[slot] == SlotState::Unlocked
                && !self.one_unlocked_only()
                && !self.are_min_unlocked()
            {
                self.lock_slot(slot);
            }
            return Ok(self.buf_mut(slot));
        }

        if self.first == -1 {
            return Err(VoxError::CacheExhausted);
        }
        let slot = self.first as usize;
        if self.is_active(slot) {
            let old = self.names[slot] as usize;
            self.hash.remove(old);
            let buf_range = slot * self.elt_size..(slot + 1) * self.elt_size;
            store.evict(old, &self.buffers[buf_range])?;
        }

        self.hash.insert(name, slot);
        let do_unlock =
            !self.auto_lock || self.one_unlocked_only() || self.are_min_unlocked();
        self.set_unlocked(slot);
        self.names[slot] = name as i64;
        self.lock_slot(slot);
        if do_unlock {
            self.enqueue_tail(slot);
            self.set_unlocked(slot);
        }

        let elt_size = self.elt_size;
        let buf = &mut self.buffers[slot * elt_size..(slot + 1) * elt_size];
        store.load(name, buf)?;
        Ok(buf)
    }

    /// [`Self::elt_ptr`] without exposing the buffer.
    pub fn load(&mut self, name: usize, store: &mut dyn TileStore) -> VoxResult<()> {
        self.elt_ptr(name, store).map(|_| ())
    }

    /// Copies the tile out of the cache.
    pub fn get(&mut self, name: usize, dst: &mut [u8], store: &mut dyn TileStore) -> VoxResult<()> {
        let buf = self.elt_ptr(name, store)?;
        dst.copy_from_slice(buf);
        Ok(())
    }

    /// Copies a tile into the cache.
    pub fn put(&mut self, name: usize, src: &[u8], store: &mut dyn TileStore) -> VoxResult<()> {
        let buf = self.elt_ptr(name, store)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    /// Pins a resident tile. Refused when it would leave the queue starved.
    pub fn lock(&mut self, name: usize) -> VoxResult<LockOutcome> {
        let slot = self.hash.get(name).ok_or(VoxError::NotInCache(name))?;
        if self.state[slot] == SlotState::Locked {
            return Ok(LockOutcome::Locked);
        }
        if self.one_unlocked_only() || self.are_min_unlocked() {
            return Ok(LockOutcome::Refused);
        }
        self.lock_slot(slot);
        Ok(LockOutcome::Locked)
    }

    /// Requeues a tile at the most-recently-used end.
    pub fn unlock(&mut self, name: usize) -> VoxResult<()> {
        let slot = self.hash.get(name).ok_or(VoxError::NotInCache(name))?;
        if self.state[slot] == SlotState::Unlocked {
            return Ok(());
        }
        self.enqueue_tail(slot);
        self.set_unlocked(slot);
        Ok(())
    }

    /// Locks every unlocked slot. Unlike [`Self::lock`] this bypasses the
    /// starvation floor; the caller promises to unlock again.
    pub fn lock_all(&mut self) {
        for slot in 0..self.names.len() {
            if self.state[slot] == SlotState::Unlocked {
                self.lock_slot(slot);
            }
        }
    }

    /// Requeues every locked slot.
    pub fn unlock_all(&mut self) -> VoxResult<()> {
        for slot in 0..self.names.len() {
            if self.state[slot] == SlotState::Locked {
                self.unlock(self.names[slot] as usize)?;
            }
        }
        Ok(())
    }

    fn drop_slot(
        &mut self,
        name: usize,
        store: Option<&mut dyn TileStore>,
    ) -> VoxResult<()> {
        let slot = self.hash.get(name).ok_or(VoxError::NotInCache(name))?;
        if !self.is_active(slot) {
            return Ok(());
        }
        if self.state[slot] != SlotState::Locked {
            self.dequeue(slot);
            self.set_locked(slot);
        }
        if let Some(store) = store {
            let buf_range = slot * self.elt_size..(slot + 1) * self.elt_size;
            store.evict(name, &self.buffers[buf_range])?;
        }
        self.enqueue_head(slot);
        self.set_inactive(slot);
        self.hash.remove(name);
        Ok(())
    }

    /// Writes the tile back through `store` and frees its slot.
    pub fn flush(&mut self, name: usize, store: &mut dyn TileStore) -> VoxResult<()> {
        self.drop_slot(name, Some(store))
    }

    /// Frees the slot without writing anything back.
    pub fn remove(&mut self, name: usize) -> VoxResult<()> {
        self.drop_slot(name, None)
    }

    /// Writes every active slot back through `store` and frees it.
    pub fn flush_all(&mut self, store: &mut dyn TileStore) -> VoxResult<()> {
        for slot in 0..self.names.len() {
            if self.is_active(slot) {
                self.flush(self.names[slot] as usize, store)?;
            }
        }
        Ok(())
    }

    /// Frees every active slot without writing anything back.
    pub fn remove_all(&mut self) -> VoxResult<()> {
        for slot in 0..self.names.len() {
            if self.is_active(slot) {
                self.remove(self.names[slot] as usize)?;
            }
        }
        Ok(())
    }

    /// Whether the tile is currently resident.
    #[must_use]
    pub fn contains(&mut self, name: usize) -> bool {
        self.hash.get(name).is_some()
    }

    /// Active (tile-holding) slot count.
    #[must_use]
    pub fn n_active(&self) -> usize {
        self.state.iter().filter(|&&s| s != SlotState::Inactive).count()
    }

    /// Slots currently evictable (unlocked or inactive).
    #[must_use]
    pub fn n_unlocked(&self) -> usize {
        self.nof_unlocked
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    /// Store that records evictions and serves loads from a map.
    #[derive(Default)]
    struct MemStore {
        tiles: BTreeMap<usize, Vec<u8>>,
        evictions: Vec<usize>,
    }

    impl TileStore for MemStore {
        fn load(&mut self, tile_index: usize, buf: &mut [u8]) -> VoxResult<()> {
            match self.tiles.get(&tile_index) {
                Some(data) => buf.copy_from_slice(data),
                None => buf.fill(0),
            }
            Ok(())
        }

        fn evict(&mut self, tile_index: usize, buf: &[u8]) -> VoxResult<()> {
            self.evictions.push(tile_index);
            self.tiles.insert(tile_index, buf.to_vec());
            Ok(())
        }
    }

    fn fill(cache: &mut TileCache, store: &mut MemStore, name: usize, byte: u8) {
        cache.elt_ptr(name, store).unwrap().fill(byte);
    }

    #[test]
    fn eviction_is_least_recently_used() {
        let mut cache = TileCache::new(3, 4, 100);
        let mut store = MemStore::default();
        fill(&mut cache, &mut store, 1, 0x11);
        fill(&mut cache, &mut store, 2, 0x22);
        fill(&mut cache, &mut store, 3, 0x33);
        // Touch 1 so 2 becomes the LRU.
        cache.load(1, &mut store).unwrap();
        fill(&mut cache, &mut store, 4, 0x44);
        assert_eq!(store.evictions, vec![2]);
        assert!(!cache.contains(2));
        assert!(cache.contains(1) && cache.contains(3) && cache.contains(4));
    }

    #[test]
    fn evicted_tile_reloads_from_store() {
        let mut cache = TileCache::new(2, 4, 100);
        let mut store = MemStore::default();
        fill(&mut cache, &mut store, 7, 0x77);
        fill(&mut cache, &mut store, 8, 0x88);
        fill(&mut cache, &mut store, 9, 0x99);
        assert!(!cache.contains(7));
        let buf = cache.elt_ptr(7, &mut store).unwrap();
        assert_eq!(buf, [0x77; 4]);
    }

    #[test]
    fn locked_slots_survive_misses() {
        let mut cache = TileCache::new(3, 4, 100);
        let mut store = MemStore::default();
        fill(&mut cache, &mut store, 1, 0x11);
        fill(&mut cache, &mut store, 2, 0x22);
        assert_eq!(cache.lock(1).unwrap(), LockOutcome::Locked);
        for name in 3..8 {
            fill(&mut cache, &mut store, name, name as u8);
        }
        assert!(cache.contains(1));
        assert!(!store.evictions.contains(&1));
    }

    #[test]
    fn lock_refuses_at_min_unlocked_floor() {
        let mut cache = TileCache::new(3, 4, 100);
        let mut store = MemStore::default();
        for name in 0..3 {
            fill(&mut cache, &mut store, name, name as u8);
        }
        assert_eq!(cache.lock(0).unwrap(), LockOutcome::Locked);
        assert_eq!(cache.lock(1).unwrap(), LockOutcome::Locked);
        // One unlocked slot left: the floor refuses further locks.
        assert_eq!(cache.lock(2).unwrap(), LockOutcome::Refused);
        assert_eq!(cache.n_unlocked(), 1);

        cache.unlock(0).unwrap();
        cache.unlock(1).unwrap();
        assert_eq!(cache.n_unlocked(), 3);
    }

    #[test]
    fn flush_all_writes_back_and_clears() {
        let mut cache = TileCache::new(4, 4, 100);
        let mut store = MemStore::default();
        for name in 0..3 {
            fill(&mut cache, &mut store, name, 0xA0 + name as u8);
        }
        cache.flush_all(&mut store).unwrap();
        assert_eq!(cache.n_active(), 0);
        assert_eq!(store.tiles.len(), 3);
        assert_eq!(store.tiles[&2], vec![0xA2; 4]);
    }

    #[test]
    fn remove_discards_without_writeback() {
        let mut cache = TileCache::new(2, 4, 100);
        let mut store = MemStore::default();
        fill(&mut cache, &mut store, 5, 0x55);
        cache.remove(5).unwrap();
        assert!(store.tiles.is_empty());
        assert_eq!(cache.n_active(), 0);
    }

    #[test]
    fn hash_matches_active_slots_after_mixed_ops() {
        let mut cache = TileCache::new(3, 4, 100);
        let mut store = MemStore::default();
        for name in 0..6 {
            fill(&mut cache, &mut store, name, name as u8);
        }
        cache.lock(5).unwrap();
        cache.unlock(5).unwrap();
        cache.flush(4, &mut store).unwrap();

        let resident: Vec<usize> = (0..100).filter(|&n| cache.contains(n)).collect();
        assert_eq!(resident.len(), cache.n_active());
        for name in resident {
            cache.load(name, &mut store).unwrap();
        }
    }

    #[test]
    fn autolock_pins_accessed_tiles() {
        let mut cache = TileCache::new(3, 4, 100);
        let mut store = MemStore::default();
        cache.autolock_on();
        fill(&mut cache, &mut store, 1, 1);
        fill(&mut cache, &mut store, 2, 2);
        fill(&mut cache, &mut store, 3, 3);
        // The floor keeps at least one slot unlocked.
        assert!(cache.n_unlocked() >= 1);
        cache.unlock_all().unwrap();
        assert_eq!(cache.n_unlocked(), 3);
    }

    #[test]
    fn reset_clears_everything() {
        let mut cache = TileCache::new(2, 4, 10);
        let mut store = MemStore::default();
        fill(&mut cache, &mut store, 1, 1);
        cache.reset();
        assert_eq!(cache.n_active(), 0);
        assert!(!cache.contains(1));
        assert_eq!(cache.n_unlocked(), 2);
    }
}
