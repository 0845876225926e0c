//! Write-back LRU block cache.
//!
//! The buffer cache sits between the filesystem and a [`BlockDevice`]. It
//! caches a bounded number of fixed-size blocks, serializes concurrent
//! loads of the same block, and defers writes until eviction or an
//! explicit [`BlockCache::flush`].
//!
//! Interface:
//! * To get a block, call [`BlockCache::get`]; it returns a [`CacheHandle`].
//! * After changing the block's data, call [`CacheHandle::mark_dirty`].
//! * Dropping the handle releases the block. Do not keep a handle longer
//!   than necessary; a pinned block cannot be evicted.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use log::trace;

use crate::device::BlockDevice;
use crate::error::{KernelError, Result};
use crate::param::{BSIZE, NBUF};

struct Slot {
    pos: u64,
    valid: bool,
    dirty: bool,
    loading: bool,
    refcnt: usize,
    prev: Option<usize>,
    next: Option<usize>,
    data: Arc<Mutex<[u8; BSIZE]>>,
}

impl Slot {
    fn new() -> Self {
        Slot {
            pos: 0,
            valid: false,
            dirty: false,
            loading: false,
            refcnt: 0,
            prev: None,
            next: None,
            data: Arc::new(Mutex::new([0u8; BSIZE])),
        }
    }
}

struct Inner {
    slots: Vec<Slot>,
    /// Most-recently-used end of the LRU list.
    head: Option<usize>,
    /// Least-recently-used end of the LRU list.
    tail: Option<usize>,
}

impl Inner {
    fn unlink(&mut self, id: usize) {
        let prev = self.slots[id].prev;
        let next = self.slots[id].next;
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
        self.slots[id].prev = None;
        self.slots[id].next = None;
    }

    fn push_front(&mut self, id: usize) {
        self.slots[id].prev = None;
        self.slots[id].next = self.head;
        if let Some(h) = self.head {
            self.slots[h].prev = Some(id);
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
    }

    fn move_to_front(&mut self, id: usize) {
        self.unlink(id);
        self.push_front(id);
    }

    fn find(&self, pos: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| (s.valid || s.loading) && s.pos == pos)
    }

    fn find_free(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| !s.valid && !s.loading && s.refcnt == 0)
    }

    /// Walks the LRU list from the tail looking for the first evictable
    /// slot (valid, unpinned, not mid-load).
    fn find_victim(&self) -> Option<usize> {
        let mut cur = self.tail;
        while let Some(id) = cur {
            let slot = &self.slots[id];
            if slot.valid && slot.refcnt == 0 && !slot.loading {
                return Some(id);
            }
            cur = slot.prev;
        }
        None
    }
}

/// A bounded, write-back cache of fixed-size blocks backed by a
/// [`BlockDevice`].
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl BlockCache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slots = (0..NBUF).map(|_| Slot::new()).collect();
        BlockCache {
            device,
            inner: Mutex::new(Inner {
                slots,
                head: None,
                tail: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Fetches (loading from the device if necessary) the block at byte
    /// offset `pos`, which must be a multiple of the block size.
    pub fn get(self: &Arc<Self>, pos: u64) -> Result<CacheHandle> {
        if pos as usize % BSIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }

        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(id) = guard.find(pos) {
                if guard.slots[id].loading {
                    guard = self.cond.wait(guard).unwrap();
                    continue;
                }
                guard.slots[id].refcnt += 1;
                guard.move_to_front(id);
                let data = guard.slots[id].data.clone();
                return Ok(CacheHandle {
                    cache: self.clone(),
                    slot: id,
                    data,
                });
            }

            let id = match guard.find_free() {
                Some(id) => id,
                None => match guard.find_victim() {
                    Some(victim) => {
                        guard = self.evict(guard, victim)?;
                        continue;
                    }
                    None => {
                        guard = self.cond.wait(guard).unwrap();
                        continue;
                    }
                },
            };

            guard.slots[id].pos = pos;
            guard.slots[id].loading = true;
            guard.slots[id].refcnt = 1;
            let data = guard.slots[id].data.clone();
            drop(guard);

            let fetch_result = {
                let mut buf = data.lock().unwrap();
                self.device.fetch(pos, &mut buf[..])
            };

            guard = self.inner.lock().unwrap();
            match fetch_result {
                Ok(_) => {
                    guard.slots[id].valid = true;
                    guard.slots[id].loading = false;
                    guard.push_front(id);
                    self.cond.notify_all();
                    return Ok(CacheHandle {
                        cache: self.clone(),
                        slot: id,
                        data,
                    });
                }
                Err(e) => {
                    guard.slots[id].loading = false;
                    guard.slots[id].refcnt = 0;
                    self.cond.notify_all();
                    return Err(e);
                }
            }
        }
    }

    /// Evicts `victim`, writing it back first if dirty. Re-locks and
    /// returns the guard on both success and failure so the caller can
    /// keep looping.
    fn evict<'a>(
        &'a self,
        mut guard: MutexGuard<'a, Inner>,
        victim: usize,
    ) -> Result<MutexGuard<'a, Inner>> {
        guard.unlink(victim);
        guard.slots[victim].loading = true;
        let was_dirty = guard.slots[victim].dirty;
        let pos = guard.slots[victim].pos;
        let data = guard.slots[victim].data.clone();
        guard.slots[victim].valid = false;
        guard.slots[victim].dirty = false;
        drop(guard);

        let result = if was_dirty {
            let buf = data.lock().unwrap();
            trace!("cache: writing back block at {pos}");
            self.device.store(pos, &buf[..])
        } else {
            Ok(0)
        };

        let mut guard = self.inner.lock().unwrap();
        guard.slots[victim].loading = false;
        self.cond.notify_all();
        result.map(|_| guard)
    }

    /// Writes back every dirty block. Returns the first I/O error
    /// encountered, if any, after attempting every slot.
    pub fn flush(&self) -> Result<()> {
        let mut first_err = None;

        for id in 0..NBUF {
            let mut guard = self.inner.lock().unwrap();
            loop {
                if !(guard.slots[id].valid && guard.slots[id].dirty) || guard.slots[id].loading {
                    break;
                }
                if guard.slots[id].refcnt > 0 {
                    guard = self.cond.wait(guard).unwrap();
                    continue;
                }
                guard.slots[id].loading = true;
                let pos = guard.slots[id].pos;
                let data = guard.slots[id].data.clone();
                drop(guard);

                let result = {
                    let buf = data.lock().unwrap();
                    self.device.store(pos, &buf[..])
                };

                guard = self.inner.lock().unwrap();
                guard.slots[id].loading = false;
                match result {
                    Ok(_) => guard.slots[id].dirty = false,
                    Err(e) => first_err = Some(e),
                }
                self.cond.notify_all();
                break;
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn release(&self, slot: usize, dirty: bool) {
        let mut guard = self.inner.lock().unwrap();
        if dirty {
            guard.slots[slot].dirty = true;
        }
        assert!(guard.slots[slot].refcnt > 0, "release of unpinned block");
        guard.slots[slot].refcnt -= 1;
        self.cond.notify_all();
    }
}

/// RAII guard returned by [`BlockCache::get`]. The block is pinned
/// (unevictable) for as long as the handle is alive; dropping it releases
/// the pin. Call [`mark_dirty`](CacheHandle::mark_dirty) before dropping
/// if the contents were changed.
pub struct CacheHandle {
    cache: Arc<BlockCache>,
    slot: usize,
    data: Arc<Mutex<[u8; BSIZE]>>,
    // set by `mark_dirty`; applied to the slot metadata on drop.
}

impl CacheHandle {
    pub fn mark_dirty(&mut self) {
        let mut guard = self.cache.inner.lock().unwrap();
        guard.slots[self.slot].dirty = true;
    }

    pub fn data(&self) -> MutexGuard<'_, [u8; BSIZE]> {
        self.data.lock().unwrap()
    }

    pub fn data_mut(&mut self) -> MutexGuard<'_, [u8; BSIZE]> {
        self.data.lock().unwrap()
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        self.cache.release(self.slot, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MemDevice {
        data: Mutex<Vec<u8>>,
        fetches: AtomicUsize,
    }

    impl MemDevice {
        fn new(blocks: usize) -> Self {
            MemDevice {
                data: Mutex::new(vec![0u8; blocks * BSIZE]),
                fetches: AtomicUsize::new(0),
            }
        }
    }

    impl BlockDevice for MemDevice {
        fn block_size(&self) -> usize {
            BSIZE
        }
        fn open(&self) -> Result<()> {
            Ok(())
        }
        fn close(&self) -> Result<()> {
            Ok(())
        }
        fn fetch(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let data = self.data.lock().unwrap();
            let start = pos as usize;
            buf.copy_from_slice(&data[start..start + buf.len()]);
            Ok(buf.len())
        }
        fn store(&self, pos: u64, buf: &[u8]) -> Result<usize> {
            let mut data = self.data.lock().unwrap();
            let start = pos as usize;
            data[start..start + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }
        fn control(&self, _op: crate::device::ControlOp, arg: &mut u64) -> Result<()> {
            *arg = (self.data.lock().unwrap().len()) as u64;
            Ok(())
        }
    }

    #[test]
    fn hit_does_not_refetch() {
        let dev = Arc::new(MemDevice::new(4));
        let cache = Arc::new(BlockCache::new(dev.clone() as Arc<dyn BlockDevice>));

        drop(cache.get(0).unwrap());
        drop(cache.get(0).unwrap());

        assert_eq!(dev.fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn write_then_flush_persists() {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(4));
        let cache = Arc::new(BlockCache::new(dev));

        {
            let mut h = cache.get(BSIZE as u64).unwrap();
            h.data_mut()[0] = 0xAB;
            h.mark_dirty();
        }
        cache.flush().unwrap();

        let h = cache.get(BSIZE as u64).unwrap();
        assert_eq!(h.data()[0], 0xAB);
    }

    #[test]
    fn eviction_respects_pins() {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(NBUF + 4));
        let cache = Arc::new(BlockCache::new(dev));

        let pinned = cache.get(0).unwrap();
        for i in 1..NBUF {
            let h = cache.get((i * BSIZE) as u64).unwrap();
            drop(h);
        }
        // block 0 is still pinned, so it must still be resident
        assert_eq!(pinned.data()[0], 0);
    }

    #[test]
    fn flush_with_nothing_dirty_is_a_noop() {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(4));
        let cache = Arc::new(BlockCache::new(dev));
        cache.flush().unwrap();
    }
}
