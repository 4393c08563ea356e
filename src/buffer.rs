//! Fixed-size buffer pool: the in-memory page cache.
//!
//! A fixed array of slots caches pages keyed by (volume handle, page
//! address). Pinning is a counter that blocks eviction; read/write
//! exclusion on the cached image is the slot's RwLock, so a writer
//! excludes every other accessor while read accessors stack. Eviction
//! picks an unpinned slot with the lowest access stamp, preferring free
//! and clean slots; a dirty victim is first journaled (the WAL gate), so
//! no page image ever reaches a volume without a durable journal image.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use log::debug;

use crate::error::{Error, Result};
use crate::journal::Journal;
use crate::page::Page;
use crate::volume::Volume;
use crate::{PageAddr, Ts, VolumeHandle};

/// Pin-acquisition retry interval while the pool is saturated.
const PIN_RETRY: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Clean,
    Dirty,
}

pub struct SlotData {
    pub page: Page,
    vh: VolumeHandle,
    addr: PageAddr,
    state: SlotState,
}

impl SlotData {
    /// Record a mutation: stamp the page with the writing transaction's
    /// timestamp, bump the generation cursors watch, mark dirty.
    pub fn mark_dirty(&mut self, ts: Ts) {
        self.page.set_timestamp(ts);
        self.page.bump_generation();
        self.state = SlotState::Dirty;
    }

    pub fn is_dirty(&self) -> bool {
        self.state == SlotState::Dirty
    }

    pub fn addr(&self) -> PageAddr {
        self.addr
    }

    pub fn volume_handle(&self) -> VolumeHandle {
        self.vh
    }
}

struct Slot {
    data: RwLock<SlotData>,
    pins: AtomicU32,
    access: AtomicU64,
}

/// A pinned page. The pin blocks eviction for the token's lifetime;
/// `read`/`write` take the slot lock for actual access.
pub struct PagePin<'p> {
    pool: &'p BufferPool,
    idx: usize,
}

impl std::fmt::Debug for PagePin<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagePin").field("idx", &self.idx).finish()
    }
}

impl PagePin<'_> {
    pub fn read(&self) -> RwLockReadGuard<'_, SlotData> {
        self.pool.slots[self.idx].data.read().expect("slot lock")
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, SlotData> {
        self.pool.slots[self.idx].data.write().expect("slot lock")
    }
}

impl Drop for PagePin<'_> {
    fn drop(&mut self) {
        self.pool.slots[self.idx].pins.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct BufferPool {
    slots: Vec<Slot>,
    map: Mutex<HashMap<(VolumeHandle, PageAddr), usize>>,
    clock: AtomicU64,
    journal: Arc<Journal>,
    page_size: usize,
}

impl BufferPool {
    pub fn new(page_size: usize, pool_bytes: usize, journal: Arc<Journal>) -> BufferPool {
        let count = (pool_bytes / page_size).max(8);
        let slots = (0..count)
            .map(|_| Slot {
                data: RwLock::new(SlotData {
                    page: Page::from_bytes(vec![0u8; page_size]),
                    vh: 0,
                    addr: 0,
                    state: SlotState::Free,
                }),
                pins: AtomicU32::new(0),
                access: AtomicU64::new(0),
            })
            .collect();
        BufferPool {
            slots,
            map: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(1),
            journal,
            page_size,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn touch(&self, idx: usize) {
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed);
        self.slots[idx].access.store(stamp, Ordering::Relaxed);
    }

    /// Pin the page at (vh, addr), loading it on a miss from the journal
    /// (if a newer image has not been copied back) or from the volume.
    /// `timeout` bounds the wait for an evictable slot; None waits one
    /// bounded internal retry cycle and then fails.
    pub fn get(
        &self,
        volume: &Arc<Volume>,
        vh: VolumeHandle,
        addr: PageAddr,
        _intent: Intent,
        timeout: Option<Duration>,
    ) -> Result<PagePin<'_>> {
        let deadline = Instant::now() + timeout.unwrap_or(Duration::from_millis(2000));
        loop {
            if let Some(idx) = self.lookup(vh, addr) {
                self.slots[idx].pins.fetch_add(1, Ordering::AcqRel);
                {
                    let data = self.slots[idx].data.read().expect("slot lock");
                    if data.state != SlotState::Free && data.vh == vh && data.addr == addr {
                        drop(data);
                        self.touch(idx);
                        return Ok(PagePin { pool: self, idx });
                    }
                }
                // lost a race with eviction; retry.
                self.slots[idx].pins.fetch_sub(1, Ordering::AcqRel);
                continue;
            }

            match self.load(volume, vh, addr) {
                Ok(Some(pin)) => return Ok(pin),
                Ok(None) => {
                    // deadline expiry never grants the pin.
                    if Instant::now() >= deadline {
                        return Err(Error::BufferUnavailable);
                    }
                    std::thread::sleep(PIN_RETRY);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn lookup(&self, vh: VolumeHandle, addr: PageAddr) -> Option<usize> {
        self.map.lock().expect("pool map").get(&(vh, addr)).copied()
    }

    /// Load a missing page into a victim slot. Ok(None) means no victim
    /// was available right now.
    fn load(
        &self,
        volume: &Arc<Volume>,
        vh: VolumeHandle,
        addr: PageAddr,
    ) -> Result<Option<PagePin<'_>>> {
        let Some(idx) = self.claim_victim()? else {
            return Ok(None);
        };
        let mut data = self.slots[idx].data.write().expect("slot lock");

        // The journal may hold a newer image than the volume file.
        let bytes = match self.journal.read_page_image(vh, addr)? {
            Some(image) => image,
            None => volume.read_page(addr)?,
        };
        data.page = Page::from_bytes(bytes);
        data.vh = vh;
        data.addr = addr;
        data.state = SlotState::Clean;

        let mut map = self.map.lock().expect("pool map");
        if map.contains_key(&(vh, addr)) {
            // another thread loaded it first; give the victim back.
            data.state = SlotState::Free;
            drop(map);
            drop(data);
            self.slots[idx].pins.fetch_sub(1, Ordering::AcqRel);
            // loop in get() will find the winner's slot.
            return Ok(None);
        }
        map.insert((vh, addr), idx);
        drop(map);
        drop(data);
        self.touch(idx);
        Ok(Some(PagePin { pool: self, idx }))
    }

    /// Pick, lock and clear an eviction victim, leaving it pinned for
    /// the caller. Prefers free then clean slots by access stamp; falls
    /// back to journaling a dirty one.
    fn claim_victim(&self) -> Result<Option<usize>> {
        let mut best: Option<(usize, u64, SlotState)> = None;
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.pins.load(Ordering::Acquire) != 0 {
                continue;
            }
            let Ok(data) = slot.data.try_read() else { continue };
            let state = data.state;
            drop(data);
            let stamp = slot.access.load(Ordering::Relaxed);
            let better = match &best {
                None => true,
                Some((_, best_stamp, best_state)) => match (state, best_state) {
                    (SlotState::Free, _) => true,
                    (SlotState::Clean, SlotState::Free) => false,
                    (SlotState::Clean, SlotState::Clean) => stamp < *best_stamp,
                    (SlotState::Clean, SlotState::Dirty) => true,
                    (SlotState::Dirty, SlotState::Dirty) => stamp < *best_stamp,
                    (SlotState::Dirty, _) => false,
                },
            };
            if better {
                best = Some((idx, stamp, state));
            }
            if state == SlotState::Free {
                break;
            }
        }
        let Some((idx, _, _)) = best else {
            return Ok(None);
        };

        // Pin before locking; back off if anyone else pinned first.
        if self.slots[idx].pins.fetch_add(1, Ordering::AcqRel) != 0 {
            self.slots[idx].pins.fetch_sub(1, Ordering::AcqRel);
            return Ok(None);
        }
        let Ok(mut data) = self.slots[idx].data.try_write() else {
            self.slots[idx].pins.fetch_sub(1, Ordering::AcqRel);
            return Ok(None);
        };

        if data.state == SlotState::Dirty {
            // WAL gate: the image must be durable in the journal before
            // this slot can be reused (its content would otherwise exist
            // nowhere once evicted).
            debug!("evicting dirty page {}/{}", data.vh, data.addr);
            self.journal
                .append_page_image(data.vh, data.addr, data.page.bytes())?;
            data.state = SlotState::Clean;
        }
        if data.state == SlotState::Clean {
            self.map.lock().expect("pool map").remove(&(data.vh, data.addr));
        }
        data.state = SlotState::Free;
        Ok(Some(idx))
    }

    /// Journal every dirty page with update timestamp ≤ `through_ts`.
    /// Pages stay cached (and clean); copy-back owns the later volume
    /// writes. Returns the number of images appended.
    pub fn flush_dirty(&self, through_ts: Ts) -> Result<usize> {
        let mut flushed = 0usize;
        for slot in &self.slots {
            let candidate = {
                let Ok(data) = slot.data.read() else { continue };
                data.state == SlotState::Dirty && data.page.timestamp() <= through_ts
            };
            if !candidate {
                continue;
            }
            let mut data = slot.data.write().expect("slot lock");
            if data.state != SlotState::Dirty || data.page.timestamp() > through_ts {
                continue;
            }
            self.journal
                .append_page_image(data.vh, data.addr, data.page.bytes())?;
            data.state = SlotState::Clean;
            flushed += 1;
        }
        Ok(flushed)
    }

    /// Drop every cached page of a volume (delete-volume path). Fails
    /// with BufferUnavailable if any of them is pinned.
    pub fn invalidate_volume(&self, vh: VolumeHandle) -> Result<()> {
        for slot in &self.slots {
            let mut data = slot.data.write().expect("slot lock");
            if data.state == SlotState::Free || data.vh != vh {
                continue;
            }
            if slot.pins.load(Ordering::Acquire) != 0 {
                return Err(Error::BufferUnavailable);
            }
            self.map.lock().expect("pool map").remove(&(data.vh, data.addr));
            data.state = SlotState::Free;
        }
        Ok(())
    }

    /// Count of dirty slots (diagnostics and tests).
    pub fn dirty_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| {
                s.data
                    .read()
                    .map(|d| d.state == SlotState::Dirty)
                    .unwrap_or(false)
            })
            .count()
    }
}

#[cfg(test)]
mod test {
    use super::{BufferPool, Intent};
    use crate::journal::Journal;
    use crate::page::PageType;
    use crate::volume::Volume;
    use std::sync::Arc;
    use std::time::Duration;

    const PAGE: usize = 1024;

    fn setup(dir: &std::path::Path, slots: usize) -> (Arc<Volume>, Arc<Journal>, BufferPool) {
        let journal =
            Arc::new(Journal::create(dir, 256 * 1024, Duration::from_millis(1)).unwrap());
        let volume = Arc::new(Volume::create(&dir.join("v.vol"), "v", PAGE).unwrap());
        let pool = BufferPool::new(PAGE, PAGE * slots, Arc::clone(&journal));
        (volume, journal, pool)
    }

    #[test]
    fn test_hit_after_miss() {
        let dir = tempfile::tempdir().unwrap();
        let (volume, journal, pool) = setup(dir.path(), 8);
        let vh = journal.volume_handle(&volume).unwrap();

        {
            let pin = pool.get(&volume, vh, 1, Intent::Write, None).unwrap();
            let mut data = pin.write();
            data.page.init(PageType::Data, 0);
            data.page.insert(b"k", b"v").unwrap();
            data.mark_dirty(9);
        }
        // hit: mutation is visible through the cache.
        let pin = pool.get(&volume, vh, 1, Intent::Read, None).unwrap();
        let data = pin.read();
        let (i, exact) = data.page.find(b"k");
        assert!(exact);
        assert_eq!(data.page.value_at(i), b"v");
        assert_eq!(data.page.timestamp(), 9);
    }

    #[test]
    fn test_flush_journals_dirty_pages() {
        let dir = tempfile::tempdir().unwrap();
        let (volume, journal, pool) = setup(dir.path(), 8);
        let vh = journal.volume_handle(&volume).unwrap();

        for addr in 1..4u64 {
            let pin = pool.get(&volume, vh, addr, Intent::Write, None).unwrap();
            let mut data = pin.write();
            data.page.init(PageType::Data, 0);
            data.page.insert(b"a", b"b").unwrap();
            data.mark_dirty(addr);
        }
        assert_eq!(pool.dirty_count(), 3);
        // bounded flush: only timestamps ≤ 2.
        assert_eq!(pool.flush_dirty(2).unwrap(), 2);
        assert_eq!(pool.dirty_count(), 1);
        assert!(journal.read_page_image(vh, 1).unwrap().is_some());
        assert!(journal.read_page_image(vh, 3).unwrap().is_none());
    }

    #[test]
    fn test_eviction_reloads_from_journal() {
        let dir = tempfile::tempdir().unwrap();
        let (volume, journal, pool) = setup(dir.path(), 8);
        let vh = journal.volume_handle(&volume).unwrap();

        {
            let pin = pool.get(&volume, vh, 1, Intent::Write, None).unwrap();
            let mut data = pin.write();
            data.page.init(PageType::Data, 0);
            data.page.insert(b"k", b"journal image").unwrap();
            data.mark_dirty(5);
        }
        // churn enough distinct pages through the pool to evict page 1;
        // the dirty image must round-trip via the journal, not be lost.
        for addr in 10..30u64 {
            let _ = pool.get(&volume, vh, addr, Intent::Read, None).unwrap();
        }
        let pin = pool.get(&volume, vh, 1, Intent::Read, None).unwrap();
        let data = pin.read();
        let (i, exact) = data.page.find(b"k");
        assert!(exact);
        assert_eq!(data.page.value_at(i), b"journal image");
    }

    #[test]
    fn test_pins_block_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let (volume, journal, pool) = setup(dir.path(), 8);
        let vh = journal.volume_handle(&volume).unwrap();

        // pin every slot, then ask for one more page.
        let pins: Vec<_> = (0..pool.slot_count() as u64)
            .map(|addr| pool.get(&volume, vh, addr + 1, Intent::Read, None).unwrap())
            .collect();
        let err = pool
            .get(&volume, vh, 999, Intent::Read, Some(Duration::from_millis(10)))
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::BufferUnavailable));
        drop(pins);
        assert!(pool.get(&volume, vh, 999, Intent::Read, None).is_ok());
    }
}
