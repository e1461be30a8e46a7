//! Per-block reader/writer latches.
//!
//! The latch table lives inside the mapped superblock region, so every
//! process that opens the same file operates on the same entries with
//! atomics. A latch exists only while some process has it pinned; idle
//! entries (pin count zero) sit on a doubly linked idle list in
//! least-recently-idled order and are reclaimed from its tail when a
//! new block needs an entry.
//!
//! Interface:
//! * `pin` locates or installs the entry for a block, pins it, and
//!   acquires the requested mode. Readers share; a writer is exclusive.
//! * `upgrade` converts a held read latch to a write latch, failing if
//!   any other reader is present. The caller must then drop the latch
//!   and restart its operation.
//! * `unpin` releases the held mode and the pin.
//!
//! Waits are busy loops with `spin_loop` and `yield_now` back-off;
//! there is no kernel sleep. A process that dies while holding a latch
//! leaves the block unrecoverable without external repair.

use std::hint::spin_loop;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;

use static_assertions::const_assert_eq;

use crate::error::{Error, Result};
use crate::stat::StatCounters;
use crate::superblock::LATCH_REGION_OFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LatchMode {
    Read,
    Write,
}

/// Block tag of an unused entry. Block 0 is a legal latch target (the
/// superblock is latched like any other block), so the empty tag must
/// live outside the 48-bit range.
const EMPTY: u64 = u64::MAX;

/// Writer bit of the lock word; readers count in units of `READER`.
const WRITER: u32 = 1;
const READER: u32 = 2;

#[repr(C)]
pub(crate) struct Latch {
    /// Latched block number, or `EMPTY`.
    block: AtomicU64,
    /// `WRITER` bit plus reader count above it.
    lock: AtomicU32,
    /// Pins keep the entry resident; eviction needs zero.
    pin: AtomicU32,
    /// Hash chain, 1-based entry index, 0 ends the chain.
    hash_next: AtomicU32,
    /// Idle list links, 1-based, valid while the entry is unpinned.
    idle_prev: AtomicU32,
    idle_next: AtomicU32,
    _pad: u32,
}

const_assert_eq!(size_of::<Latch>(), 32);

#[repr(C)]
struct TableHeader {
    /// Spin word guarding the chains, the idle list, and pin counts
    /// crossing zero.
    lock: AtomicU32,
    idle_head: AtomicU32,
    idle_tail: AtomicU32,
    _pad: u32,
}

const_assert_eq!(size_of::<TableHeader>(), 16);

const BUCKETS_OFF: usize = size_of::<TableHeader>();

fn entries_off(capacity: u32) -> usize {
    (BUCKETS_OFF + 4 * capacity as usize + 7) & !7
}

/// Bytes of superblock region the table needs.
pub(crate) fn region_len(capacity: u32) -> usize {
    entries_off(capacity) + size_of::<Latch>() * capacity as usize
}

/// Whether a table of `capacity` entries fits inside block 0.
pub(crate) fn table_fits(node_bits: u32, capacity: u32) -> bool {
    capacity >= 1 && LATCH_REGION_OFF + region_len(capacity) <= 1usize << node_bits
}

/// The shared table, addressed through the superblock mapping.
pub(crate) struct LatchTable {
    hdr: *const TableHeader,
    buckets: *const AtomicU32,
    entries: *const Latch,
    capacity: u32,
}

// SAFETY: every field behind the pointers is atomic and the protocol
// below serializes structural changes under the table spin word.
unsafe impl Send for LatchTable {}
unsafe impl Sync for LatchTable {}

impl LatchTable {
    /// # Safety
    ///
    /// `region` must point at a formatted latch region of `capacity`
    /// entries, 8-aligned, valid for the lifetime of the table.
    pub(crate) unsafe fn new(region: *mut u8, capacity: u32) -> LatchTable {
        debug_assert_eq!(region as usize % 8, 0);
        LatchTable {
            hdr: region as *const TableHeader,
            buckets: unsafe { region.add(BUCKETS_OFF) } as *const AtomicU32,
            entries: unsafe { region.add(entries_off(capacity)) } as *const Latch,
            capacity,
        }
    }

    fn hdr(&self) -> &TableHeader {
        // SAFETY: guaranteed by `new`.
        unsafe { &*self.hdr }
    }

    /// 1-based entry access.
    fn entry(&self, idx: u32) -> &Latch {
        debug_assert!(idx >= 1 && idx <= self.capacity);
        // SAFETY: guaranteed by `new` plus the index check.
        unsafe { &*self.entries.add(idx as usize - 1) }
    }

    fn bucket(&self, block: u64) -> &AtomicU32 {
        // SAFETY: guaranteed by `new`.
        unsafe { &*self.buckets.add((block % self.capacity as u64) as usize) }
    }

    /// Acquires the table spin word.
    ///
    /// The `Acquire` success ordering pairs with the `Release` store in
    /// `unlock_table` so bookkeeping writes in one critical section are
    /// visible to the next, across processes.
    fn lock_table(&self) {
        let mut pause = Backoff::new();
        while self
            .hdr()
            .lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            pause.spin();
        }
    }

    fn unlock_table(&self) {
        self.hdr().lock.store(0, Ordering::Release);
    }

    // Idle list maintenance. All four helpers run under the table lock.

    fn idle_unlink(&self, idx: u32) {
        let e = self.entry(idx);
        let prev = e.idle_prev.load(Ordering::Relaxed);
        let next = e.idle_next.load(Ordering::Relaxed);
        match prev {
            0 => self.hdr().idle_head.store(next, Ordering::Relaxed),
            p => self.entry(p).idle_next.store(next, Ordering::Relaxed),
        }
        match next {
            0 => self.hdr().idle_tail.store(prev, Ordering::Relaxed),
            n => self.entry(n).idle_prev.store(prev, Ordering::Relaxed),
        }
    }

    fn idle_push_head(&self, idx: u32) {
        let head = self.hdr().idle_head.load(Ordering::Relaxed);
        let e = self.entry(idx);
        e.idle_prev.store(0, Ordering::Relaxed);
        e.idle_next.store(head, Ordering::Relaxed);
        match head {
            0 => self.hdr().idle_tail.store(idx, Ordering::Relaxed),
            h => self.entry(h).idle_prev.store(idx, Ordering::Relaxed),
        }
        self.hdr().idle_head.store(idx, Ordering::Relaxed);
    }

    fn idle_pop_tail(&self) -> Option<u32> {
        let tail = self.hdr().idle_tail.load(Ordering::Relaxed);
        if tail == 0 {
            return None;
        }
        self.idle_unlink(tail);
        Some(tail)
    }

    fn chain_remove(&self, block: u64, idx: u32) {
        let bucket = self.bucket(block);
        let mut cur = bucket.load(Ordering::Relaxed);
        if cur == idx {
            bucket.store(self.entry(idx).hash_next.load(Ordering::Relaxed), Ordering::Relaxed);
            return;
        }
        while cur != 0 {
            let e = self.entry(cur);
            let next = e.hash_next.load(Ordering::Relaxed);
            if next == idx {
                e.hash_next
                    .store(self.entry(idx).hash_next.load(Ordering::Relaxed), Ordering::Relaxed);
                return;
            }
            cur = next;
        }
        debug_assert!(false, "latch entry missing from its chain");
    }

    /// Pins the latch for `block` and acquires `mode`. Returns the
    /// entry index for `unpin`/`upgrade`.
    pub(crate) fn pin(&self, block: u64, mode: LatchMode, stat: &StatCounters) -> Result<u32> {
        self.lock_table();
        let mut idx = self.bucket(block).load(Ordering::Relaxed);
        while idx != 0 {
            let e = self.entry(idx);
            if e.block.load(Ordering::Relaxed) == block {
                break;
            }
            idx = e.hash_next.load(Ordering::Relaxed);
        }
        let idx = if idx != 0 {
            let e = self.entry(idx);
            if e.pin.load(Ordering::Relaxed) == 0 {
                self.idle_unlink(idx);
            }
            let _ = e.pin.fetch_add(1, Ordering::Relaxed);
            stat.count_latch_hit();
            idx
        } else {
            // Reclaim the least-recently idle entry.
            let idx = match self.idle_pop_tail() {
                Some(i) => i,
                None => {
                    self.unlock_table();
                    return Err(Error::LatchTableFull);
                }
            };
            let e = self.entry(idx);
            let old = e.block.load(Ordering::Relaxed);
            if old != EMPTY {
                self.chain_remove(old, idx);
                stat.count_latch_evict();
                log::trace!("latch evict block {} for block {}", old, block);
            }
            e.block.store(block, Ordering::Relaxed);
            e.pin.store(1, Ordering::Relaxed);
            let bucket = self.bucket(block);
            e.hash_next.store(bucket.load(Ordering::Relaxed), Ordering::Relaxed);
            bucket.store(idx, Ordering::Relaxed);
            idx
        };
        self.unlock_table();
        self.acquire(self.entry(idx), mode);
        Ok(idx)
    }

    /// Waits for the requested mode on a pinned entry.
    ///
    /// The `Acquire` success ordering pairs with the `Release` in
    /// `unpin`: stores made under a write latch are visible to the next
    /// holder, in this process or another.
    fn acquire(&self, e: &Latch, mode: LatchMode) {
        let mut pause = Backoff::new();
        match mode {
            LatchMode::Read => loop {
                let w = e.lock.load(Ordering::Relaxed);
                if w & WRITER == 0
                    && e.lock
                        .compare_exchange_weak(w, w + READER, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                {
                    return;
                }
                pause.spin();
            },
            LatchMode::Write => loop {
                if e.lock
                    .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                pause.spin();
            },
        }
    }

    /// Converts a held read latch into a write latch. Fails if another
    /// reader is present; the caller then restarts its operation.
    pub(crate) fn upgrade(&self, idx: u32) -> bool {
        self.entry(idx)
            .lock
            .compare_exchange(READER, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases `mode` and the pin taken by `pin`.
    pub(crate) fn unpin(&self, idx: u32, mode: LatchMode) {
        let e = self.entry(idx);
        match mode {
            LatchMode::Read => {
                let _ = e.lock.fetch_sub(READER, Ordering::Release);
            }
            LatchMode::Write => e.lock.store(0, Ordering::Release),
        }
        self.lock_table();
        if e.pin.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.idle_push_head(idx);
        }
        self.unlock_table();
    }

    /// Whether every entry is unpinned and unlocked. Diagnostic.
    pub(crate) fn quiesced(&self) -> bool {
        (1..=self.capacity).all(|i| {
            let e = self.entry(i);
            e.pin.load(Ordering::Relaxed) == 0 && e.lock.load(Ordering::Relaxed) == 0
        })
    }
}

/// Formats a latch region inside a private (not yet shared) buffer:
/// empty entries, empty buckets, every entry on the idle list.
pub(crate) fn format_region(region: &mut [u8], capacity: u32) {
    assert!(region.len() >= region_len(capacity));
    for b in region[..region_len(capacity)].iter_mut() {
        *b = 0;
    }
    // SAFETY: the buffer is 8-aligned (callers format block images in
    // AlignedBuf) and private, so plain stores through the table view
    // cannot race.
    let table = unsafe { LatchTable::new(region.as_mut_ptr(), capacity) };
    table.hdr().idle_head.store(1, Ordering::Relaxed);
    table.hdr().idle_tail.store(capacity, Ordering::Relaxed);
    for i in 1..=capacity {
        let e = table.entry(i);
        e.block.store(EMPTY, Ordering::Relaxed);
        e.idle_prev.store(i - 1, Ordering::Relaxed);
        e.idle_next.store(if i == capacity { 0 } else { i + 1 }, Ordering::Relaxed);
    }
}

/// Adaptive spin/yield back-off used by every latch wait.
struct Backoff {
    step: u32,
}

impl Backoff {
    fn new() -> Backoff {
        Backoff { step: 0 }
    }

    fn spin(&mut self) {
        if self.step < 6 {
            for _ in 0..1 << self.step {
                spin_loop();
            }
            self.step += 1;
        } else {
            thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::AlignedBuf;

    fn table(capacity: u32) -> (AlignedBuf, LatchTable) {
        let mut buf = AlignedBuf::zeroed(region_len(capacity));
        format_region(buf.as_mut_slice(), capacity);
        let t = unsafe { LatchTable::new(buf.as_mut_slice().as_mut_ptr(), capacity) };
        (buf, t)
    }

    #[test]
    fn pin_read_shares() {
        let stat = StatCounters::default();
        let (_buf, t) = table(8);
        let a = t.pin(7, LatchMode::Read, &stat).unwrap();
        let b = t.pin(7, LatchMode::Read, &stat).unwrap();
        assert_eq!(a, b);
        t.unpin(a, LatchMode::Read);
        t.unpin(b, LatchMode::Read);
        assert!(t.quiesced());
        assert_eq!(stat.snapshot().latch_hits, 2);
    }

    #[test]
    fn upgrade_requires_sole_reader() {
        let stat = StatCounters::default();
        let (_buf, t) = table(8);
        let a = t.pin(3, LatchMode::Read, &stat).unwrap();
        let b = t.pin(3, LatchMode::Read, &stat).unwrap();
        assert!(!t.upgrade(a));
        t.unpin(b, LatchMode::Read);
        assert!(t.upgrade(a));
        t.unpin(a, LatchMode::Write);
        assert!(t.quiesced());
    }

    #[test]
    fn eviction_reclaims_least_recently_idle() {
        let stat = StatCounters::default();
        let (_buf, t) = table(2);
        let a = t.pin(10, LatchMode::Read, &stat).unwrap();
        let b = t.pin(11, LatchMode::Read, &stat).unwrap();
        t.unpin(a, LatchMode::Read);
        t.unpin(b, LatchMode::Read);
        // 10 idled first, so it is the reclamation victim.
        let c = t.pin(12, LatchMode::Read, &stat).unwrap();
        assert_eq!(c, a);
        assert_eq!(stat.snapshot().latch_evicts, 1);
        // 11 is still resident.
        let d = t.pin(11, LatchMode::Read, &stat).unwrap();
        assert_eq!(d, b);
        t.unpin(c, LatchMode::Read);
        t.unpin(d, LatchMode::Read);
    }

    #[test]
    fn exhaustion_reports_full() {
        let stat = StatCounters::default();
        let (_buf, t) = table(2);
        let a = t.pin(1, LatchMode::Read, &stat).unwrap();
        let b = t.pin(2, LatchMode::Read, &stat).unwrap();
        assert!(matches!(
            t.pin(3, LatchMode::Read, &stat),
            Err(Error::LatchTableFull)
        ));
        t.unpin(a, LatchMode::Read);
        t.unpin(b, LatchMode::Read);
    }

    #[test]
    fn writer_excludes_across_threads() {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::sync::Arc;

        let stat = Arc::new(StatCounters::default());
        let mut buf = AlignedBuf::zeroed(region_len(8));
        format_region(buf.as_mut_slice(), 8);
        let ptr = buf.as_mut_slice().as_mut_ptr() as usize;
        let counter = Arc::new(AtomicU64::new(0));

        let mut workers = Vec::new();
        for _ in 0..4 {
            let stat = Arc::clone(&stat);
            let counter = Arc::clone(&counter);
            workers.push(thread::spawn(move || {
                let t = unsafe { LatchTable::new(ptr as *mut u8, 8) };
                for _ in 0..1000 {
                    let idx = t.pin(5, LatchMode::Write, &stat).unwrap();
                    // Non-atomic-looking increment under the write
                    // latch: load, bump, store.
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    t.unpin(idx, LatchMode::Write);
                }
            }));
        }
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
        let t = unsafe { LatchTable::new(ptr as *mut u8, 8) };
        assert!(t.quiesced());
    }
}
