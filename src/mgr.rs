//! Manager and handle lifecycle.
//!
//! One `Mgr` per process per database file. It owns the file
//! descriptor, the permanent superblock mapping (whose embedded latch
//! table is shared with every other process mapping the same file),
//! the process-local buffer pool, and the iostat counters. Opening an
//! empty file formats blocks 0..=2: superblock, a reserved block, and
//! an empty leaf root. Closing flushes and unmaps; it never deletes
//! the file.
//!
//! A `BptHandle` is a lightweight cursor bound to a manager. It owns
//! the scratch buffers one logical operation needs (a compaction frame
//! and the iteration cursor) and must not be shared across threads;
//! open one handle per worker. Handles hold no latches and no pool
//! pins between operations.
//!
//! Block allocation pops the free list threaded through reclaimed
//! blocks, or bumps `next_free`. Both paths run under the block-0
//! write latch, which also serializes file growth, and the latch is
//! released before the caller latches the block it was handed, so a
//! block-0 holder never waits on another latch.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::slice;
use std::sync::Arc;

use memmap2::{MmapOptions, MmapRaw};
use scopeguard::ScopeGuard;

use crate::error::{Error, Result};
use crate::latch::{LatchMode, LatchTable};
use crate::node::{NodeMut, NodeRef};
use crate::param::{
    FIRST_ALLOC_BLOCK, INITIAL_ROOT_BLOCK, MAX_NODE_BITS, MIN_NODE_BITS, RESERVED_BLOCK,
    SUPER_BLOCK,
};
use crate::pool::Pool;
use crate::stat::{IoStat, StatCounters};
use crate::superblock::{self, Super};
use crate::util::AlignedBuf;
use crate::{latch, param};

pub struct Mgr {
    file: Arc<File>,
    node_bits: u32,
    segment_bits: u32,
    // Keeps block 0 mapped for the manager's lifetime.
    super_map: MmapRaw,
    sb: Super,
    latches: LatchTable,
    pool: Pool,
    stat: Arc<StatCounters>,
}

impl Mgr {
    /// Opens (or creates and formats) a database file.
    ///
    /// For an existing file the stored geometry is authoritative:
    /// `node_bits` must match it and `latch_capacity` is ignored.
    /// `pool_capacity` sizes this process's buffer pool.
    pub fn open<P: AsRef<Path>>(
        path: P,
        node_bits: u32,
        pool_capacity: usize,
        latch_capacity: u32,
    ) -> Result<Mgr> {
        let path = path.as_ref();
        if node_bits < MIN_NODE_BITS || node_bits > MAX_NODE_BITS {
            return Err(Error::Geometry("node_bits out of range"));
        }
        if pool_capacity == 0 {
            return Err(Error::Geometry("pool capacity must be nonzero"));
        }
        if !latch::table_fits(node_bits, latch_capacity) {
            return Err(Error::Geometry("latch table does not fit in block 0"));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let block_size = 1usize << node_bits;
        let segment_bits = param::DEFAULT_SEGMENT_BITS as u32;

        if file.metadata()?.len() < block_size as u64 {
            // Fresh file: format it, removing the partial file if
            // anything fails before the image is complete.
            let cleanup = scopeguard::guard(path.to_path_buf(), |p| {
                let _ = std::fs::remove_file(p);
            });
            format_file(&file, node_bits, segment_bits, latch_capacity)?;
            let _ = ScopeGuard::into_inner(cleanup);
        }

        // SAFETY: block 0 of a regular file we keep open; the view
        // lives inside Mgr next to the mapping itself.
        let super_map = unsafe { MmapOptions::new().len(block_size).map_raw(&file)? };
        let sb = unsafe { Super::new(super_map.as_mut_ptr()) };
        let hdr = sb.header();
        superblock::validate(&hdr, node_bits)?;

        // SAFETY: the latch region sits inside the validated, mapped
        // superblock and outlives the table (both live in Mgr).
        let latches = unsafe { LatchTable::new(sb.latch_region(), hdr.latch_capacity) };
        let stat = Arc::new(StatCounters::default());
        let file = Arc::new(file);
        let pool = Pool::new(
            Arc::clone(&file),
            node_bits,
            hdr.segment_bits as u32,
            pool_capacity,
            Arc::clone(&stat),
        );
        log::debug!(
            "open {:?}: node_bits {}, segment_bits {}, latch capacity {}, pool capacity {}",
            path,
            node_bits,
            hdr.segment_bits,
            hdr.latch_capacity,
            pool_capacity
        );
        Ok(Mgr {
            file,
            node_bits,
            segment_bits: hdr.segment_bits as u32,
            super_map,
            sb,
            latches,
            pool,
            stat,
        })
    }

    pub fn node_bits(&self) -> u32 {
        self.node_bits
    }

    pub(crate) fn block_size(&self) -> usize {
        1usize << self.node_bits
    }

    pub fn iostat(&self) -> IoStat {
        self.stat.snapshot()
    }

    pub(crate) fn sb(&self) -> &Super {
        &self.sb
    }

    /// Latches `block` and pins its pool segment.
    pub(crate) fn pin_page(&self, block: u64, mode: LatchMode) -> Result<PageGuard<'_>> {
        let latch_idx = self.latches.pin(block, mode, &self.stat)?;
        let ptr = match self.pool.pin(block) {
            Ok(p) => p,
            Err(e) => {
                self.latches.unpin(latch_idx, mode);
                return Err(e);
            }
        };
        Ok(PageGuard {
            mgr: self,
            block,
            latch_idx,
            mode,
            ptr,
        })
    }

    /// Latch-only guard on block 0 for allocation state. The
    /// superblock is permanently mapped, so no pool pin is needed.
    fn super_latch(&self, mode: LatchMode) -> Result<SuperGuard<'_>> {
        let latch_idx = self.latches.pin(SUPER_BLOCK, mode, &self.stat)?;
        Ok(SuperGuard {
            mgr: self,
            latch_idx,
            mode,
        })
    }

    /// Hands out a block: free-list head first, bump allocation
    /// otherwise. The returned block still carries its on-disk state
    /// (a recycled block keeps its FREE flag); the caller write-latches
    /// and reinitializes it.
    pub(crate) fn alloc_block(&self) -> Result<u64> {
        let guard = self.super_latch(LatchMode::Write)?;
        let head = self.sb.free_head();
        let block = if head != 0 {
            let ptr = self.pool.pin(head)?;
            // SAFETY: `ptr` addresses one mapped block; free_next is
            // only written under the block-0 latch we hold.
            let next = {
                let buf = unsafe { slice::from_raw_parts(ptr, self.block_size()) };
                NodeRef::new(buf).free_next()
            };
            self.pool.unpin(head);
            self.sb.set_free_head(next);
            head
        } else {
            let next = self.sb.next_free();
            self.sb.set_next_free(next + 1);
            self.grow_to(next)?;
            next
        };
        drop(guard);
        Ok(block)
    }

    /// Pushes a write-latched, empty node onto the free list.
    pub(crate) fn push_free(&self, block: u64, node: &mut NodeMut<'_>) -> Result<()> {
        debug_assert!(block >= FIRST_ALLOC_BLOCK || block == INITIAL_ROOT_BLOCK);
        let guard = self.super_latch(LatchMode::Write)?;
        node.set_free_next(self.sb.free_head());
        node.mark_free();
        self.sb.set_free_head(block);
        drop(guard);
        Ok(())
    }

    /// Grows the file so the segment containing `block` is fully
    /// backed. Runs under the block-0 write latch, which serializes
    /// growth across processes.
    fn grow_to(&self, block: u64) -> Result<()> {
        let seg_bytes = 1u64 << (self.node_bits + self.segment_bits);
        let end = (block + 1) << self.node_bits;
        let target = (end + seg_bytes - 1) / seg_bytes * seg_bytes;
        if self.file.metadata()?.len() < target {
            self.file.set_len(target)?;
        }
        Ok(())
    }

    /// Whether every latch is released and no pool segment is pinned.
    /// Diagnostic; meaningful only while no operation is in flight.
    #[doc(hidden)]
    pub fn is_idle(&self) -> bool {
        self.latches.quiesced() && self.pool.quiesced()
    }
}

impl Drop for Mgr {
    fn drop(&mut self) {
        self.pool.flush_all();
        if let Err(e) = self.super_map.flush() {
            log::warn!("superblock flush failed: {}", e);
        }
    }
}

/// Formats blocks 0..=2 of an empty file and grows it to a segment
/// boundary.
fn format_file(file: &File, node_bits: u32, segment_bits: u32, latch_capacity: u32) -> Result<()> {
    let block_size = 1usize << node_bits;

    let mut block0 = AlignedBuf::zeroed(block_size);
    superblock::format(
        block0.as_mut_slice(),
        node_bits,
        segment_bits as u8,
        latch_capacity,
    );
    file.write_all_at(block0.as_slice(), 0)?;

    let zeros = AlignedBuf::zeroed(block_size);
    file.write_all_at(zeros.as_slice(), RESERVED_BLOCK << node_bits)?;

    let mut root = AlignedBuf::zeroed(block_size);
    NodeMut::new(root.as_mut_slice()).init(0);
    file.write_all_at(root.as_slice(), INITIAL_ROOT_BLOCK << node_bits)?;

    let seg_bytes = 1u64 << (node_bits + segment_bits);
    let end = FIRST_ALLOC_BLOCK << node_bits;
    file.set_len((end + seg_bytes - 1) / seg_bytes * seg_bytes)?;
    file.sync_all()?;
    Ok(())
}

/// A latched, pinned block. Releases the pool pin and the latch on
/// drop, so every exit path of the tree algorithms unwinds cleanly.
pub(crate) struct PageGuard<'m> {
    mgr: &'m Mgr,
    block: u64,
    latch_idx: u32,
    mode: LatchMode,
    ptr: *mut u8,
}

impl<'m> PageGuard<'m> {
    pub(crate) fn block(&self) -> u64 {
        self.block
    }

    pub(crate) fn mode(&self) -> LatchMode {
        self.mode
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        // SAFETY: the pool pin keeps the mapping alive; the latch keeps
        // writers (in any process) out while readers look.
        unsafe { slice::from_raw_parts(self.ptr, self.mgr.block_size()) }
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        debug_assert_eq!(self.mode, LatchMode::Write);
        // SAFETY: as above, plus the write latch is exclusive.
        unsafe { slice::from_raw_parts_mut(self.ptr, self.mgr.block_size()) }
    }

    pub(crate) fn node(&self) -> NodeRef<'_> {
        NodeRef::new(self.bytes())
    }

    pub(crate) fn node_mut(&mut self) -> NodeMut<'_> {
        NodeMut::new(self.bytes_mut())
    }

    /// Tries to turn a read latch into a write latch without letting
    /// the block change underneath. On failure the caller drops the
    /// guard and restarts.
    pub(crate) fn upgrade(&mut self) -> bool {
        debug_assert_eq!(self.mode, LatchMode::Read);
        if self.mgr.latches.upgrade(self.latch_idx) {
            self.mode = LatchMode::Write;
            true
        } else {
            false
        }
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.mgr.latches.unpin(self.latch_idx, self.mode);
        self.mgr.pool.unpin(self.block);
    }
}

struct SuperGuard<'m> {
    mgr: &'m Mgr,
    latch_idx: u32,
    mode: LatchMode,
}

impl Drop for SuperGuard<'_> {
    fn drop(&mut self) {
        self.mgr.latches.unpin(self.latch_idx, self.mode);
    }
}

/// A cursor over one tree. Single-threaded; open one per worker.
pub struct BptHandle {
    pub(crate) mgr: Arc<Mgr>,
    /// Compaction and split scratch, one block.
    pub(crate) frame: AlignedBuf,
    /// Private copy of the leaf the iteration cursor sits on.
    pub(crate) cursor: AlignedBuf,
    pub(crate) cursor_block: u64,
}

impl BptHandle {
    pub fn new(mgr: &Arc<Mgr>) -> BptHandle {
        let block_size = mgr.block_size();
        BptHandle {
            mgr: Arc::clone(mgr),
            frame: AlignedBuf::zeroed(block_size),
            cursor: AlignedBuf::zeroed(block_size),
            cursor_block: 0,
        }
    }

    /// Counter snapshot for this handle's manager.
    pub fn iostat(&self) -> IoStat {
        self.mgr.iostat()
    }
}
