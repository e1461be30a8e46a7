//! The superblock.
//!
//! Block 0 of the file. It records the geometry of the database, the
//! allocation state (bump counter and free-list head), the root block
//! number, and the embedded latch table that every process sharing the
//! file maps and operates on with atomics.
//!
//! The header fields are fixed-offset and little-endian. The three
//! 48-bit quantities (`next_free`, `free_head`, `root`) are stored as
//! 8-byte words whose top 16 bits are reserved-zero so that the root
//! pointer can be read and installed atomically; `next_free` and
//! `free_head` are only ever changed under the block-0 write latch.
//!
//! The superblock mapping is created at manager open and lives until
//! close; it is never evicted from the buffer pool.

use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::error::{Error, Result};
use crate::latch;
use crate::param::{
    BPT_MAGIC, BPT_VERSION, FIRST_ALLOC_BLOCK, INITIAL_ROOT_BLOCK, MAX_NODE_BITS, MIN_NODE_BITS,
};

/// Byte offset of the latch-table region inside block 0.
pub(crate) const LATCH_REGION_OFF: usize = 64;

const OFF_NEXT_FREE: usize = 16;
const OFF_FREE_HEAD: usize = 24;
const OFF_ROOT: usize = 32;

/// On-disk image of the superblock header.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy, Debug)]
pub(crate) struct SuperHeader {
    pub magic: u32,
    pub version: u16,
    pub node_bits: u8,
    pub segment_bits: u8,
    pub latch_capacity: u32,
    _reserved: u32,
    pub next_free: u64,
    pub free_head: u64,
    pub root: u64,
}

const_assert_eq!(size_of::<SuperHeader>(), 40);

/// Live view over the permanently mapped block 0.
pub(crate) struct Super {
    ptr: *mut u8,
}

// SAFETY: all mutation goes through atomics or happens under the
// block-0 latch; the pointer itself is stable for the manager lifetime.
unsafe impl Send for Super {}
unsafe impl Sync for Super {}

impl Super {
    /// # Safety
    ///
    /// `ptr` must point at a mapped, 8-aligned region of at least one
    /// block that holds a formatted superblock, and must stay valid for
    /// the lifetime of the returned view.
    pub(crate) unsafe fn new(ptr: *mut u8) -> Super {
        debug_assert_eq!(ptr as usize % 8, 0);
        Super { ptr }
    }

    /// Copies the header out of the mapping.
    pub(crate) fn header(&self) -> SuperHeader {
        // SAFETY: the region holds a formatted superblock (see `new`).
        unsafe { ptr::read(self.ptr as *const SuperHeader) }
    }

    fn word(&self, off: usize) -> &AtomicU64 {
        // SAFETY: `off` is one of the fixed 8-aligned field offsets.
        unsafe { &*(self.ptr.add(off) as *const AtomicU64) }
    }

    /// Current root block number.
    pub(crate) fn root(&self) -> u64 {
        self.word(OFF_ROOT).load(Ordering::SeqCst)
    }

    /// Installs a new root, failing if the root moved under us.
    pub(crate) fn install_root(&self, old: u64, new: u64) -> bool {
        self.word(OFF_ROOT)
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Bump allocator cursor. Callers hold the block-0 write latch.
    pub(crate) fn next_free(&self) -> u64 {
        self.word(OFF_NEXT_FREE).load(Ordering::SeqCst)
    }

    pub(crate) fn set_next_free(&self, v: u64) {
        self.word(OFF_NEXT_FREE).store(v, Ordering::SeqCst);
    }

    /// Free-list head. Callers hold the block-0 write latch.
    pub(crate) fn free_head(&self) -> u64 {
        self.word(OFF_FREE_HEAD).load(Ordering::SeqCst)
    }

    pub(crate) fn set_free_head(&self, v: u64) {
        self.word(OFF_FREE_HEAD).store(v, Ordering::SeqCst);
    }

    /// Pointer to the embedded latch-table region.
    pub(crate) fn latch_region(&self) -> *mut u8 {
        // SAFETY: LATCH_REGION_OFF is inside block 0.
        unsafe { self.ptr.add(LATCH_REGION_OFF) }
    }
}

/// Formats a fresh superblock image into `block`.
pub(crate) fn format(block: &mut [u8], node_bits: u32, segment_bits: u8, latch_capacity: u32) {
    let hdr = SuperHeader {
        magic: BPT_MAGIC,
        version: BPT_VERSION,
        node_bits: node_bits as u8,
        segment_bits,
        latch_capacity,
        _reserved: 0,
        next_free: FIRST_ALLOC_BLOCK,
        free_head: 0,
        root: INITIAL_ROOT_BLOCK,
    };
    block[..size_of::<SuperHeader>()].copy_from_slice(hdr.as_bytes());
    latch::format_region(&mut block[LATCH_REGION_OFF..], latch_capacity);
}

/// Checks a header read from an existing file against the requested
/// geometry. Stored geometry is authoritative; a conflicting
/// `node_bits` argument is an error rather than silently ignored.
pub(crate) fn validate(h: &SuperHeader, want_node_bits: u32) -> Result<()> {
    if h.magic != BPT_MAGIC {
        return Err(Error::BadMagic(h.magic));
    }
    if h.version != BPT_VERSION {
        return Err(Error::BadVersion(h.version));
    }
    let bits = h.node_bits as u32;
    if bits < MIN_NODE_BITS || bits > MAX_NODE_BITS {
        return Err(Error::Geometry("stored node_bits out of range"));
    }
    if bits != want_node_bits {
        return Err(Error::Geometry("node_bits does not match the file"));
    }
    if h.root < INITIAL_ROOT_BLOCK || h.next_free < FIRST_ALLOC_BLOCK {
        return Err(Error::Geometry("allocation state below reserved blocks"));
    }
    if !latch::table_fits(bits, h.latch_capacity) {
        return Err(Error::Geometry("stored latch capacity exceeds block 0"));
    }
    Ok(())
}
