/// Smallest supported block size is `1 << MIN_NODE_BITS` bytes.
pub const MIN_NODE_BITS: u32 = 9;

/// Largest supported block size. Slot offsets and the payload watermark
/// are 16 bits wide.
pub const MAX_NODE_BITS: u32 = 15;

/// Default block size exponent (4 KiB blocks).
pub const DEFAULT_NODE_BITS: u32 = 12;

/// Block numbers are 48 bits; stored values share the same width.
pub const NODENO_BITS: u32 = 48;

/// Largest representable block number / stored value.
pub const MAX_NODENO: u64 = (1 << NODENO_BITS) - 1;

/// Longest key any geometry accepts. Narrow blocks restrict this
/// further; see `max_key_len`.
pub const MAX_KEY_LEN: usize = 255;

/// Bytes of a key entry that are not key bytes: the 48-bit value.
pub const ENTRY_VALUE_LEN: usize = 6;

/// The superblock.
pub const SUPER_BLOCK: u64 = 0;

/// Reserved, kept for future use.
pub const RESERVED_BLOCK: u64 = 1;

/// The initial root leaf.
pub const INITIAL_ROOT_BLOCK: u64 = 2;

/// First block handed out by the allocator.
pub const FIRST_ALLOC_BLOCK: u64 = 3;

/// Blocks below this are never on the free list.
pub const RESERVED_BLOCKS: u64 = 3;

/// Blocks per pool segment is `1 << DEFAULT_SEGMENT_BITS`.
pub const DEFAULT_SEGMENT_BITS: u8 = 3;

/// Default buffer pool capacity, in segments.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Default latch table capacity. Must fit inside block 0 together with
/// the superblock header; `Mgr::open` checks the actual geometry.
pub const DEFAULT_LATCH_CAPACITY: u32 = 96;

/// Superblock magic ("BPT1").
pub const BPT_MAGIC: u32 = 0x3154_5042;

/// On-disk format version.
pub const BPT_VERSION: u16 = 2;

use crate::node::{NODE_HEADER_LEN, SLOT_LEN};

/// Longest key a node of `1 << node_bits` bytes accepts. Bounded so a
/// compacted full node always holds at least two live entries and a
/// split can distribute them.
pub fn max_key_len(node_bits: u32) -> usize {
    let payload = (1usize << node_bits) - NODE_HEADER_LEN;
    MAX_KEY_LEN.min(payload / 4 - SLOT_LEN - ENTRY_VALUE_LEN)
}
