//! bptree: a disk-backed, concurrent B+tree key-value index.
//!
//! The tree lives in a single flat file of fixed-size blocks; block 0
//! is the superblock and embeds a latch table that every process
//! mapping the file shares, so independent processes can operate on
//! one database with per-block reader/writer latching. Each process
//! owns a `Mgr` (file descriptor, buffer pool of mmap'd segments,
//! iostat counters) and any number of single-threaded `BptHandle`
//! cursors for point operations and iteration.
//!
//! Keys are byte strings up to 255 bytes, compared unsigned
//! lexicographic; values are 48-bit integers, with 0 reserved to mean
//! "absent". Durability is best-effort through mmap write-back; there
//! is no write-ahead log, and a process that dies while holding a
//! latch leaves the database unrecoverable without external repair.
//!
//! ```no_run
//! use std::sync::Arc;
//! use bptree::{BptHandle, Mgr};
//!
//! # fn main() -> bptree::Result<()> {
//! let mgr = Arc::new(Mgr::open("bpt.dat", 12, 64, 96)?);
//! let mut h = BptHandle::new(&mgr);
//! h.insert_key(b"hello", 0, 1)?;
//! assert_eq!(h.find_key(b"hello")?, 1);
//! # Ok(())
//! # }
//! ```

#![deny(rust_2018_idioms)]
#![deny(unsafe_op_in_unsafe_fn)]
#![deny(unused_import_braces)]
#![deny(unused_qualifications)]
#![deny(trivial_numeric_casts)]

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(not(unix))] {
        compile_error!("bptree needs a unix host: mmap, shared file mappings");
    }
}

#[cfg(target_endian = "big")]
compile_error!("the on-disk format is little-endian");

mod error;
mod latch;
mod mgr;
mod node;
mod param;
mod pool;
mod stat;
mod superblock;
mod tree;
mod util;

pub use error::{Error, Result};
pub use mgr::{BptHandle, Mgr};
pub use param::{
    DEFAULT_LATCH_CAPACITY, DEFAULT_NODE_BITS, DEFAULT_POOL_CAPACITY, MAX_KEY_LEN, MAX_NODENO,
};
pub use stat::IoStat;
pub use tree::TreeCheck;
