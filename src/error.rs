//! Engine errors.
//!
//! Three classes, mirrored in the variants: fatal conditions that end
//! the operation and usually the process (`BadMagic`, `BadVersion`,
//! `Io`, `LatchTableFull`, `PoolExhausted`), operation-scoped failures
//! returned to the caller with the tree unchanged (`KeyAbsent`,
//! `KeyTooLong`, `ValueRange`), and argument validation (`Geometry`).
//! Soft events (latch evictions, pool unmaps) are not errors; they are
//! visible only through the iostat counters.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not a bptree file (bad magic {0:#010x})")]
    BadMagic(u32),

    #[error("unsupported on-disk version {0}")]
    BadVersion(u16),

    #[error("invalid geometry: {0}")]
    Geometry(&'static str),

    #[error("i/o error")]
    Io(#[from] std::io::Error),

    #[error("buffer pool exhausted")]
    PoolExhausted,

    #[error("latch table exhausted")]
    LatchTableFull,

    #[error("key longer than this geometry allows")]
    KeyTooLong,

    #[error("value does not fit in 48 bits")]
    ValueRange,

    #[error("key not present")]
    KeyAbsent,

    #[error("consistency check failed: {0}")]
    Corrupt(&'static str),
}
