//! The buffer pool.
//!
//! Translates block numbers into stable addresses for the duration of
//! a pin. The pool keeps a fixed number of mmap'd windows (*segments*,
//! a power-of-two run of contiguous blocks) over the block file and
//! reuses them with a clock sweep once capacity is reached. Segments
//! with a nonzero pin count are never unmapped; if every segment is
//! pinned on a miss the request fails with `PoolExhausted` and the
//! caller must drop its latches and retry.
//!
//! The pool is process-local: each process sharing a file has its own
//! mappings, and the shared pages of the underlying file are what make
//! writes visible across processes. The map is guarded by a spin
//! mutex; no I/O happens while it is held except the map/unmap of the
//! missed segment itself.

use std::collections::HashMap;
use std::fs::File;
use std::sync::Arc;

use memmap2::{MmapOptions, MmapRaw};
use spin::Mutex;

use crate::error::{Error, Result};
use crate::stat::StatCounters;

pub(crate) struct Pool {
    file: Arc<File>,
    node_bits: u32,
    segment_bits: u32,
    capacity: usize,
    stat: Arc<StatCounters>,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    /// Resident segments by segment number.
    frames: HashMap<u64, Frame>,
    /// Clock ring of resident segment numbers.
    ring: Vec<u64>,
    hand: usize,
}

struct Frame {
    map: MmapRaw,
    pin: u32,
    referenced: bool,
}

impl Pool {
    pub(crate) fn new(
        file: Arc<File>,
        node_bits: u32,
        segment_bits: u32,
        capacity: usize,
        stat: Arc<StatCounters>,
    ) -> Pool {
        Pool {
            file,
            node_bits,
            segment_bits,
            capacity,
            stat,
            inner: Mutex::new(PoolInner {
                frames: HashMap::with_capacity(capacity),
                ring: Vec::with_capacity(capacity),
                hand: 0,
            }),
        }
    }

    fn segment_bytes(&self) -> usize {
        1usize << (self.node_bits + self.segment_bits)
    }

    /// Pins the segment containing `block` and returns the block's
    /// address. The address stays valid until the matching `unpin`.
    pub(crate) fn pin(&self, block: u64) -> Result<*mut u8> {
        let seg = block >> self.segment_bits;
        let in_seg = block & ((1 << self.segment_bits) - 1);
        let mut inner = self.inner.lock();
        if let Some(f) = inner.frames.get_mut(&seg) {
            f.pin += 1;
            f.referenced = true;
            // SAFETY: `in_seg` is below the segment's block count.
            return Ok(unsafe { f.map.as_mut_ptr().add((in_seg as usize) << self.node_bits) });
        }
        if inner.frames.len() >= self.capacity {
            self.evict_one(&mut inner)?;
        }
        let offset = seg << (self.node_bits + self.segment_bits);
        // SAFETY: the mapping windows a regular file this manager holds
        // open; the allocator grows the file to segment boundaries
        // before any block in the segment is reachable, so the window
        // is fully backed.
        let map = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(self.segment_bytes())
                .map_raw(&*self.file)?
        };
        self.stat.count_pool_map();
        log::trace!("pool map segment {} (block {})", seg, block);
        // SAFETY: as above.
        let ptr = unsafe { map.as_mut_ptr().add((in_seg as usize) << self.node_bits) };
        inner.frames.insert(
            seg,
            Frame {
                map,
                pin: 1,
                referenced: true,
            },
        );
        inner.ring.push(seg);
        Ok(ptr)
    }

    /// Clock sweep over unpinned frames; two passes so every frame gets
    /// its referenced bit cleared before we give up.
    fn evict_one(&self, inner: &mut PoolInner) -> Result<()> {
        let len = inner.ring.len();
        debug_assert!(len > 0);
        for _ in 0..2 * len {
            let pos = inner.hand % inner.ring.len();
            inner.hand = pos + 1;
            let seg = inner.ring[pos];
            let f = match inner.frames.get_mut(&seg) {
                Some(f) => f,
                None => {
                    debug_assert!(false, "clock ring out of sync");
                    continue;
                }
            };
            if f.pin != 0 {
                continue;
            }
            if f.referenced {
                f.referenced = false;
                continue;
            }
            let frame = match inner.frames.remove(&seg) {
                Some(f) => f,
                None => continue,
            };
            let _ = inner.ring.swap_remove(pos);
            if let Err(e) = frame.map.flush() {
                log::warn!("pool flush of segment {} failed: {}", seg, e);
            }
            drop(frame);
            self.stat.count_pool_unmap();
            log::trace!("pool unmap segment {}", seg);
            return Ok(());
        }
        Err(Error::PoolExhausted)
    }

    pub(crate) fn unpin(&self, block: u64) {
        let seg = block >> self.segment_bits;
        let mut inner = self.inner.lock();
        let f = inner
            .frames
            .get_mut(&seg)
            .expect("unpin of an unmapped segment");
        debug_assert!(f.pin > 0);
        f.pin -= 1;
    }

    /// Write back every resident segment. Called on manager close.
    pub(crate) fn flush_all(&self) {
        let inner = self.inner.lock();
        for (seg, f) in inner.frames.iter() {
            if let Err(e) = f.map.flush() {
                log::warn!("pool flush of segment {} failed: {}", seg, e);
            }
        }
    }

    /// Whether no segment is pinned. Diagnostic.
    pub(crate) fn quiesced(&self) -> bool {
        self.inner.lock().frames.values().all(|f| f.pin == 0)
    }
}
