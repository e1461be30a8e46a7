//! B+tree algorithms.
//!
//! Point operations descend from the root block recorded in the
//! superblock, hand over hand: the child is latched before the parent
//! latch is dropped, so at most two latches are held during a search.
//! A node whose keys are all below the search key is crossed sideways
//! through its right sibling before descending; this is what keeps
//! lookups linearizable across concurrent splits, which move the upper
//! half of a node to a new right sibling before the parent learns
//! about it.
//!
//! Splits write-latch the full node and the freshly allocated right
//! node, link the sibling chain, then release both and re-descend from
//! the root to fix the parent: a new separator for the lower half is
//! inserted, and the separator that already routed the node — located
//! by the child it carries, since its key may sit above the node's
//! maximum once deletes have loosened it — is handed over to the new
//! sibling in place. Releasing first matters: a descender already
//! holding the parent may be waiting on the split node, and the
//! half-split state is searchable through the sibling link in the
//! meantime. If the split node was the root, a new root is built and
//! installed with a compare-exchange on the superblock's root pointer.
//!
//! Structural races (a recycled block, a failed latch upgrade, a lost
//! root install) unwind to the top of the operation and retry; no
//! latches are held across a retry.
//!
//! Deletes tombstone in place. A leaf whose last live entry goes away
//! is reclaimed: under write latches on the parent, the left sibling,
//! and the leaf, the sibling chain is routed around the block, the
//! parent separator is tombstoned, and the block goes on the free
//! list. A freed block keeps its right sibling link so a reader that
//! already routed to it can step over it; because it is fully unlinked
//! before it is freed, recycling it cannot resurrect a stale path.

use std::collections::HashSet;
use std::sync::Arc;

use arrayvec::ArrayVec;

use crate::error::{Error, Result};
use crate::latch::LatchMode;
use crate::mgr::{BptHandle, Mgr, PageGuard};
use crate::node::NodeRef;
use crate::param;
use crate::util::AlignedBuf;

/// One descent attempt either finishes or asks the caller to restart.
enum Step<T> {
    Done(T),
    Retry,
}

/// Where the routing decision sends the descent next.
enum Route {
    Here,
    Sideways(u64),
    Down { child: u64, next_level: u8 },
    DeadEnd,
    WidenFence,
}

/// A fence key copied out of a node before its latch is dropped.
type FenceKey = ArrayVec<u8, 256>;

/// Summary returned by `BptHandle::check`.
#[derive(Debug, Clone, Copy)]
pub struct TreeCheck {
    /// Root level; 0 for a single-leaf tree.
    pub height: u8,
    /// Live keys across all leaves.
    pub leaf_keys: u64,
    /// Blocks reachable from the root through live separators.
    pub reachable_blocks: u64,
    /// Blocks on the free list.
    pub free_blocks: u64,
    /// The allocator's bump cursor.
    pub next_free: u64,
}

impl BptHandle {
    /// Inserts `key` at `level` with a 48-bit `value`. Level 0 is the
    /// leaf level; interior levels are used by split propagation. An
    /// existing live key has its value overwritten in place; a
    /// tombstoned one is resurrected.
    pub fn insert_key(&mut self, key: &[u8], level: u8, value: u64) -> Result<()> {
        if key.len() > param::max_key_len(self.mgr.node_bits()) {
            return Err(Error::KeyTooLong);
        }
        if value > param::MAX_NODENO {
            return Err(Error::ValueRange);
        }
        let mgr = Arc::clone(&self.mgr);
        self.insert_inner(&mgr, key, level, value)
    }

    /// Deletes `key` at `level`. Absent or already-deleted keys leave
    /// the tree unchanged and report `KeyAbsent`.
    pub fn delete_key(&mut self, key: &[u8], level: u8) -> Result<()> {
        if key.len() > param::max_key_len(self.mgr.node_bits()) {
            return Err(Error::KeyAbsent);
        }
        let mgr = Arc::clone(&self.mgr);
        let (reclaim, block) = loop {
            match self.load_node(&mgr, key, level, LatchMode::Write, false)? {
                Step::Retry => continue,
                Step::Done(mut g) => {
                    let (pos, present) = {
                        let n = g.node();
                        let pos = n.find_ge(key);
                        let present =
                            pos <= n.key_count() && n.key(pos) == key && !n.slot_is_dead(pos);
                        (pos, present)
                    };
                    if !present {
                        return Err(Error::KeyAbsent);
                    }
                    g.node_mut().tombstone(pos);
                    let empty = g.node().active_count() == 0;
                    let block = g.block();
                    break (empty && level == 0 && block != mgr.sb().root(), block);
                }
            }
        };
        if reclaim {
            // The delete itself already succeeded; reclamation is
            // best-effort and its failures only leave an empty leaf in
            // place.
            if let Err(e) = self.reclaim_leaf(&mgr, key, level, block) {
                log::warn!("leaf reclamation of block {} failed: {}", block, e);
            }
        }
        Ok(())
    }

    /// Point lookup. Returns the stored value, or 0 when the key is
    /// absent or tombstoned.
    pub fn find_key(&mut self, key: &[u8]) -> Result<u64> {
        if key.len() > param::max_key_len(self.mgr.node_bits()) {
            return Ok(0);
        }
        let mgr = Arc::clone(&self.mgr);
        loop {
            match self.load_node(&mgr, key, 0, LatchMode::Read, false)? {
                Step::Retry => continue,
                Step::Done(g) => {
                    let n = g.node();
                    let pos = n.find_ge(key);
                    let value = if pos <= n.key_count() && n.key(pos) == key && !n.slot_is_dead(pos)
                    {
                        n.value(pos)
                    } else {
                        0
                    };
                    return Ok(value);
                }
            }
        }
    }

    /// Positions the cursor at the smallest live leaf slot `>= prefix`
    /// and returns its 1-based slot id, or 0 if the tree holds nothing
    /// at or beyond the prefix. The cursor is a private copy of the
    /// leaf; iteration is not snapshot-isolated.
    pub fn first_key(&mut self, prefix: &[u8]) -> Result<u32> {
        let mgr = Arc::clone(&self.mgr);
        loop {
            match self.load_node(&mgr, prefix, 0, LatchMode::Read, false)? {
                Step::Retry => continue,
                Step::Done(g) => {
                    self.cursor.as_mut_slice().copy_from_slice(g.bytes());
                    self.cursor_block = g.block();
                    drop(g);
                    let start = NodeRef::new(self.cursor.as_slice()).find_ge(prefix);
                    return self.cursor_advance(&mgr, start);
                }
            }
        }
    }

    /// Advances past `slot`, following the sibling chain when the
    /// current leaf is exhausted. Returns 0 at the end of the tree.
    pub fn next_key(&mut self, slot: u32) -> Result<u32> {
        if slot == 0 || self.cursor_block == 0 {
            return Ok(0);
        }
        let mgr = Arc::clone(&self.mgr);
        self.cursor_advance(&mgr, slot + 1)
    }

    /// Key bytes under a cursor slot returned by `first_key`/`next_key`.
    pub fn cursor_key(&self, slot: u32) -> Option<&[u8]> {
        let n = NodeRef::new(self.cursor.as_slice());
        if self.cursor_block == 0 || slot == 0 || slot > n.key_count() {
            return None;
        }
        Some(n.key(slot))
    }

    /// Value under a cursor slot.
    pub fn cursor_value(&self, slot: u32) -> Option<u64> {
        let n = NodeRef::new(self.cursor.as_slice());
        if self.cursor_block == 0 || slot == 0 || slot > n.key_count() {
            return None;
        }
        Some(n.value(slot))
    }

    fn insert_inner(&mut self, mgr: &Mgr, key: &[u8], level: u8, value: u64) -> Result<()> {
        loop {
            match self.try_insert(mgr, key, level, value)? {
                Step::Done(()) => return Ok(()),
                Step::Retry => continue,
            }
        }
    }

    fn try_insert(&mut self, mgr: &Mgr, key: &[u8], level: u8, value: u64) -> Result<Step<()>> {
        let mut g = match self.load_node(mgr, key, level, LatchMode::Write, true)? {
            Step::Done(g) => g,
            Step::Retry => return Ok(Step::Retry),
        };
        let (pos, exact, dead) = {
            let n = g.node();
            let pos = n.find_ge(key);
            let exact = pos <= n.key_count() && n.key(pos) == key;
            (pos, exact, exact && n.slot_is_dead(pos))
        };
        if exact {
            let mut n = g.node_mut();
            if dead {
                n.resurrect(pos, value);
            } else {
                n.set_value(pos, value);
            }
            return Ok(Step::Done(()));
        }
        if !g.node().room_for(key.len()) {
            if g.node().fits_after_compact(key.len()) {
                let scratch = self.frame.as_mut_slice();
                g.node_mut().compact(scratch);
            } else {
                self.split(mgr, g)?;
                return Ok(Step::Retry);
            }
        }
        let mut n = g.node_mut();
        let pos = n.as_ref().find_ge(key);
        n.insert_at(pos, key, value);
        Ok(Step::Done(()))
    }

    /// Descends to the node responsible for `key` at `level`, latched
    /// in `mode`. With `widen` set (inserts), a rightmost interior node
    /// whose fence is below the key gets its fence widened on the way
    /// down so separators stay upper bounds.
    fn load_node<'m>(
        &mut self,
        mgr: &'m Mgr,
        key: &[u8],
        level: u8,
        mode: LatchMode,
        widen: bool,
    ) -> Result<Step<PageGuard<'m>>> {
        let mut block = mgr.sb().root();
        let mut expected: Option<u8> = None;
        let mut prev: Option<PageGuard<'m>> = None;
        loop {
            let want = match expected {
                Some(l) if l == level => mode,
                _ => LatchMode::Read,
            };
            let mut g = mgr.pin_page(block, want)?;
            let _ = prev.take();

            // A free node is stale chain debris: note its successor,
            // release it, then hop. Never wait on another latch while
            // holding a free node; recycled blocks can point anywhere.
            let (is_free, right) = {
                let n = g.node();
                (n.is_free(), n.right())
            };
            if is_free {
                drop(g);
                if right == 0 {
                    return Ok(Step::Retry);
                }
                block = right;
                continue;
            }

            let lvl = g.node().level();
            match expected {
                // The block was freed and recycled at another level
                // while we walked to it.
                Some(e) if e != lvl => return Ok(Step::Retry),
                None => {
                    if lvl < level {
                        return Err(Error::Geometry("level above the root"));
                    }
                    if lvl == level && want != mode {
                        // The root sits at the target level; retake it
                        // in the requested mode and recheck.
                        drop(g);
                        g = mgr.pin_page(block, mode)?;
                        let n = g.node();
                        if n.is_free() || n.level() != lvl {
                            return Ok(Step::Retry);
                        }
                    }
                }
                Some(_) => {}
            }
            expected = Some(lvl);

            let route = {
                let n = g.node();
                let count = n.key_count();
                if count > 0 && n.key(count) < key && n.right() != 0 {
                    Route::Sideways(n.right())
                } else if lvl == level {
                    Route::Here
                } else {
                    match n.next_live(n.find_ge(key)) {
                        Some(s) => Route::Down {
                            child: n.value(s),
                            next_level: lvl - 1,
                        },
                        // Only tombstoned separators at or above the
                        // key: its old subtree was reclaimed. The
                        // right sibling's leftmost subtree covers the
                        // range now.
                        None if n.right() != 0 => Route::Sideways(n.right()),
                        None => {
                            if widen {
                                Route::WidenFence
                            } else {
                                // Reads settle for the rightmost live
                                // separator; the key cannot be beyond
                                // it if it exists at all.
                                match n.last_live() {
                                    Some(s) => Route::Down {
                                        child: n.value(s),
                                        next_level: lvl - 1,
                                    },
                                    None => Route::DeadEnd,
                                }
                            }
                        }
                    }
                }
            };
            match route {
                Route::Here => return Ok(Step::Done(g)),
                Route::Sideways(r) => {
                    block = r;
                    prev = Some(g);
                }
                Route::Down { child, next_level } => {
                    block = child;
                    expected = Some(next_level);
                    prev = Some(g);
                }
                Route::DeadEnd => return Ok(Step::Retry),
                Route::WidenFence => match self.widen_fence(mgr, g, key)? {
                    Step::Done((g2, child)) => {
                        block = child;
                        expected = Some(lvl - 1);
                        prev = Some(g2);
                    }
                    Step::Retry => return Ok(Step::Retry),
                },
            }
        }
    }

    /// Replaces the last live separator of a rightmost interior node
    /// with `key`, keeping the same child, so the fence stays an upper
    /// bound for the insert descending past it. Requires turning the
    /// read latch into a write latch; contention restarts the insert.
    fn widen_fence<'m>(
        &mut self,
        mgr: &Mgr,
        mut g: PageGuard<'m>,
        key: &[u8],
    ) -> Result<Step<(PageGuard<'m>, u64)>> {
        if g.mode() == LatchMode::Read && !g.upgrade() {
            return Ok(Step::Retry);
        }
        let (child, old_fence, fits, needs_compact) = {
            let n = g.node();
            if n.right() != 0 {
                return Ok(Step::Retry);
            }
            let last = match n.last_live() {
                Some(s) => s,
                None => return Ok(Step::Retry),
            };
            if !(n.key(last) < key) {
                // Another insert already widened past us; retry routes
                // through the fresh fence.
                return Ok(Step::Retry);
            }
            let mut old_fence = FenceKey::new();
            old_fence
                .try_extend_from_slice(n.key(last))
                .expect("fence key within bounds");
            let fits = n.room_for(key.len());
            (
                n.value(last),
                old_fence,
                fits,
                !fits && n.fits_after_compact(key.len()),
            )
        };
        if !fits && !needs_compact {
            self.split(mgr, g)?;
            return Ok(Step::Retry);
        }
        if needs_compact {
            let scratch = self.frame.as_mut_slice();
            g.node_mut().compact(scratch);
        }
        {
            let mut n = g.node_mut();
            let pos = n.as_ref().find_ge(key);
            if pos <= n.as_ref().key_count() && n.as_ref().key(pos) == key {
                // A reclaimed separator with this exact key; bring it
                // back, routing to the surviving child.
                n.resurrect(pos, child);
            } else {
                n.insert_at(pos, key, child);
            }
            let old_pos = n.as_ref().find_ge(&old_fence);
            debug_assert_eq!(n.as_ref().key(old_pos), &old_fence[..]);
            n.tombstone(old_pos);
        }
        Ok(Step::Done((g, child)))
    }

    /// Splits a full, write-latched node: upper half to a new right
    /// sibling, then the parent gains a separator for the lower half
    /// and hands the old one over to the sibling, both by re-descending
    /// from the root. A new root is built instead if this node was the
    /// root. The caller restarts its own insert afterwards.
    fn split(&mut self, mgr: &Mgr, mut g: PageGuard<'_>) -> Result<()> {
        debug_assert_eq!(g.mode(), LatchMode::Write);
        let xblock = g.block();

        {
            let scratch = self.frame.as_mut_slice();
            g.node_mut().compact(scratch);
        }
        let (level, count, split, old_right) = {
            let n = g.node();
            (n.level(), n.key_count(), n.split_point(), n.right())
        };
        let (f_lo, f_hi) = {
            let n = g.node();
            let mut lo = FenceKey::new();
            let mut hi = FenceKey::new();
            lo.try_extend_from_slice(n.key(split))
                .expect("fence key within bounds");
            hi.try_extend_from_slice(n.key(count))
                .expect("fence key within bounds");
            (lo, hi)
        };

        let nblock = mgr.alloc_block()?;
        let mut ng = mgr.pin_page(nblock, LatchMode::Write)?;
        {
            let src = g.node();
            let mut rn = ng.node_mut();
            rn.init(level);
            rn.fill_from(&src, split + 1, count);
            rn.set_right(old_right);
        }
        {
            let scratch = self.frame.as_mut_slice();
            let mut n = g.node_mut();
            n.rebuild(split, scratch);
            n.set_right(nblock);
        }
        log::trace!(
            "split block {} level {}: new sibling {}",
            xblock,
            level,
            nblock
        );

        if xblock == mgr.sb().root() {
            let rblock = mgr.alloc_block()?;
            let mut rg = mgr.pin_page(rblock, LatchMode::Write)?;
            {
                let mut r = rg.node_mut();
                r.init(level + 1);
                r.insert_at(1, &f_lo, xblock);
                r.insert_at(2, &f_hi, nblock);
            }
            if mgr.sb().install_root(xblock, rblock) {
                log::trace!("new root {} at level {}", rblock, level + 1);
                return Ok(());
            }
            // Lost the root race; recycle the would-be root and fall
            // through to ordinary separator propagation.
            {
                let mut r = rg.node_mut();
                mgr.push_free(rblock, &mut r)?;
            }
        }

        // Release both halves before touching the parent: a descender
        // already holding the parent may be waiting on this node, and
        // the half-split state stays searchable through the sibling
        // link.
        drop(ng);
        drop(g);
        // Lower separator first: until the old separator is repointed,
        // keys above the split still reach the new sibling by routing
        // to the old node and following its sibling link.
        self.insert_inner(mgr, &f_lo, level + 1, xblock)?;
        self.repoint_separator(mgr, &f_hi, level + 1, xblock, nblock)?;
        Ok(())
    }

    /// Hands the separator that routed a split node's upper half over
    /// to the new right sibling. The separator's key may sit above the
    /// node's pre-split maximum (deletes never tighten fences), so it
    /// is located by the child it carries, not by key, and its value
    /// is swapped in place; inserting a fresh separator keyed on the
    /// old maximum would leave the loose one behind and make the old
    /// node reachable twice. Walks right if a parent split moved the
    /// separator; if it is gone altogether (the subtree was reclaimed
    /// underneath us), a fresh exact separator keeps the new node
    /// reachable.
    fn repoint_separator(
        &mut self,
        mgr: &Mgr,
        key: &[u8],
        level: u8,
        from: u64,
        to: u64,
    ) -> Result<()> {
        'restart: loop {
            let mut g = match self.load_node(mgr, key, level, LatchMode::Write, false)? {
                Step::Retry => continue,
                Step::Done(g) => g,
            };
            loop {
                let (hit, right) = {
                    let n = g.node();
                    let mut hit = None;
                    for s in n.find_ge(key)..=n.key_count() {
                        if !n.slot_is_dead(s) && n.value(s) == from {
                            hit = Some(s);
                            break;
                        }
                    }
                    (hit, n.right())
                };
                if let Some(s) = hit {
                    g.node_mut().set_value(s, to);
                    return Ok(());
                }
                if right == 0 {
                    drop(g);
                    return self.insert_inner(mgr, key, level, to);
                }
                let next = mgr.pin_page(right, LatchMode::Write)?;
                drop(g);
                g = next;
                let stale = {
                    let n = g.node();
                    n.is_free() || n.level() != level
                };
                if stale {
                    continue 'restart;
                }
            }
        }
    }

    /// Reclaims an emptied leaf: under write latches on the parent,
    /// the left neighbor, and the leaf itself, the neighbor's sibling
    /// link is routed around the leaf, the parent separator is
    /// tombstoned, and the block goes on the free list. Unlinking
    /// everything before freeing is what makes recycling safe: once
    /// the latches drop, nothing reaches the block any more, and a
    /// reader that already holds a stale route crosses the FREE node
    /// by its still-intact sibling link.
    ///
    /// Gives up, leaving a plain (and reusable) empty leaf in place,
    /// when the leaf has no left neighbor under the same parent, when
    /// the separator is the parent's last, or when anything changed
    /// since the delete.
    fn reclaim_leaf(&mut self, mgr: &Mgr, key: &[u8], level: u8, leaf: u64) -> Result<()> {
        loop {
            let mut pg = match self.load_node(mgr, key, level + 1, LatchMode::Write, false)? {
                Step::Retry => continue,
                Step::Done(g) => g,
            };
            let (sep, left) = {
                let n = pg.node();
                let sep = match n.next_live(n.find_ge(key)) {
                    Some(s) if n.value(s) == leaf && n.active_count() > 1 => s,
                    _ => return Ok(()),
                };
                let prev = (1..sep).rev().find(|&s| !n.slot_is_dead(s));
                match prev {
                    // Separator pairs can point at one block while a
                    // split propagation is in flight; latching it twice
                    // would wedge this thread.
                    Some(p) if n.value(p) != leaf => (sep, n.value(p)),
                    _ => return Ok(()),
                }
            };
            // Parent, then left neighbor, then the leaf: the same
            // directions every descent and sideways walk take.
            let mut lg = mgr.pin_page(left, LatchMode::Write)?;
            {
                let n = lg.node();
                if n.is_free() || n.level() != level || n.right() != leaf {
                    return Ok(());
                }
            }
            let mut fg = mgr.pin_page(leaf, LatchMode::Write)?;
            {
                let n = fg.node();
                if n.is_free() || n.level() != level || n.active_count() != 0 {
                    return Ok(());
                }
            }
            let successor = fg.node().right();
            lg.node_mut().set_right(successor);
            lg.node_mut().mark_dirty();
            pg.node_mut().tombstone(sep);
            {
                let mut n = fg.node_mut();
                mgr.push_free(leaf, &mut n)?;
            }
            log::trace!("reclaimed leaf {}", leaf);
            return Ok(());
        }
    }

    /// Moves the iteration cursor to the first live slot at or after
    /// `slot`, hopping right siblings (and over freed blocks) as
    /// needed.
    fn cursor_advance(&mut self, mgr: &Mgr, mut slot: u32) -> Result<u32> {
        loop {
            let (is_free, level, right, live) = {
                let n = NodeRef::new(self.cursor.as_slice());
                (n.is_free(), n.level(), n.right(), n.next_live(slot))
            };
            if !is_free {
                if level != 0 {
                    // A stale hop landed on a recycled block that is no
                    // longer a leaf; the chain is gone, end here.
                    return Ok(0);
                }
                if let Some(s) = live {
                    return Ok(s);
                }
            }
            if right == 0 {
                return Ok(0);
            }
            let g = mgr.pin_page(right, LatchMode::Read)?;
            self.cursor.as_mut_slice().copy_from_slice(g.bytes());
            self.cursor_block = g.block();
            drop(g);
            slot = 1;
        }
    }

    /// Full-tree consistency check: key ordering inside every node,
    /// separators as upper bounds, the leaf sibling chain, and block
    /// accounting against the allocator. Meant for quiesced trees
    /// (tests, offline inspection); it takes ordinary read latches.
    pub fn check(&mut self) -> Result<TreeCheck> {
        let mgr = Arc::clone(&self.mgr);
        let root = mgr.sb().root();
        let mut visited = HashSet::new();
        let (_, leaf_keys, height) = self.check_node(&mgr, root, None, &mut visited)?;

        // Leaf chain: every live key once, ascending, terminating.
        let next_free = mgr.sb().next_free();
        let mut chained = 0u64;
        let mut last: Option<FenceKey> = None;
        let mut block = self.leftmost_leaf(&mgr, root)?;
        let mut hops = 0u64;
        while block != 0 {
            if hops > next_free {
                return Err(Error::Corrupt("leaf chain does not terminate"));
            }
            hops += 1;
            let copy = self.copy_block(&mgr, block)?;
            let n = NodeRef::new(copy.as_slice());
            let right = n.right();
            if !n.is_free() {
                for s in 1..=n.key_count() {
                    if n.slot_is_dead(s) {
                        continue;
                    }
                    if let Some(prev) = &last {
                        if !(&prev[..] < n.key(s)) {
                            return Err(Error::Corrupt("leaf chain out of order"));
                        }
                    }
                    let mut k = FenceKey::new();
                    k.try_extend_from_slice(n.key(s))
                        .expect("key within bounds");
                    last = Some(k);
                    chained += 1;
                }
            }
            block = right;
        }
        if chained != leaf_keys {
            return Err(Error::Corrupt("leaf chain misses keys"));
        }

        // Free-list accounting.
        let mut free_blocks = 0u64;
        let mut cur = mgr.sb().free_head();
        while cur != 0 {
            if free_blocks > next_free {
                return Err(Error::Corrupt("free list does not terminate"));
            }
            free_blocks += 1;
            let copy = self.copy_block(&mgr, cur)?;
            let n = NodeRef::new(copy.as_slice());
            if !n.is_free() {
                return Err(Error::Corrupt("free list holds a live block"));
            }
            cur = n.free_next();
        }
        // Blocks 0 and 1 are outside both sets.
        if visited.len() as u64 + free_blocks + 2 != next_free {
            return Err(Error::Corrupt("allocated blocks leaked"));
        }

        Ok(TreeCheck {
            height,
            leaf_keys,
            reachable_blocks: visited.len() as u64,
            free_blocks,
            next_free,
        })
    }

    /// Recursive structure check below `block`. Returns the largest
    /// live key of the subtree, its live-key count, and the level.
    fn check_node(
        &mut self,
        mgr: &Mgr,
        block: u64,
        upper: Option<&[u8]>,
        visited: &mut HashSet<u64>,
    ) -> Result<(Option<FenceKey>, u64, u8)> {
        if !visited.insert(block) {
            return Err(Error::Corrupt("block reachable twice"));
        }
        let copy = self.copy_block(mgr, block)?;
        let n = NodeRef::new(copy.as_slice());
        if n.is_free() {
            return Err(Error::Corrupt("free block reachable from a parent"));
        }
        for s in 2..=n.key_count() {
            if !(n.key(s - 1) < n.key(s)) {
                return Err(Error::Corrupt("slot keys not strictly ascending"));
            }
        }
        if let (Some(upper), Some(last)) = (upper, n.last_live()) {
            if !(n.key(last) <= upper) {
                return Err(Error::Corrupt("key above its parent separator"));
            }
        }
        if n.level() == 0 {
            let live = n.active_count() as u64;
            let max = n.last_live().map(|s| {
                let mut k = FenceKey::new();
                k.try_extend_from_slice(n.key(s)).expect("key within bounds");
                k
            });
            return Ok((max, live, 0));
        }
        let mut keys = 0u64;
        let mut max: Option<FenceKey> = None;
        for s in 1..=n.key_count() {
            if n.slot_is_dead(s) {
                continue;
            }
            let (child_max, child_keys, child_level) =
                self.check_node(mgr, n.value(s), Some(n.key(s)), visited)?;
            if child_level != n.level() - 1 {
                return Err(Error::Corrupt("child level mismatch"));
            }
            keys += child_keys;
            // Children are visited left to right, so the last
            // non-empty subtree carries the maximum.
            if let Some(m) = child_max {
                max = Some(m);
            }
        }
        Ok((max, keys, n.level()))
    }

    /// Leftmost leaf of the tree, for the chain walk.
    fn leftmost_leaf(&mut self, mgr: &Mgr, root: u64) -> Result<u64> {
        let mut block = root;
        loop {
            let copy = self.copy_block(mgr, block)?;
            let n = NodeRef::new(copy.as_slice());
            if n.level() == 0 {
                return Ok(block);
            }
            match n.next_live(1) {
                Some(s) => block = n.value(s),
                None => return Err(Error::Corrupt("interior node with no live separator")),
            }
        }
    }

    /// Copies a block out under a short read latch.
    fn copy_block(&mut self, mgr: &Mgr, block: u64) -> Result<AlignedBuf> {
        let mut copy = AlignedBuf::zeroed(mgr.block_size());
        let g = mgr.pin_page(block, LatchMode::Read)?;
        copy.as_mut_slice().copy_from_slice(g.bytes());
        Ok(copy)
    }
}
