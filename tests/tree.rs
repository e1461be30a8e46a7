//! Single-threaded engine scenarios: point operations, splits,
//! deletion and reclamation, iteration, and the on-disk lifecycle.

use std::sync::Arc;

use bptree::{BptHandle, Error, Mgr};
use itertools::Itertools;
use tempfile::TempDir;

fn open_mgr(dir: &TempDir, node_bits: u32) -> Arc<Mgr> {
    // The latch table must fit inside block 0, so narrow blocks get a
    // smaller table.
    let latch_capacity = if node_bits < 11 { 12 } else { 96 };
    Arc::new(Mgr::open(dir.path().join("bpt.dat"), node_bits, 64, latch_capacity).unwrap())
}

fn bench_key(i: usize) -> Vec<u8> {
    format!("benchmark_{:08}", i).into_bytes()
}

#[test]
fn empty_tree_find() {
    let dir = TempDir::new().unwrap();
    let mgr = open_mgr(&dir, 12);
    let mut h = BptHandle::new(&mgr);
    assert_eq!(h.find_key(b"anything").unwrap(), 0);
    assert!(mgr.is_idle());
}

#[test]
fn point_ops_small() {
    let dir = TempDir::new().unwrap();
    let mgr = open_mgr(&dir, 12);
    let mut h = BptHandle::new(&mgr);
    h.insert_key(b"a", 0, 1).unwrap();
    h.insert_key(b"b", 0, 2).unwrap();
    h.insert_key(b"c", 0, 3).unwrap();
    assert_eq!(h.find_key(b"b").unwrap(), 2);
    assert_eq!(h.find_key(b"d").unwrap(), 0);
    assert!(mgr.is_idle());
}

#[test]
fn single_key_lifecycle() {
    let dir = TempDir::new().unwrap();
    let mgr = open_mgr(&dir, 12);
    let mut h = BptHandle::new(&mgr);
    h.insert_key(b"solo", 0, 42).unwrap();
    assert_eq!(h.find_key(b"solo").unwrap(), 42);
    h.delete_key(b"solo", 0).unwrap();
    assert_eq!(h.find_key(b"solo").unwrap(), 0);
    // Deleting again reports absence and changes nothing.
    assert!(matches!(h.delete_key(b"solo", 0), Err(Error::KeyAbsent)));
    let check = h.check().unwrap();
    assert_eq!(check.leaf_keys, 0);
}

#[test]
fn duplicate_insert_overwrites() {
    let dir = TempDir::new().unwrap();
    let mgr = open_mgr(&dir, 12);
    let mut h = BptHandle::new(&mgr);
    h.insert_key(b"k", 0, 10).unwrap();
    h.insert_key(b"k", 0, 20).unwrap();
    assert_eq!(h.find_key(b"k").unwrap(), 20);
    let check = h.check().unwrap();
    assert_eq!(check.leaf_keys, 1);
}

#[test]
fn delete_then_reinsert_resurrects() {
    let dir = TempDir::new().unwrap();
    let mgr = open_mgr(&dir, 12);
    let mut h = BptHandle::new(&mgr);
    h.insert_key(b"phoenix", 0, 5).unwrap();
    h.delete_key(b"phoenix", 0).unwrap();
    h.insert_key(b"phoenix", 0, 6).unwrap();
    assert_eq!(h.find_key(b"phoenix").unwrap(), 6);
    assert_eq!(h.check().unwrap().leaf_keys, 1);
}

#[test]
fn bulk_insert_and_find() {
    let dir = TempDir::new().unwrap();
    let mgr = open_mgr(&dir, 12);
    let mut h = BptHandle::new(&mgr);
    for i in 0..10_000usize {
        h.insert_key(&bench_key(i), 0, i as u64).unwrap();
    }
    assert_eq!(h.find_key(&bench_key(5_000)).unwrap(), 5_000);
    assert_eq!(h.find_key(&bench_key(9_999)).unwrap(), 9_999);
    let check = h.check().unwrap();
    assert_eq!(check.leaf_keys, 10_000);
    assert!(check.height >= 1);
    assert!(mgr.is_idle());
}

#[test]
fn delete_even_keys() {
    let dir = TempDir::new().unwrap();
    let mgr = open_mgr(&dir, 12);
    let mut h = BptHandle::new(&mgr);
    for i in 0..10_000usize {
        h.insert_key(&bench_key(i), 0, i as u64).unwrap();
    }
    for i in (0..10_000usize).step_by(2) {
        h.delete_key(&bench_key(i), 0).unwrap();
    }
    assert_eq!(h.find_key(&bench_key(5_000)).unwrap(), 0);
    assert_eq!(h.find_key(&bench_key(4_999)).unwrap(), 4_999);
    let check = h.check().unwrap();
    assert_eq!(check.leaf_keys, 5_000);
}

#[test]
fn splits_preserve_sorted_order() {
    // Small blocks force splits early and often; the in-order
    // traversal must equal the sorted insert set afterwards.
    let dir = TempDir::new().unwrap();
    let mgr = open_mgr(&dir, 9);
    let mut h = BptHandle::new(&mgr);
    // Insert in a scrambled but deterministic order.
    for i in 0..2_000usize {
        let j = (i * 7919) % 2_000;
        h.insert_key(&bench_key(j), 0, j as u64 + 1).unwrap();
    }
    let check = h.check().unwrap();
    assert_eq!(check.leaf_keys, 2_000);

    let mut keys = Vec::new();
    let mut slot = h.first_key(b"").unwrap();
    while slot != 0 {
        keys.push(h.cursor_key(slot).unwrap().to_vec());
        slot = h.next_key(slot).unwrap();
    }
    assert_eq!(keys.len(), 2_000);
    assert!(
        keys.iter().tuple_windows().all(|(a, b)| a < b),
        "iteration out of order"
    );
}

#[test]
fn deep_tree_lookups() {
    // Narrow blocks and enough keys to force at least three levels.
    let dir = TempDir::new().unwrap();
    let mgr = open_mgr(&dir, 9);
    let mut h = BptHandle::new(&mgr);
    for i in 0..5_000usize {
        h.insert_key(&bench_key(i), 0, i as u64 + 1).unwrap();
    }
    let check = h.check().unwrap();
    assert!(check.height >= 2, "tree stayed at height {}", check.height);
    for i in [0usize, 1, 2_499, 4_998, 4_999] {
        assert_eq!(h.find_key(&bench_key(i)).unwrap(), i as u64 + 1);
    }
}

#[test]
fn key_length_bounds() {
    let dir = TempDir::new().unwrap();
    let mgr = open_mgr(&dir, 12);
    let mut h = BptHandle::new(&mgr);

    h.insert_key(b"", 0, 7).unwrap();
    assert_eq!(h.find_key(b"").unwrap(), 7);

    h.insert_key(b"x", 0, 8).unwrap();
    assert_eq!(h.find_key(b"x").unwrap(), 8);

    let long = vec![0xabu8; 255];
    h.insert_key(&long, 0, 9).unwrap();
    assert_eq!(h.find_key(&long).unwrap(), 9);

    let too_long = vec![0xabu8; 256];
    assert!(matches!(
        h.insert_key(&too_long, 0, 1),
        Err(Error::KeyTooLong)
    ));
    assert_eq!(h.find_key(&too_long).unwrap(), 0);
}

#[test]
fn value_range_enforced() {
    let dir = TempDir::new().unwrap();
    let mgr = open_mgr(&dir, 12);
    let mut h = BptHandle::new(&mgr);
    assert!(matches!(
        h.insert_key(b"big", 0, 1u64 << 48),
        Err(Error::ValueRange)
    ));
    h.insert_key(b"big", 0, (1u64 << 48) - 1).unwrap();
    assert_eq!(h.find_key(b"big").unwrap(), (1u64 << 48) - 1);
}

#[test]
fn iteration_in_order() {
    let dir = TempDir::new().unwrap();
    let mgr = open_mgr(&dir, 12);
    let mut h = BptHandle::new(&mgr);
    h.insert_key(b"k01", 0, 1).unwrap();
    h.insert_key(b"k02", 0, 2).unwrap();
    h.insert_key(b"k03", 0, 3).unwrap();

    let s1 = h.first_key(b"k").unwrap();
    assert_ne!(s1, 0);
    assert_eq!(h.cursor_key(s1).unwrap(), b"k01");
    assert_eq!(h.cursor_value(s1).unwrap(), 1);

    let s2 = h.next_key(s1).unwrap();
    assert_eq!(h.cursor_key(s2).unwrap(), b"k02");
    let s3 = h.next_key(s2).unwrap();
    assert_eq!(h.cursor_key(s3).unwrap(), b"k03");
    assert_eq!(h.next_key(s3).unwrap(), 0);
}

#[test]
fn iteration_skips_tombstones() {
    let dir = TempDir::new().unwrap();
    let mgr = open_mgr(&dir, 12);
    let mut h = BptHandle::new(&mgr);
    for key in [&b"a"[..], b"b", b"c", b"d"] {
        h.insert_key(key, 0, 1).unwrap();
    }
    h.delete_key(b"b", 0).unwrap();
    h.delete_key(b"d", 0).unwrap();

    let s1 = h.first_key(b"").unwrap();
    assert_eq!(h.cursor_key(s1).unwrap(), b"a");
    let s2 = h.next_key(s1).unwrap();
    assert_eq!(h.cursor_key(s2).unwrap(), b"c");
    assert_eq!(h.next_key(s2).unwrap(), 0);
}

#[test]
fn emptied_leaves_are_reclaimed_and_reused() {
    let dir = TempDir::new().unwrap();
    let mgr = open_mgr(&dir, 9);
    let mut h = BptHandle::new(&mgr);
    for i in 0..2_000usize {
        h.insert_key(&bench_key(i), 0, i as u64 + 1).unwrap();
    }
    // Empty a whole band of leaves in the middle.
    for i in 500..1_500usize {
        h.delete_key(&bench_key(i), 0).unwrap();
    }
    let after_delete = h.check().unwrap();
    assert!(after_delete.free_blocks > 0, "no leaves were reclaimed");
    assert_eq!(after_delete.leaf_keys, 1_000);

    // Refill; the allocator must hand reclaimed blocks back out.
    for i in 500..1_500usize {
        h.insert_key(&bench_key(i), 0, i as u64 + 1).unwrap();
    }
    let refilled = h.check().unwrap();
    assert_eq!(refilled.leaf_keys, 2_000);
    assert!(refilled.free_blocks < after_delete.free_blocks + 10);
    for i in [500usize, 999, 1_499] {
        assert_eq!(h.find_key(&bench_key(i)).unwrap(), i as u64 + 1);
    }
}

#[test]
fn split_under_loosened_fence() {
    // Deleting a leaf's maximum key leaves the parent separator loose:
    // nothing tightens fences. A later split of that refilled leaf
    // must hand the loose separator over to the new sibling instead of
    // keying a fresh one on the (smaller) current maximum, or the old
    // leaf ends up reachable through two live separators.
    let dir = TempDir::new().unwrap();
    let mgr = open_mgr(&dir, 9);
    let mut h = BptHandle::new(&mgr);

    // Sparse keys: room to insert between any two neighbors.
    for i in 0..300usize {
        let key = format!("a{:04}", i * 10);
        h.insert_key(key.as_bytes(), 0, i as u64 + 1).unwrap();
    }

    // The first leaf's last key is the fence its parent records: walk
    // the cursor until the slot id resets, which marks the leaf hop.
    let mut slot = h.first_key(b"").unwrap();
    assert_ne!(slot, 0);
    let mut fence = h.cursor_key(slot).unwrap().to_vec();
    let mut leaf_entries = 1u32;
    loop {
        let next = h.next_key(slot).unwrap();
        assert_ne!(next, 0, "expected more than one leaf");
        if next <= slot {
            break;
        }
        fence = h.cursor_key(next).unwrap().to_vec();
        leaf_entries += 1;
        slot = next;
    }
    assert!(leaf_entries > 2, "first leaf is implausibly small");

    // Loosen the fence, then refill strictly below it until the leaf
    // splits. 0x21 ('!') sorts below the '0' it replaces, so every
    // refill key stays inside the old fence's range.
    h.delete_key(&fence, 0).unwrap();
    let mut refill = Vec::new();
    for j in 0..60u32 {
        let mut key = fence.clone();
        key.truncate(key.len() - 1);
        key.push(b'!');
        key.extend_from_slice(format!("{:02}", j).as_bytes());
        assert!(key.as_slice() < fence.as_slice());
        h.insert_key(&key, 0, 1_000 + j as u64).unwrap();
        refill.push(key);
    }

    let check = h.check().unwrap();
    assert_eq!(check.leaf_keys, 300 - 1 + 60);
    for (j, key) in refill.iter().enumerate() {
        assert_eq!(h.find_key(key).unwrap(), 1_000 + j as u64);
    }
    assert_eq!(h.find_key(&fence).unwrap(), 0);
    assert_eq!(h.find_key(b"a0000").unwrap(), 1);
    assert_eq!(h.find_key(b"a2990").unwrap(), 300);
    assert!(mgr.is_idle());
}

#[test]
fn persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let mgr = open_mgr(&dir, 12);
        let mut h = BptHandle::new(&mgr);
        for i in 0..1_000usize {
            h.insert_key(&bench_key(i), 0, i as u64 + 1).unwrap();
        }
    }
    let mgr = open_mgr(&dir, 12);
    let mut h = BptHandle::new(&mgr);
    for i in [0usize, 500, 999] {
        assert_eq!(h.find_key(&bench_key(i)).unwrap(), i as u64 + 1);
    }
    assert_eq!(h.check().unwrap().leaf_keys, 1_000);
}

#[test]
fn geometry_validation() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        Mgr::open(dir.path().join("bad.dat"), 8, 64, 96),
        Err(Error::Geometry(_))
    ));
    assert!(matches!(
        Mgr::open(dir.path().join("bad.dat"), 16, 64, 96),
        Err(Error::Geometry(_))
    ));
    // A latch table that cannot fit inside block 0.
    assert!(matches!(
        Mgr::open(dir.path().join("bad.dat"), 9, 64, 96),
        Err(Error::Geometry(_))
    ));

    let _mgr = open_mgr(&dir, 12);
    // Reopening with mismatched node_bits is rejected.
    assert!(matches!(
        Mgr::open(dir.path().join("bpt.dat"), 11, 64, 96),
        Err(Error::Geometry(_))
    ));
}

#[test]
fn iostat_counts_pool_traffic() {
    let dir = TempDir::new().unwrap();
    // A tiny pool forces eviction traffic. Capacity stays above the
    // worst-case pins of a single operation (a root split holds three
    // nodes plus the allocator's transient pin).
    let mgr = Arc::new(Mgr::open(dir.path().join("bpt.dat"), 12, 6, 96).unwrap());
    let mut h = BptHandle::new(&mgr);
    for i in 0..10_000usize {
        h.insert_key(&bench_key(i), 0, i as u64 + 1).unwrap();
    }
    let stat = h.iostat();
    assert!(stat.pool_maps >= stat.pool_unmaps);
    assert!(stat.pool_unmaps > 0, "tiny pool never recycled a segment");
    assert!(stat.latch_hits > 0);
}
