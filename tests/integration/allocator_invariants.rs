use cachefsd::slab::SlabAllocator;
use cachefsd::store::SledStore;
use cachefsd::types::{BlockShift, GlobalParams};
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;

fn digest(n: u32) -> Vec<u8> {
    let mut d = vec![0u8; GlobalParams::default().digest_bytes()];
    d[..4].copy_from_slice(&n.to_be_bytes());
    d
}

fn allocator(dir: &tempfile::TempDir) -> SlabAllocator {
    let store = SledStore::open(&dir.path().join("db"), &GlobalParams::default()).unwrap();
    SlabAllocator::new(store, BlockShift(12))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn allocated_ranges_never_overlap(batches in prop::collection::vec(
        prop::collection::vec((0u32..40, 1u32..=16), 1..12),
        1..5,
    )) {
        let dir = tempfile::tempdir().unwrap();
        let alloc = allocator(&dir);
        for (i, batch) in batches.iter().enumerate() {
            let digests: Vec<Vec<u8>> = batch.iter().map(|(d, _)| digest(*d)).collect();
            let counts: Vec<u32> = batch.iter().map(|(_, c)| *c).collect();
            alloc.allocate_batch(&counts, &digests, &format!("owner{}", i)).unwrap();
        }

        let mut chunks = alloc.list_chunks().unwrap();
        chunks.sort_by_key(|c| (c.slab_id, c.addr));
        for pair in chunks.windows(2) {
            if pair[0].slab_id == pair[1].slab_id {
                prop_assert!(pair[0].addr + pair[0].blocks <= pair[1].addr);
            }
        }
        for c in &chunks {
            for a in c.addr..c.addr + c.blocks {
                let span = alloc.seek_containing_chunk(c.slab_id, a).unwrap();
                prop_assert_eq!(span.base, c.addr);
                prop_assert_eq!(hex::encode(&span.digest), c.digest.clone());
            }
        }
    }
}

#[test]
fn concurrent_allocation_of_one_digest_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let alloc = Arc::new(allocator(&dir));
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let alloc = alloc.clone();
            thread::spawn(move || {
                alloc
                    .allocate_batch(&[4, 2], &[digest(1), digest(100 + i)], &format!("tree{}", i))
                    .unwrap()
            })
        })
        .collect();
    let locs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()[0]).collect();
    assert!(locs.windows(2).all(|w| w[0] == w[1]));

    let rec = alloc.get_record(&digest(1)).unwrap();
    assert_eq!(rec.owners.len(), 8);
    assert_eq!(alloc.list_chunks().unwrap().len(), 9);
}

#[test]
fn allocations_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let first = {
        let alloc = allocator(&dir);
        alloc.allocate_batch(&[3], &[digest(7)], "tree").unwrap()[0]
    };
    let alloc = allocator(&dir);
    assert_eq!(alloc.lookup(&[digest(7)]).unwrap(), vec![first]);
    let next = alloc.allocate_batch(&[1], &[digest(8)], "tree").unwrap()[0];
    assert!(next.addr >= first.addr + 3);
}
