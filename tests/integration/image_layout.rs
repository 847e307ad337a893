use cachefsd::image::format::FT_DIR;
use cachefsd::image::{ImageBuilder, ImageView, SlabImage};
use cachefsd::manifest::{chunk_digest, Manifest, ManifestEntry};
use cachefsd::slab::SlabAllocator;
use cachefsd::store::SledStore;
use cachefsd::types::{BlockShift, GlobalParams};

const OWNER: &str = "0123456789abcdfghijklmnpqrsvwxyz";

fn manifest(params: &GlobalParams) -> (Manifest, Vec<u8>, Vec<u8>, Vec<u8>) {
    let b: Vec<u8> = (0..4096 + 37).map(|i| (i % 253) as u8).collect();
    let d: Vec<u8> = (0..3 * 4096).map(|i| (i % 241) as u8).collect();
    let chunked = vec![9u8; 70_000];
    let digests: Vec<Vec<u8>> = chunked
        .chunks(params.chunk_size() as usize)
        .map(|c| chunk_digest(c, params.digest_bytes()))
        .collect();
    let m = Manifest {
        params: None,
        entries: vec![
            ManifestEntry::directory("/"),
            ManifestEntry::inline_file("/a", b"hello".to_vec(), false),
            ManifestEntry::inline_file("/b", b.clone(), false),
            ManifestEntry::directory("/c"),
            ManifestEntry::inline_file("/c/d", d.clone(), true),
            ManifestEntry::chunked_file("/c/e", chunked.len() as u64, &digests, false),
            ManifestEntry::symlink("/c/link", "d"),
        ],
    };
    (m, b, d, chunked)
}

#[test]
fn built_image_matches_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let params = GlobalParams::default();
    let store = SledStore::open(&dir.path().join("db"), &params).unwrap();
    let alloc = SlabAllocator::new(store, BlockShift(12));
    let (m, b, d, _) = manifest(&params);

    let image = ImageBuilder::new(BlockShift(12), params.clone())
        .build(&m, OWNER, &alloc)
        .unwrap();
    let view = ImageView::new(&image).unwrap();
    let sb = view.superblock();
    assert!(sb.checksum_ok());
    assert_eq!((sb.blocks as u64) << 12, image.len() as u64);
    assert_eq!(sb.extra_devices, 1);

    let mut names: Vec<String> = view
        .read_dir(sb.root_nid as u64)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    assert_eq!(names, vec![".", "..", "a", "b", "c"]);

    assert_eq!(view.read_file(view.lookup("/a").unwrap()).unwrap(), b"hello");
    assert_eq!(view.read_file(view.lookup("/b").unwrap()).unwrap(), b);
    assert_eq!(view.read_file(view.lookup("/c/d").unwrap()).unwrap(), d);
    assert_eq!(view.read_file(view.lookup("/c/link").unwrap()).unwrap(), b"d");

    let c = view.read_dir(view.lookup("/c").unwrap()).unwrap();
    assert!(c.iter().any(|e| e.name == ".." && e.file_type == FT_DIR));

    // chunk indexes point at the allocator's locations, device = slab + 1
    let e = view.lookup("/c/e").unwrap();
    let indexes = view.chunk_indexes(e).unwrap();
    assert_eq!(indexes.len(), 2);
    let locs = alloc
        .lookup(
            &m.entries[5]
                .digest_list(params.digest_bytes())
                .unwrap(),
        )
        .unwrap();
    for (idx, loc) in indexes.iter().zip(&locs) {
        assert_eq!(idx.device_id, loc.slab_id + 1);
        assert_eq!(idx.blkaddr, loc.addr);
    }
    for loc in &locs {
        assert!(alloc.get_record(&alloc.seek_containing_chunk(loc.slab_id, loc.addr).unwrap().digest)
            .unwrap()
            .owners
            .contains(OWNER));
    }
}

#[test]
fn rebuilding_reuses_chunk_locations() {
    let dir = tempfile::tempdir().unwrap();
    let params = GlobalParams::default();
    let store = SledStore::open(&dir.path().join("db"), &params).unwrap();
    let alloc = SlabAllocator::new(store, BlockShift(12));
    let (m, _, _, _) = manifest(&params);
    let builder = ImageBuilder::new(BlockShift(12), params.clone());

    let first = builder.build(&m, OWNER, &alloc).unwrap();
    let count = alloc.list_chunks().unwrap().len();
    let second = builder.build(&m, "zyxwvsrqpnmlkjihgfdcba9876543210", &alloc).unwrap();
    assert_eq!(alloc.list_chunks().unwrap().len(), count);

    let idx = |img: &[u8]| {
        let view = ImageView::new(img).unwrap();
        view.chunk_indexes(view.lookup("/c/e").unwrap()).unwrap()
    };
    assert_eq!(idx(&first), idx(&second));
}

#[test]
fn slab_image_exposes_slab_file() {
    let img = SlabImage::new(2, BlockShift(12)).unwrap();
    let bytes = img.read_at(0, img.size()).unwrap();
    let view = ImageView::new(bytes).unwrap();
    let nid = view.lookup("/slab").unwrap();
    assert_eq!(view.inode(nid).unwrap().size, 1u64 << 40);
    let indexes = view.chunk_indexes(nid).unwrap();
    assert!(indexes.iter().all(|i| i.device_id == 1));
}
