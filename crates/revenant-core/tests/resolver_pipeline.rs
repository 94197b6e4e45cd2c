//! End-to-end pipeline tests on synthetic images: candidate proposal,
//! disambiguation, namespace assembly, file indexing, and restoration.

mod common;

use common::*;
use revenant_core::{EngineConfig, RecoveryEngine};

fn engine_for(image: &std::path::Path, work_dir: &std::path::Path) -> RecoveryEngine {
    let config = EngineConfig {
        use_caches: false,
        output_root: work_dir.join("out"),
        cache_dir: work_dir.to_path_buf(),
        ..EngineConfig::default()
    };
    RecoveryEngine::open(image, config).unwrap()
}

/// A deleted regular file whose directory entry survives on disk and
/// whose pre-deletion inode survives only in the journal
fn deleted_file_image() -> ImageBuilder {
    let mut img = ImageBuilder::new();

    // / (inode 2, block 30) -> A (inode 12, block 100) -> f (inode 13)
    img.set_inode(ROOT_INODE, &InodeSpec::directory(30));
    img.mark_inode_allocated(ROOT_INODE);
    img.set_block(30, &dir_start_block(ROOT_INODE, ROOT_INODE, &[(12, FT_DIR, "A")]));
    img.mark_block_allocated(30);

    img.set_inode(12, &InodeSpec::directory(100));
    img.mark_inode_allocated(12);
    img.set_block(100, &dir_start_block(12, ROOT_INODE, &[(13, FT_REG, "f")]));
    img.mark_block_allocated(100);

    // The current inode 13 is deleted: dtime set, pointers wiped.
    let mut deleted = InodeSpec::regular(5000, &[]);
    deleted.dtime = 1_300_000_000;
    deleted.links = 0;
    deleted.blocks512 = 0;
    img.set_inode(13, &deleted);

    // File content: five distinct data blocks.
    for (i, block) in (200..205).enumerate() {
        img.fill_block(block, b'A' + i as u8);
    }

    // The journal still holds the inode-table block from before the
    // deletion, where inode 13 is live and points at its data.
    let live = InodeSpec::regular(5000, &[200, 201, 202, 203, 204]);
    let mut snapshot = img.inode_table_block_bytes(6);
    snapshot[512..640].copy_from_slice(&live.encode());
    img.set_block(JOURNAL_FIRST_BLOCK + 1, &encode_descriptor_block(4, &[6]));
    img.set_block(JOURNAL_FIRST_BLOCK + 2, &snapshot);
    img.set_block(JOURNAL_FIRST_BLOCK + 3, &encode_commit_block(4));

    img
}

#[test]
fn test_stage1_proposes_directory_candidates() {
    let (dir, image) = deleted_file_image().build();
    let mut engine = engine_for(&image, dir.path());

    let stage1 = engine.stage1().unwrap();
    assert!(stage1.dir_inode_to_block[ROOT_INODE as usize].contains(30));
    assert!(stage1.dir_inode_to_block[12].contains(100));
    // Regular-file inodes get no candidates.
    assert!(stage1.dir_inode_to_block[13].is_empty());
}

#[test]
fn test_stage2_resolves_allocated_directories_to_their_first_block() {
    let (dir, image) = deleted_file_image().build();
    let mut engine = engine_for(&image, dir.path());

    let resolved = engine.resolve().unwrap();
    assert_eq!(resolved.dir_inode_to_block[ROOT_INODE as usize].first(), Some(30));
    assert_eq!(resolved.dir_inode_to_block[12].first(), Some(100));
    assert_eq!(resolved.namespace.path_of_inode(12), Some("A"));
    assert!(resolved.namespace.directories.contains_key(""));
    assert!(resolved.namespace.directories.contains_key("A"));
}

#[test]
fn test_file_index_maps_path_to_inode() {
    let (dir, image) = deleted_file_image().build();
    let mut engine = engine_for(&image, dir.path());

    let index = engine.file_index().unwrap();
    assert_eq!(index.path_to_inode.get("A/f"), Some(&13));
}

#[test]
fn test_restore_recovers_content_from_journal_inode() {
    let (dir, image) = deleted_file_image().build();
    let mut engine = engine_for(&image, dir.path());

    let status = engine.restore("A/f").unwrap();
    assert!(matches!(status, revenant_core::RestoreStatus::Restored));

    let restored = std::fs::read(dir.path().join("out/A/f")).unwrap();
    assert_eq!(restored.len(), 5000);
    // Four full blocks plus a 904-byte tail.
    assert!(restored[..1024].iter().all(|&b| b == b'A'));
    assert!(restored[1024..2048].iter().all(|&b| b == b'B'));
    assert!(restored[4096..].iter().all(|&b| b == b'E'));
    assert_eq!(restored[4096..].len(), 904);
}

#[test]
fn test_journal_only_directory_is_recovered() {
    let mut img = ImageBuilder::new();

    img.set_inode(ROOT_INODE, &InodeSpec::directory(30));
    img.mark_inode_allocated(ROOT_INODE);
    img.set_block(30, &dir_start_block(ROOT_INODE, ROOT_INODE, &[(20, FT_DIR, "B")]));
    img.mark_block_allocated(30);

    // B was deleted; its on-disk block 500 has been overwritten.
    let mut spec = InodeSpec::directory(0);
    spec.dtime = 1_300_000_000;
    spec.links = 0;
    img.set_inode(20, &spec);
    img.fill_block(500, 0xFF);

    // Its file g was deleted with it.
    let mut g = InodeSpec::regular(10, &[]);
    g.dtime = 1_300_000_000;
    img.set_inode(21, &g);

    // The last journal snapshot of block 500 still holds B's entries.
    let b_dir = dir_start_block(20, ROOT_INODE, &[(21, FT_REG, "g")]);
    img.set_block(JOURNAL_FIRST_BLOCK + 1, &encode_descriptor_block(4242, &[500]));
    img.set_block(JOURNAL_FIRST_BLOCK + 2, &b_dir);
    img.set_block(JOURNAL_FIRST_BLOCK + 3, &encode_commit_block(4242));

    let (dir, image) = img.build();
    let mut engine = engine_for(&image, dir.path());

    // Stage 1 finds B's start block inside the journal area.
    let stage1 = engine.stage1().unwrap();
    assert_eq!(
        stage1.dir_inode_to_block[20].first(),
        Some(JOURNAL_FIRST_BLOCK + 2)
    );

    let names = engine.dump_names().unwrap();
    assert!(names.contains(&"B".to_string()));
    assert!(names.contains(&"B/g".to_string()));
    assert_eq!(engine.file_index().unwrap().path_to_inode.get("B/g"), Some(&21));
}

#[test]
fn test_journal_candidate_loses_to_on_disk_candidate() {
    let mut img = ImageBuilder::new();

    img.set_inode(ROOT_INODE, &InodeSpec::directory(30));
    img.mark_inode_allocated(ROOT_INODE);
    img.set_block(30, &dir_start_block(ROOT_INODE, ROOT_INODE, &[(24, FT_DIR, "C")]));
    img.mark_block_allocated(30);

    // C is deleted; two candidate start blocks claim inode 24: an old
    // copy inside the journal area and the real block on disk.
    let mut spec = InodeSpec::directory(0);
    spec.dtime = 1_300_000_000;
    spec.links = 0;
    img.set_inode(24, &spec);

    let mut live = InodeSpec::regular(10, &[]);
    live.dtime = 0;
    img.set_inode(25, &live);
    img.mark_inode_allocated(25);

    img.set_block(
        JOURNAL_FIRST_BLOCK + 5,
        &dir_start_block(24, ROOT_INODE, &[(25, FT_REG, "old")]),
    );
    img.set_block(701, &dir_start_block(24, ROOT_INODE, &[(25, FT_REG, "x")]));

    let (dir, image) = img.build();
    let mut engine = engine_for(&image, dir.path());

    let stage1 = engine.stage1().unwrap();
    assert_eq!(stage1.dir_inode_to_block[24].len(), 2);

    let resolved = engine.resolve().unwrap();
    assert_eq!(resolved.dir_inode_to_block[24].first(), Some(701));
    assert_eq!(resolved.dir_inode_to_block[24].len(), 1);

    // The surviving copy's entries are the ones indexed.
    let index = engine.file_index().unwrap();
    assert_eq!(index.path_to_inode.get("C/x"), Some(&25));
    assert_eq!(index.path_to_inode.get("C/old"), None);
}

#[test]
fn test_engine_caches_round_trip() {
    let (dir, image) = deleted_file_image().build();

    let cached_config = || EngineConfig {
        use_caches: true,
        output_root: dir.path().join("out"),
        cache_dir: dir.path().to_path_buf(),
        ..EngineConfig::default()
    };

    let mut first = RecoveryEngine::open(&image, cached_config()).unwrap();
    let first_names = first.dump_names().unwrap();
    drop(first);

    assert!(dir.path().join("fixture.img.ext3grep.stage1").exists());
    assert!(dir.path().join("fixture.img.ext3grep.stage2").exists());

    let mut second = RecoveryEngine::open(&image, cached_config()).unwrap();
    let second_names = second.dump_names().unwrap();
    assert_eq!(first_names, second_names);

    let resolved = second.resolve().unwrap();
    assert_eq!(resolved.dir_inode_to_block[12].first(), Some(100));
}
