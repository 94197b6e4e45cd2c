//! Restoration of the non-trivial inode kinds: symlinks, unsupported
//! special files, and files with damaged indirect chains.

mod common;

use common::*;
use revenant_core::{EngineConfig, RecoveryEngine, RestoreStatus};

fn engine_for(image: &std::path::Path, work_dir: &std::path::Path) -> RecoveryEngine {
    let config = EngineConfig {
        use_caches: false,
        output_root: work_dir.join("out"),
        cache_dir: work_dir.to_path_buf(),
        ..EngineConfig::default()
    };
    RecoveryEngine::open(image, config).unwrap()
}

fn base_image(entries: &[(u32, u8, &str)]) -> ImageBuilder {
    let mut img = ImageBuilder::new();
    img.set_inode(ROOT_INODE, &InodeSpec::directory(30));
    img.mark_inode_allocated(ROOT_INODE);
    img.set_block(30, &dir_start_block(ROOT_INODE, ROOT_INODE, entries));
    img.mark_block_allocated(30);
    img
}

#[test]
fn test_restore_inline_symlink() {
    let mut img = base_image(&[(19, FT_SYMLINK, "link")]);

    // Target "target" lives inline in the pointer array.
    let mut link = InodeSpec {
        mode: 0o120777,
        size: 6,
        atime: 1_200_000_000,
        ctime: 1_200_000_000,
        links: 1,
        blocks512: 0,
        ..Default::default()
    };
    link.block[0] = u32::from_le_bytes(*b"targ");
    link.block[1] = u32::from_le_bytes([b'e', b't', 0, 0]);
    img.set_inode(19, &link);
    img.mark_inode_allocated(19);

    let (dir, image) = img.build();
    let mut engine = engine_for(&image, dir.path());

    let status = engine.restore("link").unwrap();
    assert!(matches!(status, RestoreStatus::Restored));
    let target = std::fs::read_link(dir.path().join("out/link")).unwrap();
    assert_eq!(target.to_str(), Some("target"));
}

#[test]
fn test_restore_block_stored_symlink() {
    let mut img = base_image(&[(19, FT_SYMLINK, "link")]);

    let mut link = InodeSpec {
        mode: 0o120777,
        size: 9,
        atime: 1_200_000_000,
        ctime: 1_200_000_000,
        links: 1,
        blocks512: 2,
        ..Default::default()
    };
    link.block[0] = 240;
    img.set_inode(19, &link);
    img.mark_inode_allocated(19);
    img.set_block(240, b"long/path\0");

    let (dir, image) = img.build();
    let mut engine = engine_for(&image, dir.path());

    assert!(matches!(engine.restore("link").unwrap(), RestoreStatus::Restored));
    let target = std::fs::read_link(dir.path().join("out/link")).unwrap();
    assert_eq!(target.to_str(), Some("long/path"));
}

#[test]
fn test_zero_length_symlink_is_skipped_with_warning() {
    let mut img = base_image(&[(23, FT_SYMLINK, "dead")]);
    let link = InodeSpec {
        mode: 0o120777,
        size: 0,
        links: 1,
        blocks512: 0,
        ..Default::default()
    };
    img.set_inode(23, &link);
    img.mark_inode_allocated(23);

    let (dir, image) = img.build();
    let mut engine = engine_for(&image, dir.path());

    let status = engine.restore("dead").unwrap();
    assert!(matches!(status, RestoreStatus::Skipped(_)));
    assert!(!dir.path().join("out/dead").exists());
}

#[test]
fn test_special_inode_kinds_are_skipped() {
    let mut img = base_image(&[(22, FT_FIFO, "pipe")]);
    let fifo = InodeSpec {
        mode: 0o010644,
        links: 1,
        ..Default::default()
    };
    img.set_inode(22, &fifo);
    img.mark_inode_allocated(22);

    let (dir, image) = img.build();
    let mut engine = engine_for(&image, dir.path());

    let status = engine.restore("pipe").unwrap();
    assert!(matches!(
        status,
        RestoreStatus::Skipped(revenant_core::RecoveryError::UnsupportedInode { .. })
    ));
    assert!(!dir.path().join("out/pipe").exists());
}

#[test]
fn test_corrupted_double_indirect_keeps_partial_file() {
    let mut img = base_image(&[(18, FT_REG, "big")]);

    // Twelve direct blocks, a healthy single-indirect chain of two more,
    // and a double-indirect pointer that now points at reused data.
    let direct: Vec<u32> = (210..222).collect();
    let mut big = InodeSpec::regular(20000, &direct);
    big.block[12] = 230;
    big.block[13] = 777;
    big.blocks512 = 40;
    img.set_inode(18, &big);
    img.mark_inode_allocated(18);

    for &block in &direct {
        img.fill_block(block, b'd');
    }
    let mut indirect = Vec::new();
    indirect.extend_from_slice(&231u32.to_le_bytes());
    indirect.extend_from_slice(&232u32.to_le_bytes());
    img.set_block(230, &indirect);
    img.fill_block(231, b'i');
    img.fill_block(232, b'i');
    // Block 777 no longer looks like a pointer block.
    img.fill_block(777, 0xFF);

    let (dir, image) = img.build();
    let mut engine = engine_for(&image, dir.path());

    let status = engine.restore("big").unwrap();
    assert!(matches!(status, RestoreStatus::Restored));

    // 12 direct + 2 indirect blocks came through before the walk halted.
    let restored = std::fs::read(dir.path().join("out/big")).unwrap();
    assert_eq!(restored.len(), 14 * BLOCK_SIZE);
    assert!(restored[..12 * BLOCK_SIZE].iter().all(|&b| b == b'd'));
    assert!(restored[12 * BLOCK_SIZE..].iter().all(|&b| b == b'i'));
}

#[test]
fn test_restored_directory_gets_mode_and_times() {
    let mut img = base_image(&[(12, FT_DIR, "A")]);
    let mut spec = InodeSpec::directory(100);
    spec.mode = 0o040750;
    spec.atime = 1_111_111_111;
    spec.ctime = 1_222_222_222;
    img.set_inode(12, &spec);
    img.mark_inode_allocated(12);
    img.set_block(100, &dir_start_block(12, ROOT_INODE, &[(0, FT_REG, "gone")]));
    img.mark_block_allocated(100);

    let (dir, image) = img.build();
    let mut engine = engine_for(&image, dir.path());

    assert!(matches!(engine.restore("A").unwrap(), RestoreStatus::Restored));
    let meta = std::fs::metadata(dir.path().join("out/A")).unwrap();
    assert!(meta.is_dir());
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        assert_eq!(meta.mode() & 0o7777, 0o750);
        assert_eq!(meta.mtime(), 1_222_222_222);
        assert_eq!(meta.atime(), 1_111_111_111);
    }
}
