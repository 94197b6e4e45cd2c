//! Namespace assembly edge cases: directory loops left by stale entries,
//! and extended directory blocks grafted onto their owning inode.

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

#[test]
fn test_mutual_directory_loop_is_broken() {
    let mut img = ImageBuilder::new();

    img.set_inode(ROOT_INODE, &InodeSpec::directory(30));
    img.mark_inode_allocated(ROOT_INODE);
    img.set_block(30, &dir_start_block(ROOT_INODE, ROOT_INODE, &[(24, FT_DIR, "X")]));
    img.mark_block_allocated(30);

    // X and Y are both deleted and, via stale entries, claim each other
    // as children.
    let dtime = 1_300_000_000;
    let mut x = InodeSpec::directory(0);
    x.dtime = dtime;
    x.links = 0;
    img.set_inode(24, &x);
    let mut y = InodeSpec::directory(0);
    y.dtime = dtime;
    y.links = 0;
    img.set_inode(25, &y);

    img.set_block(710, &dir_start_block(24, ROOT_INODE, &[(25, FT_DIR, "y")]));
    img.set_block(711, &dir_start_block(25, 24, &[(24, FT_DIR, "x")]));

    let (dir, image) = img.build();
    let mut engine = engine_for(&image, dir.path());

    // Terminates and keeps exactly one path per inode.
    let resolved = engine.resolve().unwrap();
    let mut paths: Vec<&String> = resolved.namespace.directories.keys().collect();
    paths.sort();
    let expected_x = "X".to_string();
    let expected_y = "X/y".to_string();
    assert_eq!(paths, vec![&String::new(), &expected_x, &expected_y]);
    assert_eq!(resolved.namespace.path_of_inode(24), Some("X"));
    assert_eq!(resolved.namespace.path_of_inode(25), Some("X/y"));
}

#[test]
fn test_extended_block_grafts_onto_parent_by_dot_dot_vote() {
    let mut img = ImageBuilder::new();

    img.set_inode(ROOT_INODE, &InodeSpec::directory(30));
    img.mark_inode_allocated(ROOT_INODE);
    img.set_block(30, &dir_start_block(ROOT_INODE, ROOT_INODE, &[(14, FT_DIR, "C")]));
    img.mark_block_allocated(30);

    // C is a live directory with one block of its own.
    img.set_inode(14, &InodeSpec::directory(705));
    img.mark_inode_allocated(14);
    img.set_block(705, &dir_start_block(14, ROOT_INODE, &[(15, FT_REG, "keep.txt")]));
    img.mark_block_allocated(705);

    let mut keep = InodeSpec::regular(10, &[250]);
    keep.dtime = 0;
    img.set_inode(15, &keep);
    img.mark_inode_allocated(15);

    // An overflow block of C's entries: its first entry is not '.', so
    // only the '..' entries of its subdirectories tie it back to C.
    img.set_block(
        800,
        &dir_extended_block(&[(16, FT_DIR, "sub1"), (17, FT_REG, "data.txt")]),
    );

    // sub1 is deleted; its first block names C as its parent.
    let mut sub = InodeSpec::directory(0);
    sub.dtime = 1_300_000_000;
    sub.links = 0;
    img.set_inode(16, &sub);
    img.set_block(710, &dir_start_block(16, 14, &[(0, FT_REG, "old")]));

    let mut data = InodeSpec::regular(10, &[251]);
    data.dtime = 1_300_000_000;
    img.set_inode(17, &data);

    let (dir, image) = img.build();
    let mut engine = engine_for(&image, dir.path());

    let stage1 = engine.stage1().unwrap();
    assert!(stage1.extended_blocks.contains(&800));

    let resolved = engine.resolve().unwrap();
    // The extended block was appended to C.
    let c = resolved.namespace.directories.get("C").unwrap();
    let c_blocks: Vec<u32> = c.blocks.iter().map(|b| b.block).collect();
    assert_eq!(c_blocks, vec![705, 800]);
    // Subdirectories reachable only through the extended block got paths.
    assert!(resolved.namespace.directories.contains_key("C/sub1"));

    // And its files are indexed under C.
    let index = engine.file_index().unwrap();
    assert_eq!(index.path_to_inode.get("C/data.txt"), Some(&17));
    assert_eq!(index.path_to_inode.get("C/keep.txt"), Some(&15));
}

#[test]
fn test_hardlink_report_groups_paths_by_inode() {
    let mut img = ImageBuilder::new();

    img.set_inode(ROOT_INODE, &InodeSpec::directory(30));
    img.mark_inode_allocated(ROOT_INODE);
    img.set_block(
        30,
        &dir_start_block(
            ROOT_INODE,
            ROOT_INODE,
            &[(15, FT_REG, "first"), (15, FT_REG, "second")],
        ),
    );
    img.mark_block_allocated(30);

    let spec = InodeSpec::regular(10, &[250]);
    img.set_inode(15, &spec);
    img.mark_inode_allocated(15);

    let (dir, image) = img.build();
    let mut engine = engine_for(&image, dir.path());

    let groups = engine.hardlinks().unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].0, 15);
    assert_eq!(
        groups[0].1,
        vec!["first".to_string(), "second".to_string()]
    );
}
