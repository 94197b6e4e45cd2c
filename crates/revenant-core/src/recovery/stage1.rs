//! Resolver stage 1: candidate proposal
//!
//! Scans every block of the image (journal blocks included, since many
//! historical directory snapshots survive only there) and proposes, for
//! each inode, the blocks whose leading `.` entry names it. Blocks that
//! parse as directory data without the `.`/`..` prologue are collected
//! separately as extended directory blocks.

use std::collections::BTreeSet;

use anyhow::Result;

use crate::classify::{classify_directory, ClassifyOptions, DirBlockKind};
use crate::fs::dirent::RawDirEntry;
use crate::metadata::Filesystem;
use crate::recovery::blockvec::BlockList;

/// Output of the stage 1 scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOneResult {
    /// Candidate start blocks per inode, indexed by inode number
    /// (index 0 is unused)
    pub dir_inode_to_block: Vec<BlockList>,
    /// Blocks holding directory continuations with no owning inode yet
    pub extended_blocks: Vec<u32>,
}

impl StageOneResult {
    pub fn empty(inode_count: u32) -> Self {
        StageOneResult {
            dir_inode_to_block: vec![BlockList::default(); inode_count as usize + 1],
            extended_blocks: Vec::new(),
        }
    }

    /// Number of inodes with at least one candidate
    pub fn proposed_inodes(&self) -> usize {
        self.dir_inode_to_block
            .iter()
            .filter(|list| !list.is_empty())
            .count()
    }

    /// Number of inodes with more than one candidate
    pub fn ambiguous_inodes(&self) -> usize {
        self.dir_inode_to_block
            .iter()
            .filter(|list| list.len() > 1)
            .count()
    }
}

/// Scan all blocks and propose inode-to-start-block candidates
pub fn scan(fs: &Filesystem, accepted: &BTreeSet<String>) -> Result<StageOneResult> {
    let sb = fs.superblock();
    let mut result = StageOneResult::empty(sb.inodes_count);
    let opts = ClassifyOptions {
        start_only: false,
        certainly_linked: true,
        offset: 0,
    };

    tracing::info!("Scanning {} groups for directory blocks", fs.group_count());
    for group in 0..fs.group_count() {
        tracing::debug!("Searching group {}", group);
        let first = sb.first_data_block + group as u32 * sb.blocks_per_group;
        let last = (first + sb.blocks_per_group).min(sb.blocks_count);
        for block in first..last {
            if fs.is_group_metadata_block(block) {
                continue;
            }
            let data = fs.read_block(block)?;
            match classify_directory(
                sb.inodes_count,
                fs.block_size() as usize,
                accepted,
                &data,
                block,
                &opts,
            ) {
                DirBlockKind::DirStart => {
                    let entry = match RawDirEntry::parse(&data, 0) {
                        Some(entry) => entry,
                        None => continue,
                    };
                    debug_assert!(entry.is_dot());
                    if entry.inode != 0 && entry.inode <= sb.inodes_count {
                        result.dir_inode_to_block[entry.inode as usize].push(block);
                    }
                }
                DirBlockKind::DirExtended => result.extended_blocks.push(block),
                DirBlockKind::NotDir => {}
            }
        }
    }

    tracing::info!(
        "Stage 1: {} inodes proposed ({} ambiguous), {} extended directory blocks",
        result.proposed_inodes(),
        result.ambiguous_inodes(),
        result.extended_blocks.len()
    );
    Ok(result)
}
