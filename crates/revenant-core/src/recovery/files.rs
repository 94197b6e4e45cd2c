//! File index
//!
//! Derives the final path-to-inode map from the reconstructed namespace.
//! Within each directory, blocks are ranked by their last journal tag
//! sequence (newest first); for every filename, the inode comes from the
//! newest directory block that still mentions that name. The inverse map
//! records every directory entry referencing each inode.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use anyhow::Result;

use crate::fs::dirent::FT_DIRECTORY;
use crate::recovery::directory::Namespace;
use crate::recovery::journal::JournalIndex;

/// A directory entry seen from the inode's side
#[derive(Debug, Clone)]
pub struct EntryRef {
    pub dir_path: String,
    pub dir_inode: u32,
    pub block: u32,
    pub name: String,
}

/// The final file-level view of the reconstructed namespace
#[derive(Debug, Default)]
pub struct FileIndex {
    /// Full path of each file to its chosen inode
    pub path_to_inode: BTreeMap<String, u32>,
    /// Every directory entry referencing an inode, across all directories
    pub inode_to_entries: HashMap<u32, Vec<EntryRef>>,
}

/// Build the file index from a resolved namespace
pub fn build(journal: &JournalIndex, namespace: &Namespace) -> Result<FileIndex> {
    let mut index = FileIndex::default();

    for (dir_path, directory) in &namespace.directories {
        // Rank the directory's blocks newest-first by journal evidence.
        // Journal-resident blocks carry their own descriptor's sequence;
        // on-disk blocks use the highest tag sequence that snapshotted
        // them, or 0 when the journal never saw them.
        let mut ranked: Vec<(usize, u32)> = Vec::with_capacity(directory.blocks.len());
        for (position, block) in directory.blocks.iter().enumerate() {
            if journal.in_journal_range(block.block) {
                match journal.descriptor_for_journal_block(block.block) {
                    Some(descriptor) if descriptor.tag_fs_block().is_some() => {
                        ranked.push((position, descriptor.sequence));
                    }
                    _ => {
                        tracing::warn!(
                            "Directory block {} lies in the journal but has no descriptor; \
                             ignoring it",
                            block.block
                        );
                    }
                }
            } else {
                let sequence = journal
                    .descriptors_for_block(block.block)
                    .iter()
                    .rev()
                    .map(|&i| journal.descriptor(i))
                    .find(|d| d.tag_fs_block().is_some())
                    .map(|d| d.sequence)
                    .unwrap_or(0);
                ranked.push((position, sequence));
            }
        }
        // Stable: blocks with equal sequences keep their graft order.
        ranked.sort_by_key(|&(_, sequence)| Reverse(sequence));

        let mut chosen: BTreeMap<String, u32> = BTreeMap::new();
        for &(position, _) in &ranked {
            let block = &directory.blocks[position];
            for entry in &block.entries {
                if entry.zero_inode || entry.reallocated || entry.file_type == FT_DIRECTORY {
                    continue;
                }
                chosen.entry(entry.name.clone()).or_insert(entry.inode);
                index
                    .inode_to_entries
                    .entry(entry.inode)
                    .or_default()
                    .push(EntryRef {
                        dir_path: dir_path.clone(),
                        dir_inode: directory.inode,
                        block: block.block,
                        name: entry.name.clone(),
                    });
            }
        }

        for (name, inode) in chosen {
            let full_path = if dir_path.is_empty() {
                name
            } else {
                format!("{}/{}", dir_path, name)
            };
            index.path_to_inode.entry(full_path).or_insert(inode);
        }
    }

    tracing::info!("File index holds {} paths", index.path_to_inode.len());
    Ok(index)
}

/// Inodes referenced by more than one path: hard links, or the remains of
/// renames the journal still remembers
pub fn hardlink_groups(index: &FileIndex) -> Vec<(u32, Vec<String>)> {
    let mut by_inode: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    for (path, &inode) in &index.path_to_inode {
        by_inode.entry(inode).or_default().push(path.clone());
    }
    by_inode
        .into_iter()
        .filter(|(_, paths)| paths.len() > 1)
        .collect()
}
