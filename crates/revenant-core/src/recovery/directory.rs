//! In-memory directory graph
//!
//! A `DirectoryBlock` is the parsed view of one on-disk block: its entries
//! in storage order, including deleted ones recovered from the gaps of the
//! record-length chain. A `Directory` groups the blocks attributed to one
//! inode. The namespace arena maps root-relative paths to directories;
//! entries refer to their parent through the arena rather than through
//! back-pointers, which keeps the graph cycle-free.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::Result;

use crate::classify::{classify_directory, ClassifyOptions, DirBlockKind};
use crate::fs::dirent::{
    file_type_matches_mode, rec_len_for, RawDirEntry, DIR_ENTRY_HEADER_SIZE, DIR_PAD,
};
use crate::metadata::Filesystem;

/// One parsed directory entry with its recovery flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u32,
    pub name: String,
    /// File type hint, low three bits only
    pub file_type: u8,
    /// Position of this entry in storage order
    pub index: usize,
    /// Index of the entry the record-length chain continues to; 0 at the
    /// chain end
    pub next: usize,
    /// Entry was unlinked, or its inode has a deletion time
    pub deleted: bool,
    /// The referenced inode is currently allocated
    pub allocated: bool,
    /// The referenced inode was reused since this entry was written
    pub reallocated: bool,
    pub zero_inode: bool,
    /// Entry was reached through the live record-length chain
    pub linked: bool,
}

impl DirEntry {
    /// Equality as stored: two snapshots of the same directory block agree
    /// entry-wise on inode, name, type, and chain position
    pub fn exactly_equal(&self, other: &DirEntry) -> bool {
        self.inode == other.inode
            && self.name == other.name
            && self.file_type == other.file_type
            && self.next == other.next
    }
}

/// A parsed directory block
#[derive(Debug, Clone)]
pub struct DirectoryBlock {
    pub block: u32,
    pub entries: Vec<DirEntry>,
}

impl DirectoryBlock {
    pub fn exactly_equal(&self, other: &DirectoryBlock) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(other.entries.iter())
                .all(|(a, b)| a.exactly_equal(b))
    }

    /// Entries reached through the live chain, in chain order
    pub fn linked_entries(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.iter().filter(|e| e.linked)
    }
}

/// A directory: its inode and the blocks attributed to it
#[derive(Debug, Clone)]
pub struct Directory {
    pub inode: u32,
    pub blocks: Vec<DirectoryBlock>,
}

impl Directory {
    pub fn first_block(&self) -> Option<u32> {
        self.blocks.first().map(|b| b.block)
    }
}

/// The reconstructed namespace: root-relative path (no leading separator,
/// empty string for the root) to directory, plus the inverse inode map
#[derive(Debug, Default)]
pub struct Namespace {
    pub directories: BTreeMap<String, Directory>,
    pub inode_paths: HashMap<u32, String>,
}

impl Namespace {
    pub fn directory_of_inode(&self, inode: u32) -> Option<&Directory> {
        self.inode_paths
            .get(&inode)
            .and_then(|path| self.directories.get(path))
    }

    pub fn path_of_inode(&self, inode: u32) -> Option<&str> {
        self.inode_paths.get(&inode).map(String::as_str)
    }
}

struct Collected {
    offset: usize,
    raw: RawDirEntry,
    deleted: bool,
    linked: bool,
}

/// Parse one directory block into its entries.
///
/// The live record-length chain is walked first; the remaining 4-byte
/// offsets are then scanned backwards for deleted entries that still
/// classify as valid chain tails. Entries come back in storage order with
/// their chain successor recorded by index.
pub fn parse_directory_block(
    fs: &Filesystem,
    accepted: &BTreeSet<String>,
    block_nr: u32,
    data: &[u8],
) -> Result<DirectoryBlock> {
    let block_size = fs.block_size() as usize;
    let mut taken = vec![false; block_size / DIR_PAD];
    let mut collected: Vec<Collected> = Vec::new();

    // Live entries along the chain.
    let mut offset = 0;
    while offset < block_size {
        let raw = match RawDirEntry::parse(data, offset) {
            Some(raw) => raw,
            None => break,
        };
        let rec_len = raw.rec_len as usize;
        if rec_len < DIR_ENTRY_HEADER_SIZE || rec_len % DIR_PAD != 0 {
            break;
        }
        taken[offset / DIR_PAD] = true;
        collected.push(Collected {
            offset,
            raw,
            deleted: false,
            linked: true,
        });
        offset += rec_len;
    }

    // Deleted entries hiding between the live ones.
    let mut offset = block_size.saturating_sub(rec_len_for(1));
    while offset > 0 {
        if !taken[offset / DIR_PAD] {
            let opts = ClassifyOptions {
                start_only: false,
                certainly_linked: false,
                offset,
            };
            if classify_directory(
                fs.inode_count(),
                block_size,
                accepted,
                data,
                block_nr,
                &opts,
            ) != DirBlockKind::NotDir
            {
                if let Some(raw) = RawDirEntry::parse(data, offset) {
                    collected.push(Collected {
                        offset,
                        raw,
                        deleted: true,
                        linked: false,
                    });
                }
            }
        }
        offset -= DIR_PAD;
    }

    collected.sort_by_key(|c| c.offset);

    let mut entries = Vec::with_capacity(collected.len());
    for (index, c) in collected.iter().enumerate() {
        let zero_inode = c.raw.inode == 0;
        let mut deleted = c.deleted;
        let mut allocated = false;
        let mut reallocated = false;
        if !zero_inode && c.raw.inode <= fs.inode_count() {
            let inode = fs.inode(c.raw.inode)?;
            allocated = fs.is_allocated_inode(c.raw.inode)?;
            // A deleted entry whose inode is allocated again, or whose
            // inode no longer matches the entry's type hint, points at a
            // reused inode.
            reallocated = (c.deleted && allocated)
                || (c.deleted && inode.dtime == 0)
                || !file_type_matches_mode(c.raw.file_type, inode.mode);
            deleted = c.deleted || inode.dtime != 0;
        }
        let target = c.offset + c.raw.rec_len as usize;
        let next = collected
            .iter()
            .position(|o| o.offset == target)
            .unwrap_or(0);
        entries.push(DirEntry {
            inode: c.raw.inode,
            name: c.raw.name_string(),
            file_type: c.raw.file_type & 7,
            index,
            next,
            deleted,
            allocated,
            reallocated,
            zero_inode,
            linked: c.linked,
        });
    }

    Ok(DirectoryBlock {
        block: block_nr,
        entries,
    })
}
