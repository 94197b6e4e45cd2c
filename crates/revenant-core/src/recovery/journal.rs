//! Journal replay index
//!
//! Walks the journal inode's blocks in log order, parses descriptor,
//! revoke, and commit records into transactions, and builds reverse maps
//! from filesystem block numbers to the journal snapshots of those
//! blocks. Directory inodes found inside journaled inode-table snapshots
//! additionally feed a block-to-directory-inode hint map, with higher
//! sequences overwriting lower ones.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};

use crate::fs::bitmap::RangeBitmap;
use crate::fs::inode::{Inode, INODE_CORE_SIZE};
use crate::fs::journal::{
    parse_descriptor_tags, parse_revoke_blocks, JournalHeader, JournalSuperblock,
    BLOCKTYPE_COMMIT, BLOCKTYPE_DESCRIPTOR, BLOCKTYPE_REVOKE,
};
use crate::metadata::Filesystem;
use crate::walk::{walk_blocks, WalkOutcome, MASK_DIRECT, MASK_POINTERS};

/// What one journal descriptor record announces
#[derive(Debug, Clone)]
pub enum DescriptorKind {
    /// The journal block is a snapshot of `fs_block`
    Tag { fs_block: u32, flags: u32 },
    /// Earlier journal copies of these blocks are void below this sequence
    Revoke { blocks: Vec<u32> },
    /// All preceding descriptors of this sequence are durable
    Commit,
}

/// One parsed journal record
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// Journal-resident block this record lives in (for tags: the block
    /// holding the snapshot data)
    pub journal_block: u32,
    pub sequence: u32,
    pub kind: DescriptorKind,
}

impl Descriptor {
    pub fn tag_fs_block(&self) -> Option<u32> {
        match self.kind {
            DescriptorKind::Tag { fs_block, .. } => Some(fs_block),
            _ => None,
        }
    }
}

/// The descriptors sharing one sequence number
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Journal block of the first descriptor seen for this sequence
    pub start_block: u32,
    pub sequence: u32,
    pub committed: bool,
    /// Indices into the descriptor table, in ascending order
    pub descriptors: Vec<usize>,
}

impl Transaction {
    pub fn contains_tag_for_block(&self, index: &JournalIndex, block: u32) -> bool {
        self.descriptors
            .iter()
            .any(|&i| index.descriptors[i].tag_fs_block() == Some(block))
    }
}

/// Immutable index over the journal contents, built once at startup
pub struct JournalIndex {
    superblock: JournalSuperblock,
    min_block: u32,
    /// One past the highest journal-owned block
    max_block: u32,
    in_journal: RangeBitmap,
    indirect_in_journal: RangeBitmap,
    descriptors: Vec<Descriptor>,
    block_descriptors: HashMap<u32, Vec<usize>>,
    journal_block_descriptor: HashMap<u32, usize>,
    transactions: BTreeMap<u32, Transaction>,
    block_to_dir_inode: HashMap<u32, u32>,
    wrapped_sequence: Option<u32>,
    min_sequence: u32,
    max_sequence: u32,
}

impl JournalIndex {
    /// Build the index by replaying the journal of an opened filesystem
    pub fn build(fs: &Filesystem) -> Result<Self> {
        let journal_inum = fs.superblock().journal_inum;
        if journal_inum == 0 {
            anyhow::bail!("Filesystem has no journal inode");
        }
        if !fs.is_allocated_inode(journal_inum)? {
            anyhow::bail!("Journal inode {} is not allocated (external journal?)", journal_inum);
        }
        let journal_inode = fs.inode(journal_inum)?;

        // Establish the block range the journal occupies and which of its
        // blocks are pointer blocks. A single-block journal is degenerate
        // but valid, so emptiness is tracked separately from the extent.
        let mut extent: Option<(u32, u32)> = None;
        let outcome = walk_blocks(fs, &journal_inode, MASK_DIRECT | MASK_POINTERS, &mut |b, _| {
            extent = Some(match extent {
                None => (b, b),
                Some((lo, hi)) => (lo.min(b), hi.max(b)),
            });
            true
        })?;
        if outcome == WalkOutcome::Corrupted {
            anyhow::bail!("Journal inode has corrupted indirect blocks");
        }
        let (min_block, max_block) = extent.context("Journal inode owns no blocks")?;
        let max_block = max_block + 1;
        tracing::info!("Journal block range: {} .. {}", min_block, max_block);

        let mut in_journal = RangeBitmap::new(min_block, max_block - min_block);
        walk_blocks(fs, &journal_inode, MASK_DIRECT | MASK_POINTERS, &mut |b, _| {
            in_journal.set(b);
            true
        })?;
        let mut indirect_in_journal = RangeBitmap::new(min_block, max_block - min_block);
        walk_blocks(fs, &journal_inode, MASK_POINTERS, &mut |b, _| {
            indirect_in_journal.set(b);
            true
        })?;

        // The journal's data blocks in log order; index = journal block
        // number, value = filesystem block number.
        let mut journal_order = Vec::new();
        walk_blocks(fs, &journal_inode, MASK_DIRECT, &mut |b, _| {
            journal_order.push(b);
            true
        })?;
        if journal_order.is_empty() {
            anyhow::bail!("Journal inode has no data blocks");
        }

        let superblock = JournalSuperblock::parse(&fs.read_block(journal_order[0])?)
            .context("Journal superblock is invalid")?;
        let maxlen = superblock.maxlen.min(journal_order.len() as u32);

        // Single pass over the log, accumulating descriptors.
        let mut descriptors = Vec::new();
        let mut wrapped_sequence = None;
        let mut jbn = superblock.first;
        'scan: while jbn < maxlen {
            let fs_block = journal_order[jbn as usize];
            let data = fs.read_block(fs_block)?;
            if let Some(header) = JournalHeader::parse(&data) {
                match header.blocktype {
                    BLOCKTYPE_DESCRIPTOR => {
                        for tag in parse_descriptor_tags(&data) {
                            jbn += 1;
                            if jbn >= maxlen {
                                // The transaction wraps around the end of
                                // the journal; its tail is unreachable.
                                wrapped_sequence = Some(header.sequence);
                                break 'scan;
                            }
                            descriptors.push(Descriptor {
                                journal_block: journal_order[jbn as usize],
                                sequence: header.sequence,
                                kind: DescriptorKind::Tag {
                                    fs_block: tag.blocknr,
                                    flags: tag.flags,
                                },
                            });
                        }
                    }
                    BLOCKTYPE_COMMIT => {
                        descriptors.push(Descriptor {
                            journal_block: fs_block,
                            sequence: header.sequence,
                            kind: DescriptorKind::Commit,
                        });
                    }
                    BLOCKTYPE_REVOKE => match parse_revoke_blocks(&data) {
                        Ok(blocks) => descriptors.push(Descriptor {
                            journal_block: fs_block,
                            sequence: header.sequence,
                            kind: DescriptorKind::Revoke { blocks },
                        }),
                        Err(err) => {
                            tracing::warn!("Malformed revoke block at journal block {}: {}", jbn, err);
                            break 'scan;
                        }
                    },
                    other => {
                        tracing::warn!(
                            "Unexpected journal block type {} at journal block {}; journal corrupt?",
                            other,
                            jbn
                        );
                        break 'scan;
                    }
                }
            }
            jbn += 1;
        }

        let min_sequence = descriptors.iter().map(|d| d.sequence).min().unwrap_or(0);
        let max_sequence = descriptors.iter().map(|d| d.sequence).max().unwrap_or(0);

        // Stable sort: within a sequence, log order is preserved, so the
        // per-block descriptor lists come out in ascending sequence.
        descriptors.sort_by_key(|d| d.sequence);

        let mut block_descriptors: HashMap<u32, Vec<usize>> = HashMap::new();
        let mut journal_block_descriptor: HashMap<u32, usize> = HashMap::new();
        let mut transactions: BTreeMap<u32, Transaction> = BTreeMap::new();
        for (index, descriptor) in descriptors.iter().enumerate() {
            match &descriptor.kind {
                DescriptorKind::Tag { fs_block, .. } => {
                    transactions
                        .entry(descriptor.sequence)
                        .or_insert_with(|| Transaction {
                            start_block: descriptor.journal_block,
                            sequence: descriptor.sequence,
                            committed: false,
                            descriptors: Vec::new(),
                        })
                        .descriptors
                        .push(index);
                    block_descriptors.entry(*fs_block).or_default().push(index);
                    journal_block_descriptor.insert(descriptor.journal_block, index);
                }
                DescriptorKind::Revoke { blocks } => {
                    transactions
                        .entry(descriptor.sequence)
                        .or_insert_with(|| Transaction {
                            start_block: descriptor.journal_block,
                            sequence: descriptor.sequence,
                            committed: false,
                            descriptors: Vec::new(),
                        })
                        .descriptors
                        .push(index);
                    for &block in blocks {
                        block_descriptors.entry(block).or_default().push(index);
                    }
                    journal_block_descriptor.insert(descriptor.journal_block, index);
                }
                DescriptorKind::Commit => {
                    // A commit with no descriptors of its own sequence is
                    // uninteresting (possibly a wrapped-around tail).
                    if let Some(transaction) = transactions.get_mut(&descriptor.sequence) {
                        transaction.committed = true;
                    }
                }
            }
        }

        let mut index = JournalIndex {
            superblock,
            min_block,
            max_block,
            in_journal,
            indirect_in_journal,
            descriptors,
            block_descriptors,
            journal_block_descriptor,
            transactions,
            block_to_dir_inode: HashMap::new(),
            wrapped_sequence,
            min_sequence,
            max_sequence,
        };
        index.build_dir_inode_hints(fs)?;

        if let Some(sequence) = index.wrapped_sequence {
            tracing::warn!(
                "Journal transaction {} wraps around; some of its data blocks are lost",
                sequence
            );
        }
        tracing::info!(
            "Journal: {} descriptors, sequences {} .. {}",
            index.descriptors.len(),
            index.min_sequence,
            index.max_sequence
        );
        Ok(index)
    }

    /// Record which data blocks each journaled directory inode claimed.
    /// Descriptors are visited in ascending sequence, so the latest
    /// snapshot wins for any block claimed twice.
    fn build_dir_inode_hints(&mut self, fs: &Filesystem) -> Result<()> {
        let record_size = fs.superblock().inode_record_size() as usize;
        let per_block = fs.block_size() as usize / record_size;
        let mut hints: HashMap<u32, u32> = HashMap::new();

        for descriptor in &self.descriptors {
            let fs_block = match descriptor.tag_fs_block() {
                Some(block) => block,
                None => continue,
            };
            let first_inode = match fs.first_inode_of_table_block(fs_block) {
                Some(first) => first,
                None => continue,
            };
            let snapshot = fs.read_block(descriptor.journal_block)?;
            for i in 0..per_block {
                let inode_number = first_inode + i as u32;
                let offset = i * record_size;
                if offset + INODE_CORE_SIZE > snapshot.len() {
                    break;
                }
                let inode = match Inode::parse(&snapshot[offset..]) {
                    Ok(inode) => inode,
                    Err(_) => continue,
                };
                if !inode.is_directory() {
                    continue;
                }
                // Only directory snapshots that look live are trusted.
                if inode.dtime != 0 || inode.atime == 0 || inode.block[0] == 0 {
                    continue;
                }
                let outcome = walk_blocks(fs, &inode, MASK_DIRECT, &mut |block, _| {
                    hints.insert(block, inode_number);
                    true
                })?;
                if outcome == WalkOutcome::Corrupted {
                    tracing::info!(
                        "Journal block {} holds directory inode {} with reused or corrupted \
                         indirect blocks",
                        descriptor.journal_block,
                        inode_number
                    );
                }
            }
        }
        self.block_to_dir_inode = hints;
        Ok(())
    }

    pub fn journal_superblock(&self) -> &JournalSuperblock {
        &self.superblock
    }

    /// Whether a block number falls inside the journal's block range
    pub fn in_journal_range(&self, block: u32) -> bool {
        block >= self.min_block && block < self.max_block
    }

    /// Whether a block belongs to the journal inode
    pub fn is_journal_block(&self, block: u32) -> bool {
        self.in_journal.contains(block)
    }

    /// Whether a block is one of the journal inode's pointer blocks
    pub fn is_indirect_block_in_journal(&self, block: u32) -> bool {
        self.indirect_in_journal.contains(block)
    }

    pub fn descriptor(&self, index: usize) -> &Descriptor {
        &self.descriptors[index]
    }

    pub fn descriptor_count(&self) -> usize {
        self.descriptors.len()
    }

    /// Descriptors that reference a filesystem block, ascending by sequence
    pub fn descriptors_for_block(&self, fs_block: u32) -> &[usize] {
        self.block_descriptors
            .get(&fs_block)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Highest journal sequence that mentions a filesystem block, 0 if none
    pub fn highest_sequence_for_block(&self, fs_block: u32) -> u32 {
        self.descriptors_for_block(fs_block)
            .last()
            .map(|&i| self.descriptors[i].sequence)
            .unwrap_or(0)
    }

    /// The descriptor owning a journal-resident block
    pub fn descriptor_for_journal_block(&self, block: u32) -> Option<&Descriptor> {
        self.journal_block_descriptor
            .get(&block)
            .map(|&i| &self.descriptors[i])
    }

    pub fn transaction(&self, sequence: u32) -> Option<&Transaction> {
        self.transactions.get(&sequence)
    }

    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.values()
    }

    /// Nearest sequences below and above the given one
    pub fn sequence_neighbors(&self, sequence: u32) -> (Option<u32>, Option<u32>) {
        let prev = self
            .transactions
            .range(..sequence)
            .next_back()
            .map(|(&s, _)| s);
        let next = self
            .transactions
            .range(sequence + 1..)
            .next()
            .map(|(&s, _)| s);
        (prev, next)
    }

    /// All journal copies of an inode, newest first
    pub fn inode_snapshots(&self, fs: &Filesystem, inode_id: u32) -> Result<Vec<(u32, Inode)>> {
        let (table_block, offset) = fs.inode_position(inode_id);
        let mut snapshots = Vec::new();
        for &index in self.descriptors_for_block(table_block).iter().rev() {
            let descriptor = &self.descriptors[index];
            if descriptor.tag_fs_block().is_none() {
                continue;
            }
            let data = fs.read_block(descriptor.journal_block)?;
            if offset + INODE_CORE_SIZE > data.len() {
                continue;
            }
            if let Ok(inode) = Inode::parse(&data[offset..]) {
                snapshots.push((descriptor.sequence, inode));
            }
        }
        Ok(snapshots)
    }

    /// If the block is an inode-table block, or a journal snapshot of one,
    /// the filesystem inode-table block it represents
    pub fn is_inode_block(&self, fs: &Filesystem, block: u32) -> Option<u32> {
        if fs.is_in_inode_table(block) {
            return Some(block);
        }
        if !self.is_journal_block(block) || self.is_indirect_block_in_journal(block) {
            return None;
        }
        let fs_block = self.descriptor_for_journal_block(block)?.tag_fs_block()?;
        fs.is_in_inode_table(fs_block).then_some(fs_block)
    }

    /// Journal's opinion on which directory inode owned a data block
    pub fn dir_inode_hint(&self, block: u32) -> Option<u32> {
        self.block_to_dir_inode.get(&block).copied()
    }

    pub fn wrapped_sequence(&self) -> Option<u32> {
        self.wrapped_sequence
    }

    pub fn min_sequence(&self) -> u32 {
        self.min_sequence
    }

    pub fn max_sequence(&self) -> u32 {
        self.max_sequence
    }
}
