//! Resolver stage 2: disambiguation and namespace assembly
//!
//! Collapses each inode's candidate set to one start block using four
//! passes in fixed order (allocation state, journal purge, journal
//! sequence, exact coalescing), then walks the reconstructed tree from
//! the root to assign every directory a path, and finally grafts extended
//! directory blocks onto the inodes that own them.
//!
//! Changing the order of the disambiguation passes is observable; they
//! run exactly as listed.

use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, Result};

use crate::fs::dirent::{RawDirEntry, FT_DIRECTORY};
use crate::fs::superblock::ROOT_INODE;
use crate::metadata::Filesystem;
use crate::recovery::blockvec::BlockList;
use crate::recovery::directory::{
    parse_directory_block, DirEntry, Directory, DirectoryBlock, Namespace,
};
use crate::recovery::journal::JournalIndex;
use crate::recovery::stage1::StageOneResult;
use crate::walk::{collect_data_blocks, WalkOutcome};

/// Depth bound of the namespace descent
pub const RESOLVE_MAX_DEPTH: usize = 10_000;

/// Tolerated gap between a directory's deletion time and its ancestor's.
/// Recursive removal stamps a parent before its children, so a child
/// deleted within this window of an already-deleted ancestor is still
/// considered part of that ancestor's tree.
pub const DELETE_SLACK_SECS: u32 = 60;

/// Optional external oracle consulted when two reconstructed paths claim
/// the same inode, or when an extended block's parent cannot be derived
/// from its entries
pub trait PathOracle {
    /// Whether the oracle recognizes a root-relative path
    fn path_exists(&self, path: &str) -> bool;

    /// Parent directory path guessed from the filenames an orphaned
    /// extended block contains
    fn parent_directory(&self, block: u32, filenames: &BTreeSet<String>) -> Option<String>;
}

/// Stage 2 configuration
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub max_depth: usize,
    /// Entries whose inode was deleted before this time are ignored
    pub after: Option<u32>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        ResolveOptions {
            max_depth: RESOLVE_MAX_DEPTH,
            after: None,
        }
    }
}

/// Final result of both resolver stages
pub struct ResolveOutput {
    pub namespace: Namespace,
    /// Per-inode block list after disambiguation
    pub dir_inode_to_block: Vec<BlockList>,
}

struct Ancestor {
    inode: u32,
    dtime: u32,
}

enum Registration {
    New,
    /// Same (inode, first block) pair seen again: abort this branch
    ReEntry,
    /// Registered, but another path or inode claimed the slot first
    Conflict,
}

/// Stage 2 resolver
pub struct Resolver<'a> {
    fs: &'a Filesystem,
    journal: &'a JournalIndex,
    accepted: &'a BTreeSet<String>,
    oracle: Option<&'a dyn PathOracle>,
    options: ResolveOptions,
    dir_inode_to_block: Vec<BlockList>,
    extended_blocks: Vec<u32>,
    namespace: Namespace,
}

impl<'a> Resolver<'a> {
    pub fn new(
        fs: &'a Filesystem,
        journal: &'a JournalIndex,
        accepted: &'a BTreeSet<String>,
        oracle: Option<&'a dyn PathOracle>,
        options: ResolveOptions,
        stage1: StageOneResult,
    ) -> Self {
        Resolver {
            fs,
            journal,
            accepted,
            oracle,
            options,
            dir_inode_to_block: stage1.dir_inode_to_block,
            extended_blocks: stage1.extended_blocks,
            namespace: Namespace::default(),
        }
    }

    /// Run disambiguation, namespace assembly, and extended-block grafting
    pub fn run(mut self) -> Result<ResolveOutput> {
        self.disambiguate()?;
        self.build_namespace()?;
        self.graft_extended_blocks()?;
        Ok(ResolveOutput {
            namespace: self.namespace,
            dir_inode_to_block: self.dir_inode_to_block,
        })
    }

    fn read_directory_block(&self, block: u32) -> Result<DirectoryBlock> {
        let data = self.fs.read_block(block)?;
        parse_directory_block(self.fs, self.accepted, block, &data)
    }

    /// Collapse multi-candidate inodes, in the fixed pass order
    fn disambiguate(&mut self) -> Result<()> {
        let inode_count = self.fs.inode_count();
        let mut resolved_allocated = 0usize;
        let mut resolved_journal_purge = 0usize;
        let mut resolved_sequence = 0usize;
        let mut resolved_coalesce = 0usize;
        let mut unresolved = 0usize;

        for inode_id in 1..=inode_count {
            // Pass 1: a still-allocated directory inode names its own
            // first block; nothing else can win.
            if self.fs.is_allocated_inode(inode_id)? {
                let inode = self.fs.inode(inode_id)?;
                if inode.is_directory() {
                    let first_block = inode.block[0];
                    if first_block == 0 {
                        tracing::error!(
                            "Allocated directory inode {} references no block; the filesystem \
                             itself looks corrupted",
                            inode_id
                        );
                        continue;
                    }
                    let list = &mut self.dir_inode_to_block[inode_id as usize];
                    if list.is_empty() {
                        tracing::warn!(
                            "Allocated directory inode {} has no proposed directory block",
                            inode_id
                        );
                        continue;
                    }
                    if list.contains(first_block) {
                        list.clear();
                        list.push(first_block);
                        resolved_allocated += 1;
                    } else {
                        tracing::warn!(
                            "Allocated directory inode {}'s first block {} is not among its \
                             candidates",
                            inode_id,
                            first_block
                        );
                    }
                    continue;
                }
            }

            if self.dir_inode_to_block[inode_id as usize].len() <= 1 {
                continue;
            }

            let candidates: Vec<u32> = self.dir_inode_to_block[inode_id as usize].iter().collect();
            let mut dirs = Vec::with_capacity(candidates.len());
            for block in candidates {
                dirs.push(self.read_directory_block(block)?);
            }

            // Pass 2: journal copies lose to non-journal copies; if only
            // journal copies exist, the newest one stands in.
            let journal_count = dirs
                .iter()
                .filter(|d| self.journal.is_journal_block(d.block))
                .count();
            if journal_count == dirs.len() {
                let journal = self.journal;
                let highest = dirs
                    .iter()
                    .filter_map(|d| {
                        journal
                            .descriptor_for_journal_block(d.block)
                            .map(|desc| desc.sequence)
                    })
                    .max()
                    .unwrap_or(0);
                let mut kept_one = false;
                let list = &mut self.dir_inode_to_block[inode_id as usize];
                dirs.retain(|d| {
                    let sequence = journal
                        .descriptor_for_journal_block(d.block)
                        .map(|desc| desc.sequence)
                        .unwrap_or(0);
                    if sequence == highest && !kept_one {
                        kept_one = true;
                        true
                    } else {
                        list.remove(d.block);
                        false
                    }
                });
            } else if journal_count > 0 {
                let journal = self.journal;
                let list = &mut self.dir_inode_to_block[inode_id as usize];
                dirs.retain(|d| {
                    if journal.is_journal_block(d.block) {
                        list.remove(d.block);
                        false
                    } else {
                        true
                    }
                });
            }
            if dirs.len() == 1 {
                resolved_journal_purge += 1;
                continue;
            }

            // Pass 3: among survivors, the block with the highest journal
            // coverage sequence wins.
            let mut best: Option<(u32, u32)> = None;
            for d in &dirs {
                let sequence = self.journal.highest_sequence_for_block(d.block);
                if sequence > best.map(|(s, _)| s).unwrap_or(0) {
                    best = Some((sequence, d.block));
                }
            }
            if let Some((_, best_block)) = best {
                let list = &mut self.dir_inode_to_block[inode_id as usize];
                dirs.retain(|d| {
                    if d.block != best_block {
                        list.remove(d.block);
                        false
                    } else {
                        true
                    }
                });
            }
            if dirs.len() == 1 {
                resolved_sequence += 1;
                continue;
            }

            // Pass 4: coalesce candidates whose parsed entries are
            // pairwise identical.
            let mut kept: Vec<DirectoryBlock> = Vec::new();
            for d in dirs {
                if kept.iter().any(|k| k.exactly_equal(&d)) {
                    self.dir_inode_to_block[inode_id as usize].remove(d.block);
                } else {
                    kept.push(d);
                }
            }
            if kept.len() == 1 {
                resolved_coalesce += 1;
            } else {
                unresolved += 1;
                tracing::warn!(
                    "Inode {} still has {} candidate blocks after disambiguation ({:?}); \
                     keeping block {}",
                    inode_id,
                    kept.len(),
                    kept.iter().map(|d| d.block).collect::<Vec<_>>(),
                    self.dir_inode_to_block[inode_id as usize]
                        .first()
                        .unwrap_or(0)
                );
            }
        }

        tracing::info!(
            "Stage 2 disambiguation: {} by allocation, {} by journal purge, {} by sequence, \
             {} by coalescing, {} unresolved",
            resolved_allocated,
            resolved_journal_purge,
            resolved_sequence,
            resolved_coalesce,
            unresolved
        );
        Ok(())
    }

    /// Walk the tree from the root inode, assigning paths
    fn build_namespace(&mut self) -> Result<()> {
        let root_block = self.dir_inode_to_block[ROOT_INODE as usize]
            .first()
            .context("No directory block found for the root inode")?;
        let root_dtime = self.fs.inode(ROOT_INODE)?.dtime;
        self.register_directory(String::new(), ROOT_INODE, root_block)?;

        let parsed = self.read_directory_block(root_block)?;
        let mut chain = vec![Ancestor {
            inode: ROOT_INODE,
            dtime: root_dtime,
        }];
        self.process_entries("", &parsed.entries, &mut chain)?;
        tracing::info!("Namespace holds {} directories", self.namespace.directories.len());
        Ok(())
    }

    /// Register a directory at a path; the first block is read and parsed
    fn register_directory(
        &mut self,
        path: String,
        inode: u32,
        first_block: u32,
    ) -> Result<Registration> {
        let mut result = Registration::New;

        if let Some(existing) = self.namespace.directories.get(&path) {
            if existing.inode == inode && existing.first_block() == Some(first_block) {
                return Ok(Registration::ReEntry);
            }
            tracing::warn!(
                "Directory '{}' is linked to both inode/block {}/{} and {}/{}; keeping the first",
                path,
                existing.inode,
                existing.first_block().unwrap_or(0),
                inode,
                first_block
            );
            result = Registration::Conflict;
        } else {
            let block = self.read_directory_block(first_block)?;
            self.namespace.directories.insert(
                path.clone(),
                Directory {
                    inode,
                    blocks: vec![block],
                },
            );
        }

        match self.namespace.inode_paths.get(&inode) {
            None => {
                self.namespace.inode_paths.insert(inode, path);
            }
            Some(existing_path) if *existing_path == path => {}
            Some(existing_path) => {
                let existing_path = existing_path.clone();
                tracing::warn!(
                    "Inode {} is claimed by both '{}' and '{}'",
                    inode,
                    existing_path,
                    path
                );
                // The oracle breaks the tie; with no oracle (or no
                // opinion) the first-seen path stays.
                if let Some(oracle) = self.oracle {
                    let new_known = oracle.path_exists(&path);
                    let old_known = oracle.path_exists(&existing_path);
                    if new_known && !old_known {
                        tracing::info!(
                            "Using '{}'; '{}' is unknown to the path oracle",
                            path,
                            existing_path
                        );
                        self.namespace.inode_paths.insert(inode, path);
                    } else if old_known {
                        tracing::info!("Keeping '{}' per the path oracle", existing_path);
                    } else {
                        tracing::info!(
                            "Neither path is known to the oracle; keeping '{}'",
                            existing_path
                        );
                    }
                }
                result = Registration::Conflict;
            }
        }
        Ok(result)
    }

    /// Recurse into the directory-valued entries of one parsed block.
    /// `chain` ends with the directory the entries belong to.
    fn process_entries(
        &mut self,
        dir_path: &str,
        entries: &[DirEntry],
        chain: &mut Vec<Ancestor>,
    ) -> Result<()> {
        let parent_inode = chain.last().map(|a| a.inode).unwrap_or(ROOT_INODE);
        for entry in entries {
            if entry.name == "." || entry.name == ".." {
                continue;
            }
            if entry.file_type != FT_DIRECTORY || entry.zero_inode {
                continue;
            }
            if entry.inode > self.fs.inode_count() {
                continue;
            }
            if chain.len() >= self.options.max_depth {
                tracing::warn!("Depth bound reached below '{}'", dir_path);
                continue;
            }
            // Any inode repeating on the ancestor path is a loop.
            if chain.iter().any(|a| a.inode == entry.inode) {
                tracing::warn!(
                    "Detected loop for inode {} ('{}/{}')",
                    entry.inode,
                    dir_path,
                    entry.name
                );
                continue;
            }
            if self.namespace.inode_paths.contains_key(&entry.inode) {
                continue;
            }
            let child_inode = self.fs.inode(entry.inode)?;
            if let Some(after) = self.options.after {
                if !entry.reallocated && child_inode.dtime != 0 && child_inode.dtime < after {
                    continue;
                }
            }

            let child_path = if dir_path.is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", dir_path, entry.name)
            };
            let child_first = match self.dir_inode_to_block[entry.inode as usize].first() {
                Some(block) => block,
                None => {
                    tracing::info!("Cannot find a directory block for inode {}", entry.inode);
                    continue;
                }
            };

            if !entry.deleted && entry.allocated && !entry.reallocated {
                // A directory that still exists: all of its blocks are
                // reachable through its inode.
                if matches!(
                    self.register_directory(child_path.clone(), entry.inode, child_first)?,
                    Registration::ReEntry
                ) {
                    continue;
                }
                let (blocks, outcome) = collect_data_blocks(self.fs, &child_inode)?;
                if outcome == WalkOutcome::Corrupted {
                    tracing::warn!(
                        "Existing directory inode {} has corrupted indirect blocks",
                        entry.inode
                    );
                }
                chain.push(Ancestor {
                    inode: entry.inode,
                    dtime: child_inode.dtime,
                });
                for block in blocks {
                    let parsed = self.read_directory_block(block)?;
                    self.process_entries(&child_path, &parsed.entries, chain)?;
                }
                chain.pop();
            } else {
                // Deleted: only the resolved first block is trustworthy.
                // Recursive removal stamps parents slightly before their
                // children, so allow the configured slack.
                let ancestor_dtime = chain
                    .iter()
                    .rev()
                    .find(|a| a.dtime != 0)
                    .map(|a| a.dtime)
                    .unwrap_or(0);
                if ancestor_dtime != 0
                    && ancestor_dtime + DELETE_SLACK_SECS < child_inode.dtime
                {
                    tracing::debug!(
                        "Skipping '{}': deleted after its ancestors",
                        child_path
                    );
                    continue;
                }
                // The block must agree that this parent is its parent.
                let child_data = self.fs.read_block(child_first)?;
                let dot = RawDirEntry::parse(&child_data, 0);
                let dot_dot = dot
                    .as_ref()
                    .and_then(|d| RawDirEntry::parse(&child_data, d.rec_len as usize));
                let parent_matches = match (&dot, &dot_dot) {
                    (Some(dot), Some(dot_dot)) => {
                        dot.is_dot() && dot_dot.is_dot_dot() && dot_dot.inode == parent_inode
                    }
                    _ => false,
                };
                if !parent_matches {
                    tracing::info!("The directory '{}' is lost", child_path);
                    continue;
                }
                if matches!(
                    self.register_directory(child_path.clone(), entry.inode, child_first)?,
                    Registration::ReEntry
                ) {
                    continue;
                }
                let parsed = self.read_directory_block(child_first)?;
                chain.push(Ancestor {
                    inode: entry.inode,
                    dtime: child_inode.dtime,
                });
                self.process_entries(&child_path, &parsed.entries, chain)?;
                chain.pop();
            }
        }
        Ok(())
    }

    /// Attribute each extended block to its owning inode and append it to
    /// that directory
    fn graft_extended_blocks(&mut self) -> Result<()> {
        let extended = self.extended_blocks.clone();
        if !extended.is_empty() {
            tracing::info!("Processing {} extended directory blocks", extended.len());
        }
        for block in extended {
            let hint = self.journal.dir_inode_hint(block);
            let parsed = self.read_directory_block(block)?;

            // Every directory-valued entry votes for the parent its own
            // first block records as `..`.
            let mut linked_votes: HashMap<u32, u32> = HashMap::new();
            let mut unlinked_votes: HashMap<u32, u32> = HashMap::new();
            for entry in &parsed.entries {
                if entry.file_type != FT_DIRECTORY || entry.zero_inode {
                    continue;
                }
                let child_first = match self
                    .dir_inode_to_block
                    .get(entry.inode as usize)
                    .and_then(|list| list.first())
                {
                    Some(block) => block,
                    None => {
                        tracing::info!(
                            "Cannot find a directory block for inode {}",
                            entry.inode
                        );
                        break;
                    }
                };
                let child_data = self.fs.read_block(child_first)?;
                let dot = match RawDirEntry::parse(&child_data, 0) {
                    Some(dot) if dot.is_dot() && dot.inode == entry.inode => dot,
                    _ => continue,
                };
                let dot_dot = match RawDirEntry::parse(&child_data, dot.rec_len as usize) {
                    Some(dot_dot) if dot_dot.is_dot_dot() && dot_dot.inode != 0 => dot_dot,
                    _ => continue,
                };
                let votes = if entry.linked {
                    &mut linked_votes
                } else {
                    &mut unlinked_votes
                };
                *votes.entry(dot_dot.inode).or_default() += 1;
            }

            let linked = !linked_votes.is_empty();
            let votes = if linked { linked_votes } else { unlinked_votes };
            if !votes.is_empty() {
                let max_count = votes.values().copied().max().unwrap();
                let mut winners: Vec<u32> = votes
                    .iter()
                    .filter(|(_, &count)| count == max_count)
                    .map(|(&inode, _)| inode)
                    .collect();
                winners.sort_unstable();
                let winner = match hint {
                    Some(hinted) if winners.len() > 1 && winners.contains(&hinted) => hinted,
                    _ => winners[0],
                };
                tracing::info!(
                    "Extended directory at {} belongs to inode {} (from {} {} directories)",
                    block,
                    winner,
                    max_count,
                    if linked { "linked" } else { "unlinked" }
                );
                if let Some(hinted) = hint {
                    if hinted != winner {
                        tracing::warn!(
                            "According to the journal, block {} should belong to inode {}",
                            block,
                            hinted
                        );
                    }
                }
                self.link_extended_block(block, &parsed, winner)?;
                continue;
            }

            // No votes: fall back to filename heuristics, then to the
            // journal's opinion.
            let filenames: BTreeSet<String> = parsed
                .entries
                .iter()
                .map(|entry| entry.name.clone())
                .collect();
            if filenames.is_empty() {
                if let Some(hinted) = hint {
                    tracing::info!(
                        "Extended directory at {} belongs to inode {} (empty; from journal)",
                        block,
                        hinted
                    );
                    self.link_extended_block(block, &parsed, hinted)?;
                } else {
                    tracing::warn!(
                        "Could not find an inode for empty extended directory at {}",
                        block
                    );
                }
                continue;
            }
            let guessed = self
                .oracle
                .and_then(|oracle| oracle.parent_directory(block, &filenames));
            match guessed {
                Some(dir_path) => match self.namespace.directories.get(&dir_path) {
                    Some(directory) => {
                        let owner = directory.inode;
                        tracing::info!(
                            "Extended directory at {} belongs to inode {}",
                            block,
                            owner
                        );
                        if let Some(hinted) = hint {
                            if hinted != owner {
                                tracing::warn!(
                                    "According to the journal, block {} should belong to inode {}",
                                    block,
                                    hinted
                                );
                            }
                        }
                        self.link_extended_block(block, &parsed, owner)?;
                    }
                    None => {
                        tracing::warn!(
                            "Extended directory at {} belongs to directory '{}', which does not \
                             exist",
                            block,
                            dir_path
                        );
                        if let Some(hinted) = hint {
                            tracing::info!(
                                "Extended directory at {} belongs to inode {} (fall back to \
                                 journal)",
                                block,
                                hinted
                            );
                            self.link_extended_block(block, &parsed, hinted)?;
                        }
                    }
                },
                None => {
                    if let Some(hinted) = hint {
                        tracing::info!(
                            "Extended directory at {} belongs to inode {} (from journal)",
                            block,
                            hinted
                        );
                        self.link_extended_block(block, &parsed, hinted)?;
                    } else {
                        tracing::warn!(
                            "Could not find an inode for extended directory at {}; its contents \
                             are preserved but unreachable",
                            block
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Append an extended block to its owner and descend into it
    fn link_extended_block(
        &mut self,
        block: u32,
        parsed: &DirectoryBlock,
        inode: u32,
    ) -> Result<()> {
        let path = match self.namespace.path_of_inode(inode) {
            Some(path) => path.to_string(),
            None => {
                tracing::warn!(
                    "Can't link block {} to inode {}: that inode is not in the namespace",
                    block,
                    inode
                );
                return Ok(());
            }
        };
        if let Some(directory) = self.namespace.directories.get_mut(&path) {
            if directory.blocks.iter().any(|b| b.block == block) {
                return Ok(());
            }
            directory.blocks.push(parsed.clone());
        }
        // Subdirectories reachable only through this block still need
        // their paths assigned.
        let dtime = self.fs.inode(inode)?.dtime;
        let mut chain = vec![Ancestor { inode, dtime }];
        self.process_entries(&path, &parsed.entries, &mut chain)
    }
}

/// Rebuild a namespace (and the per-inode block lists) from stage 2 cache
/// records
pub fn namespace_from_records(
    fs: &Filesystem,
    accepted: &BTreeSet<String>,
    records: &[crate::recovery::cache::Stage2Record],
) -> Result<ResolveOutput> {
    let mut namespace = Namespace::default();
    let mut lists = vec![BlockList::default(); fs.inode_count() as usize + 1];
    for record in records {
        if record.inode == 0 || record.inode > fs.inode_count() {
            anyhow::bail!("Stage 2 cache names inode {} out of range", record.inode);
        }
        let mut blocks = Vec::with_capacity(record.blocks.len());
        for &block in &record.blocks {
            let data = fs.read_block(block)?;
            blocks.push(parse_directory_block(fs, accepted, block, &data)?);
        }
        lists[record.inode as usize] = BlockList::from(record.blocks.clone());
        namespace.directories.insert(
            record.path.clone(),
            Directory {
                inode: record.inode,
                blocks,
            },
        );
        namespace
            .inode_paths
            .entry(record.inode)
            .or_insert_with(|| record.path.clone());
    }
    Ok(ResolveOutput {
        namespace,
        dir_inode_to_block: lists,
    })
}
