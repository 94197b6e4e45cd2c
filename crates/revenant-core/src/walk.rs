//! Indirect-block walker
//!
//! Iterates the data blocks of an inode in file order: twelve direct
//! pointers, then the single-, double-, and triple-indirect chains. A
//! pointer block that no longer classifies as indirect data ends the walk
//! with `Corrupted`; everything visited up to that point stands.

use anyhow::Result;

use crate::classify::indirect_words_valid;
use crate::fs::inode::{Inode, DIND_BLOCK, IND_BLOCK, NDIR_BLOCKS, TIND_BLOCK};
use crate::metadata::Filesystem;

/// Visit data blocks
pub const MASK_DIRECT: u8 = 0b01;
/// Visit indirect pointer blocks themselves
pub const MASK_POINTERS: u8 = 0b10;

/// What a visited block holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Data,
    Pointer,
}

/// Result of a completed walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    Clean,
    /// An indirect pointer block was reused or overwritten mid-chain
    Corrupted,
}

enum Step {
    Continue,
    Abort,
    Corrupt,
}

/// Walk the blocks of an inode, invoking `visitor(block, kind)` for each.
///
/// The visitor returns `false` to abort the walk early; an aborted walk
/// reports `Clean`. Symlinks with a zero block count are skipped entirely,
/// since their pointer array holds target text rather than block numbers.
pub fn walk_blocks<F>(
    fs: &Filesystem,
    inode: &Inode,
    mask: u8,
    visitor: &mut F,
) -> Result<WalkOutcome>
where
    F: FnMut(u32, BlockKind) -> bool,
{
    if inode.is_symlink() && inode.blocks == 0 {
        return Ok(WalkOutcome::Clean);
    }

    if mask & MASK_DIRECT != 0 {
        for &block in &inode.block[..NDIR_BLOCKS] {
            if block != 0 && !visitor(block, BlockKind::Data) {
                return Ok(WalkOutcome::Clean);
            }
        }
    }

    let ind = inode.block[IND_BLOCK];
    if ind != 0 {
        if mask & MASK_POINTERS != 0 && !visitor(ind, BlockKind::Pointer) {
            return Ok(WalkOutcome::Clean);
        }
        if mask & MASK_DIRECT != 0 {
            match walk_single(fs, ind, visitor)? {
                Step::Continue => {}
                Step::Abort => return Ok(WalkOutcome::Clean),
                Step::Corrupt => return Ok(WalkOutcome::Corrupted),
            }
        }
    }

    let dind = inode.block[DIND_BLOCK];
    if dind != 0 {
        if mask & MASK_POINTERS != 0 && !visitor(dind, BlockKind::Pointer) {
            return Ok(WalkOutcome::Clean);
        }
        match walk_double(fs, dind, mask, visitor)? {
            Step::Continue => {}
            Step::Abort => return Ok(WalkOutcome::Clean),
            Step::Corrupt => return Ok(WalkOutcome::Corrupted),
        }
    }

    let tind = inode.block[TIND_BLOCK];
    if tind != 0 {
        if mask & MASK_POINTERS != 0 && !visitor(tind, BlockKind::Pointer) {
            return Ok(WalkOutcome::Clean);
        }
        match walk_triple(fs, tind, mask, visitor)? {
            Step::Continue => {}
            Step::Abort => return Ok(WalkOutcome::Clean),
            Step::Corrupt => return Ok(WalkOutcome::Corrupted),
        }
    }

    Ok(WalkOutcome::Clean)
}

fn entries_of(fs: &Filesystem, block: u32) -> Result<Option<Vec<u32>>> {
    let data = fs.read_block(block)?;
    if !indirect_words_valid(fs.block_count(), &data) {
        return Ok(None);
    }
    Ok(Some(
        data.chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .take_while(|&w| w != 0)
            .collect(),
    ))
}

fn walk_single<F>(fs: &Filesystem, block: u32, visitor: &mut F) -> Result<Step>
where
    F: FnMut(u32, BlockKind) -> bool,
{
    let entries = match entries_of(fs, block)? {
        Some(entries) => entries,
        None => return Ok(Step::Corrupt),
    };
    for entry in entries {
        if !visitor(entry, BlockKind::Data) {
            return Ok(Step::Abort);
        }
    }
    Ok(Step::Continue)
}

fn walk_double<F>(fs: &Filesystem, block: u32, mask: u8, visitor: &mut F) -> Result<Step>
where
    F: FnMut(u32, BlockKind) -> bool,
{
    let entries = match entries_of(fs, block)? {
        Some(entries) => entries,
        None => return Ok(Step::Corrupt),
    };
    for entry in entries {
        if mask & MASK_POINTERS != 0 && !visitor(entry, BlockKind::Pointer) {
            return Ok(Step::Abort);
        }
        if mask & MASK_DIRECT != 0 {
            match walk_single(fs, entry, visitor)? {
                Step::Continue => {}
                other => return Ok(other),
            }
        }
    }
    Ok(Step::Continue)
}

fn walk_triple<F>(fs: &Filesystem, block: u32, mask: u8, visitor: &mut F) -> Result<Step>
where
    F: FnMut(u32, BlockKind) -> bool,
{
    let entries = match entries_of(fs, block)? {
        Some(entries) => entries,
        None => return Ok(Step::Corrupt),
    };
    for entry in entries {
        if mask & MASK_POINTERS != 0 && !visitor(entry, BlockKind::Pointer) {
            return Ok(Step::Abort);
        }
        match walk_double(fs, entry, mask, visitor)? {
            Step::Continue => {}
            other => return Ok(other),
        }
    }
    Ok(Step::Continue)
}

/// Collect an inode's data blocks in file order
pub fn collect_data_blocks(fs: &Filesystem, inode: &Inode) -> Result<(Vec<u32>, WalkOutcome)> {
    let mut blocks = Vec::new();
    let outcome = walk_blocks(fs, inode, MASK_DIRECT, &mut |block, _| {
        blocks.push(block);
        true
    })?;
    Ok((blocks, outcome))
}

/// Whether the inode's block list mentions a specific block
pub fn references_block(fs: &Filesystem, inode: &Inode, wanted: u32) -> Result<bool> {
    let mut found = false;
    walk_blocks(fs, inode, MASK_DIRECT | MASK_POINTERS, &mut |block, _| {
        if block == wanted {
            found = true;
            return false;
        }
        true
    })?;
    Ok(found)
}
