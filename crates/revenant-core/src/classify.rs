//! Block classification
//!
//! Decides, for an arbitrary block, whether it currently holds the start
//! of a directory, a directory continuation, or an indirect pointer
//! block. Classification is purely syntactic: the record-length chain
//! must cover the block exactly, every name must be plausible, and every
//! referenced inode or block number must be in range.

use std::collections::BTreeSet;

use anyhow::Result;

use crate::fs::dirent::{
    rec_len_for, RawDirEntry, FT_DIRECTORY, FT_MAX, FT_UNKNOWN,
};
use crate::metadata::Filesystem;

/// Outcome of directory classification for one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirBlockKind {
    /// Not directory data
    NotDir,
    /// First block of a directory: leading `.` and `..` entries
    DirStart,
    /// Structurally valid entries without the leading `.`/`..` pair
    DirExtended,
}

/// Options for `classify_directory`
#[derive(Debug, Clone, Copy)]
pub struct ClassifyOptions {
    /// Demote `DirExtended` to `NotDir` without validating the chain fully
    pub start_only: bool,
    /// The caller believes this block is (still) linked from an inode
    pub certainly_linked: bool,
    /// Start the record-length walk at this offset
    pub offset: usize,
}

impl Default for ClassifyOptions {
    fn default() -> Self {
        ClassifyOptions {
            start_only: true,
            certainly_linked: true,
            offset: 0,
        }
    }
}

/// Legality of a single filename byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilenameChar {
    Ok,
    Illegal,
    Unlikely,
}

/// Classify one filename byte.
///
/// Bytes outside printable ASCII and `/` are illegal anywhere. A handful
/// of printable characters are legal but so unusual in practice that a
/// block containing them is rejected unless the user whitelisted the name.
pub fn classify_filename_char(c: u8) -> FilenameChar {
    if c < 32 || c > 126 || c == b'/' {
        return FilenameChar::Illegal;
    }
    match c {
        b'"' | b'*' | b';' | b'<' | b'>' | b'?' | b'\\' | b'`' | b'|' => FilenameChar::Unlikely,
        _ => FilenameChar::Ok,
    }
}

/// Classify a block as directory data.
///
/// `inode_count` and `block_size` come from the superblock; `accepted` is
/// the user-supplied whitelist of unlikely-but-legal filenames.
pub fn classify_directory(
    inode_count: u32,
    block_size: usize,
    accepted: &BTreeSet<String>,
    data: &[u8],
    blocknr: u32,
    opts: &ClassifyOptions,
) -> DirBlockKind {
    debug_assert!(!opts.start_only || opts.offset == 0);
    walk_chain(
        inode_count,
        block_size,
        accepted,
        data,
        blocknr,
        opts.start_only,
        opts.certainly_linked,
        opts.offset,
    )
}

#[allow(clippy::too_many_arguments)]
fn walk_chain(
    inode_count: u32,
    block_size: usize,
    accepted: &BTreeSet<String>,
    data: &[u8],
    blocknr: u32,
    start_block: bool,
    certainly_linked: bool,
    offset: usize,
) -> DirBlockKind {
    // Entries are 4-byte aligned.
    if offset % 4 != 0 {
        return DirBlockKind::NotDir;
    }
    // A minimal entry must fit.
    if offset + rec_len_for(1) > block_size {
        return DirBlockKind::NotDir;
    }
    let entry = match RawDirEntry::parse(data, offset) {
        Some(entry) => entry,
        None => return DirBlockKind::NotDir,
    };

    // The first block of a directory starts with `.` and `..`.
    let mut is_start = false;
    if offset == 0 {
        if let Some(second) = RawDirEntry::parse(data, rec_len_for(1)) {
            is_start = entry.is_dot()
                && entry.rec_len as usize == rec_len_for(1)
                && entry.file_type == FT_DIRECTORY
                && second.is_dot_dot()
                && second.file_type == FT_DIRECTORY;
        }
    }
    if start_block && !is_start {
        // The caller only wants start blocks; skip the full chain walk.
        return DirBlockKind::NotDir;
    }

    // Deleting a directory entry zeroes its inode but leaves the name.
    // A zero inode next to a nonsense name means this is not a directory
    // at all; next to a sensible name it is merely worth a warning when
    // the block was expected to be live.
    let mut zero_inode_warning = None;
    if entry.inode == 0 && entry.name_len > 0 {
        if entry
            .name
            .iter()
            .any(|&c| classify_filename_char(c) == FilenameChar::Illegal)
        {
            return DirBlockKind::NotDir;
        }
        if certainly_linked && (offset != 0 || start_block) {
            zero_inode_warning = Some(format!(
                "zero inode (name: \"{}\"; block: {}; offset 0x{:x})",
                entry.name_string(),
                blocknr,
                offset
            ));
        }
    }
    if entry.inode > inode_count {
        return DirBlockKind::NotDir;
    }
    if entry.name_len == 0 {
        return DirBlockKind::NotDir;
    }
    // The record length must make sense.
    let rec_len = entry.rec_len as usize;
    if rec_len % 4 != 0 || rec_len < rec_len_for(entry.name_len) || offset + rec_len > block_size {
        return DirBlockKind::NotDir;
    }
    // Extra paranoia when the whole block is one entry: linker symbol
    // tables and similar data frequently masquerade as that shape.
    if rec_len == block_size
        && (entry.file_type == FT_UNKNOWN
            || entry.file_type >= FT_MAX
            || entry.name_len == 1
            || entry.name.starts_with(b"_Z"))
    {
        return DirBlockKind::NotDir;
    }
    // The chain must terminate exactly at the block end.
    let next_offset = offset + rec_len;
    if next_offset != block_size
        && walk_chain(
            inode_count,
            block_size,
            accepted,
            data,
            blocknr,
            false,
            certainly_linked,
            next_offset,
        ) == DirBlockKind::NotDir
    {
        return DirBlockKind::NotDir;
    }

    // The name may only consist of acceptable characters.
    let mut ok = true;
    let mut illegal = false;
    for (i, &c) in entry.name.iter().enumerate() {
        if classify_filename_char(c) != FilenameChar::Ok {
            // Web caches leave names ending in '&nbsp;'; accept that ';'.
            if i + 1 == entry.name.len() && entry.name.len() > 6 && &entry.name[i - 5..=i] == b"&nbsp;"
            {
                continue;
            }
            ok = false;
            if classify_filename_char(c) == FilenameChar::Illegal {
                illegal = true;
                break;
            }
        }
    }
    if ok {
        if let Some(warning) = zero_inode_warning {
            tracing::warn!("{}", warning);
        }
    }
    if !ok && !illegal {
        let name = entry.name_string();
        if accepted.contains(&name) {
            ok = true;
        } else {
            tracing::warn!(
                "Rejecting possible directory (block {}) because an entry contains legal but \
                 unlikely characters: '{}'. If this looks like a filename, re-run with \
                 --accept='{}'",
                blocknr,
                name,
                name
            );
        }
    }

    if !ok {
        DirBlockKind::NotDir
    } else if is_start {
        DirBlockKind::DirStart
    } else {
        DirBlockKind::DirExtended
    }
}

/// Whether a buffer looks like an indirect pointer block: every non-zero
/// 32-bit word is a valid block number, and zeros form a terminal run.
pub fn indirect_words_valid(total_blocks: u32, data: &[u8]) -> bool {
    let mut seen_zero = false;
    for chunk in data.chunks_exact(4) {
        let word = u32::from_le_bytes(chunk.try_into().unwrap());
        if word == 0 {
            seen_zero = true;
        } else if seen_zero || word >= total_blocks {
            return false;
        }
    }
    true
}

/// Classify a block's contents as a single-indirect pointer block
pub fn classify_indirect(fs: &Filesystem, data: &[u8]) -> bool {
    indirect_words_valid(fs.block_count(), data)
}

/// Classify as a double-indirect block, reading each referenced block
pub fn classify_double_indirect(fs: &Filesystem, data: &[u8]) -> Result<bool> {
    if !indirect_words_valid(fs.block_count(), data) {
        return Ok(false);
    }
    for chunk in data.chunks_exact(4) {
        let word = u32::from_le_bytes(chunk.try_into().unwrap());
        if word == 0 {
            break;
        }
        let inner = fs.read_block(word)?;
        if !indirect_words_valid(fs.block_count(), &inner) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Classify as a triple-indirect block, recursing through both levels
pub fn classify_triple_indirect(fs: &Filesystem, data: &[u8]) -> Result<bool> {
    if !indirect_words_valid(fs.block_count(), data) {
        return Ok(false);
    }
    for chunk in data.chunks_exact(4) {
        let word = u32::from_le_bytes(chunk.try_into().unwrap());
        if word == 0 {
            break;
        }
        let inner = fs.read_block(word)?;
        if !classify_double_indirect(fs, &inner)? {
            return Ok(false);
        }
    }
    Ok(true)
}
