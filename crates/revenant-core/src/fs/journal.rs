//! On-disk journal record formats
//!
//! All numeric journal fields are big-endian, unlike the rest of the
//! filesystem. A journal block whose first four bytes are the magic is a
//! structure block; its type distinguishes the superblock, descriptor,
//! commit, and revoke records.

use anyhow::Result;
use byteorder::{BigEndian, ReadBytesExt};
use std::io::Cursor;

/// Magic number opening every journal structure block
pub const JOURNAL_MAGIC: u32 = 0xC03B_3998;

/// Journal block types
pub const BLOCKTYPE_DESCRIPTOR: u32 = 1;
pub const BLOCKTYPE_COMMIT: u32 = 2;
pub const BLOCKTYPE_SUPERBLOCK_V1: u32 = 3;
pub const BLOCKTYPE_SUPERBLOCK_V2: u32 = 4;
pub const BLOCKTYPE_REVOKE: u32 = 5;

/// Descriptor tag flags
pub const FLAG_ESCAPE: u32 = 1;
pub const FLAG_SAME_UUID: u32 = 2;
pub const FLAG_DELETED: u32 = 4;
pub const FLAG_LAST_TAG: u32 = 8;

/// Size of the common journal block header
pub const JOURNAL_HEADER_SIZE: usize = 12;
/// Size of one descriptor tag
pub const TAG_SIZE: usize = 8;
/// UUID bytes following a tag without `FLAG_SAME_UUID`
pub const TAG_UUID_SIZE: usize = 16;
/// Size of the revoke block header (common header plus count)
pub const REVOKE_HEADER_SIZE: usize = 16;

/// Common header of every journal structure block
#[derive(Debug, Clone, Copy)]
pub struct JournalHeader {
    pub magic: u32,
    pub blocktype: u32,
    pub sequence: u32,
}

impl JournalHeader {
    /// Parse a header; `None` when the block does not carry the magic
    pub fn parse(data: &[u8]) -> Option<JournalHeader> {
        if data.len() < JOURNAL_HEADER_SIZE {
            return None;
        }
        let magic = u32::from_be_bytes(data[0..4].try_into().unwrap());
        if magic != JOURNAL_MAGIC {
            return None;
        }
        Some(JournalHeader {
            magic,
            blocktype: u32::from_be_bytes(data[4..8].try_into().unwrap()),
            sequence: u32::from_be_bytes(data[8..12].try_into().unwrap()),
        })
    }
}

/// Journal superblock, stored in the journal's first data block
#[derive(Debug, Clone)]
pub struct JournalSuperblock {
    pub blocktype: u32,
    pub blocksize: u32,
    /// Total number of blocks in the journal file
    pub maxlen: u32,
    /// First journal block carrying log data
    pub first: u32,
    /// First expected commit sequence
    pub sequence: u32,
    pub start: u32,
}

impl JournalSuperblock {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = JournalHeader::parse(data)
            .ok_or_else(|| anyhow::anyhow!("Journal superblock magic missing"))?;
        if header.blocktype != BLOCKTYPE_SUPERBLOCK_V1 && header.blocktype != BLOCKTYPE_SUPERBLOCK_V2 {
            anyhow::bail!("Unexpected journal superblock type {}", header.blocktype);
        }
        let mut cursor = Cursor::new(&data[JOURNAL_HEADER_SIZE..]);
        let blocksize = cursor.read_u32::<BigEndian>()?;
        let maxlen = cursor.read_u32::<BigEndian>()?;
        let first = cursor.read_u32::<BigEndian>()?;
        let sequence = cursor.read_u32::<BigEndian>()?;
        let start = cursor.read_u32::<BigEndian>()?;
        Ok(JournalSuperblock {
            blocktype: header.blocktype,
            blocksize,
            maxlen,
            first,
            sequence,
            start,
        })
    }
}

/// One tag inside a descriptor block: the filesystem block the following
/// journal block snapshots, plus its flags
#[derive(Debug, Clone, Copy)]
pub struct BlockTag {
    pub blocknr: u32,
    pub flags: u32,
}

impl BlockTag {
    pub fn is_last(&self) -> bool {
        self.flags & FLAG_LAST_TAG != 0
    }

    pub fn is_escaped(&self) -> bool {
        self.flags & FLAG_ESCAPE != 0
    }
}

/// Parse the tag list of a descriptor block, in order.
///
/// Tags without `FLAG_SAME_UUID` are followed by 16 UUID bytes. The list
/// ends at `FLAG_LAST_TAG` or when the block space runs out.
pub fn parse_descriptor_tags(data: &[u8]) -> Vec<BlockTag> {
    let mut tags = Vec::new();
    let mut offset = JOURNAL_HEADER_SIZE;
    while offset + TAG_SIZE <= data.len() {
        let tag = BlockTag {
            blocknr: u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap()),
            flags: u32::from_be_bytes(data[offset + 4..offset + 8].try_into().unwrap()),
        };
        offset += TAG_SIZE;
        if tag.flags & FLAG_SAME_UUID == 0 {
            offset += TAG_UUID_SIZE;
        }
        let last = tag.is_last();
        tags.push(tag);
        if last {
            break;
        }
    }
    tags
}

/// Parse the block list of a revoke block
pub fn parse_revoke_blocks(data: &[u8]) -> Result<Vec<u32>> {
    if data.len() < REVOKE_HEADER_SIZE {
        anyhow::bail!("Revoke block too small");
    }
    let count = u32::from_be_bytes(data[12..16].try_into().unwrap()) as usize;
    if count < REVOKE_HEADER_SIZE || count > data.len() {
        anyhow::bail!("Revoke block count {} out of range", count);
    }
    let entries = (count - REVOKE_HEADER_SIZE) / 4;
    let mut blocks = Vec::with_capacity(entries);
    for i in 0..entries {
        let off = REVOKE_HEADER_SIZE + i * 4;
        blocks.push(u32::from_be_bytes(data[off..off + 4].try_into().unwrap()));
    }
    Ok(blocks)
}
