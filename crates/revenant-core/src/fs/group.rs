//! Block-group descriptor table parsing

use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// On-disk size of one group descriptor
pub const GROUP_DESC_SIZE: usize = 32;

/// Starting block numbers of one group's metadata structures
#[derive(Debug, Clone)]
pub struct GroupDescriptor {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl GroupDescriptor {
    /// Parse one 32-byte descriptor record
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < GROUP_DESC_SIZE {
            anyhow::bail!("Insufficient data for group descriptor");
        }
        let mut cursor = Cursor::new(data);
        let block_bitmap = cursor.read_u32::<LittleEndian>()?;
        let inode_bitmap = cursor.read_u32::<LittleEndian>()?;
        let inode_table = cursor.read_u32::<LittleEndian>()?;
        let free_blocks_count = cursor.read_u16::<LittleEndian>()?;
        let free_inodes_count = cursor.read_u16::<LittleEndian>()?;
        let used_dirs_count = cursor.read_u16::<LittleEndian>()?;
        Ok(GroupDescriptor {
            block_bitmap,
            inode_bitmap,
            inode_table,
            free_blocks_count,
            free_inodes_count,
            used_dirs_count,
        })
    }

    /// Parse the full descriptor table for `groups` block groups
    pub fn parse_table(data: &[u8], groups: usize) -> Result<Vec<GroupDescriptor>> {
        if data.len() < groups * GROUP_DESC_SIZE {
            anyhow::bail!(
                "Group descriptor table truncated: {} bytes for {} groups",
                data.len(),
                groups
            );
        }
        (0..groups)
            .map(|g| GroupDescriptor::parse(&data[g * GROUP_DESC_SIZE..]))
            .collect()
    }
}
