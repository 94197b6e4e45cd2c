//! ext3-family superblock parsing
//!
//! The superblock is 1024 bytes of little-endian fields starting at file
//! offset 1024, regardless of the block size it describes.

use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Seek, SeekFrom};

/// Byte offset of the primary superblock within the image
pub const SUPERBLOCK_OFFSET: u64 = 1024;

/// Size of the on-disk superblock record
pub const SUPERBLOCK_SIZE: usize = 1024;

/// Filesystem magic number
pub const EXT_MAGIC: u16 = 0xEF53;

/// Creator OS code for Linux
pub const CREATOR_OS_LINUX: u32 = 0;

/// Inode number of the root directory
pub const ROOT_INODE: u32 = 2;

/// Immutable snapshot of the superblock fields the engine needs
#[derive(Debug, Clone)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub first_data_block: u32,
    /// Block size is `1024 << log_block_size`; the log form is retained
    pub log_block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub mtime: u32,
    pub wtime: u32,
    pub magic: u16,
    pub state: u16,
    pub creator_os: u32,
    pub rev_level: u32,
    pub inode_size: u16,
    pub block_group_nr: u16,
    pub feature_compat: u32,
    pub journal_inum: u32,
}

impl Superblock {
    /// Parse the primary superblock from its 1024-byte on-disk record
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < SUPERBLOCK_SIZE {
            anyhow::bail!("Insufficient data for superblock: {} bytes", data.len());
        }

        let mut cursor = Cursor::new(data);
        let inodes_count = cursor.read_u32::<LittleEndian>()?;
        let blocks_count = cursor.read_u32::<LittleEndian>()?;
        let _r_blocks_count = cursor.read_u32::<LittleEndian>()?;
        let _free_blocks_count = cursor.read_u32::<LittleEndian>()?;
        let _free_inodes_count = cursor.read_u32::<LittleEndian>()?;
        let first_data_block = cursor.read_u32::<LittleEndian>()?;
        let log_block_size = cursor.read_u32::<LittleEndian>()?;
        let _log_frag_size = cursor.read_u32::<LittleEndian>()?;
        let blocks_per_group = cursor.read_u32::<LittleEndian>()?;
        let _frags_per_group = cursor.read_u32::<LittleEndian>()?;
        let inodes_per_group = cursor.read_u32::<LittleEndian>()?;
        let mtime = cursor.read_u32::<LittleEndian>()?;
        let wtime = cursor.read_u32::<LittleEndian>()?;
        let _mnt_count = cursor.read_u16::<LittleEndian>()?;
        let _max_mnt_count = cursor.read_u16::<LittleEndian>()?;
        let magic = cursor.read_u16::<LittleEndian>()?;
        let state = cursor.read_u16::<LittleEndian>()?;
        let _errors = cursor.read_u16::<LittleEndian>()?;
        let _minor_rev_level = cursor.read_u16::<LittleEndian>()?;
        let _lastcheck = cursor.read_u32::<LittleEndian>()?;
        let _checkinterval = cursor.read_u32::<LittleEndian>()?;
        let creator_os = cursor.read_u32::<LittleEndian>()?;
        let rev_level = cursor.read_u32::<LittleEndian>()?;
        let _def_resuid = cursor.read_u16::<LittleEndian>()?;
        let _def_resgid = cursor.read_u16::<LittleEndian>()?;
        let _first_ino = cursor.read_u32::<LittleEndian>()?;
        let inode_size = cursor.read_u16::<LittleEndian>()?;
        let block_group_nr = cursor.read_u16::<LittleEndian>()?;
        let feature_compat = cursor.read_u32::<LittleEndian>()?;

        cursor.seek(SeekFrom::Start(0xE0))?;
        let journal_inum = cursor.read_u32::<LittleEndian>()?;

        if magic != EXT_MAGIC {
            anyhow::bail!("Bad superblock magic 0x{:04x} (expected 0x{:04x})", magic, EXT_MAGIC);
        }
        if creator_os != CREATOR_OS_LINUX {
            anyhow::bail!("Unsupported creator OS {}", creator_os);
        }
        if block_group_nr != 0 {
            anyhow::bail!("Not the primary superblock copy (block group {})", block_group_nr);
        }
        if blocks_per_group == 0 || inodes_per_group == 0 {
            anyhow::bail!("Superblock group geometry is zero");
        }

        Ok(Superblock {
            inodes_count,
            blocks_count,
            first_data_block,
            log_block_size,
            blocks_per_group,
            inodes_per_group,
            mtime,
            wtime,
            magic,
            state,
            creator_os,
            rev_level,
            inode_size,
            block_group_nr,
            feature_compat,
            journal_inum,
        })
    }

    pub fn block_size(&self) -> u32 {
        1024 << self.log_block_size
    }

    /// Number of block groups on the filesystem
    pub fn group_count(&self) -> u32 {
        self.inodes_count / self.inodes_per_group
    }

    /// Effective per-inode record size (revision 0 has fixed 128-byte inodes)
    pub fn inode_record_size(&self) -> u32 {
        if self.rev_level == 0 {
            128
        } else {
            self.inode_size as u32
        }
    }

    /// Blocks occupied by one group's inode table
    pub fn inode_table_blocks(&self) -> u32 {
        self.inodes_per_group * self.inode_record_size() / self.block_size()
    }
}
