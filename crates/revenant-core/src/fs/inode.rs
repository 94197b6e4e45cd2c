//! ext3-family inode records
//!
//! Only the classic 128-byte core is parsed; larger on-disk inode sizes
//! carry extra space after it that this engine never needs.

use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Number of direct block pointers in an inode
pub const NDIR_BLOCKS: usize = 12;
/// Index of the single-indirect pointer
pub const IND_BLOCK: usize = 12;
/// Index of the double-indirect pointer
pub const DIND_BLOCK: usize = 13;
/// Index of the triple-indirect pointer
pub const TIND_BLOCK: usize = 14;
/// Total pointer slots in the inode block array
pub const N_BLOCKS: usize = 15;

/// Size of the classic inode record core
pub const INODE_CORE_SIZE: usize = 128;

const MODE_TYPE_MASK: u16 = 0xF000;

/// Inode type, taken from the high nibble of the mode field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    Fifo,
    CharDevice,
    Directory,
    BlockDevice,
    Regular,
    Symlink,
    Socket,
    Unknown,
}

impl std::fmt::Display for InodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InodeKind::Fifo => "FIFO",
            InodeKind::CharDevice => "character device",
            InodeKind::Directory => "directory",
            InodeKind::BlockDevice => "block device",
            InodeKind::Regular => "regular file",
            InodeKind::Symlink => "symbolic link",
            InodeKind::Socket => "socket",
            InodeKind::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Parsed inode record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub mode: u16,
    pub uid: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid: u16,
    pub links_count: u16,
    /// Block count in 512-byte units
    pub blocks: u32,
    pub flags: u32,
    /// Twelve direct pointers, then single-, double-, triple-indirect
    pub block: [u32; N_BLOCKS],
    pub generation: u32,
}

impl Inode {
    /// Parse the 128-byte inode core
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < INODE_CORE_SIZE {
            anyhow::bail!("Insufficient data for inode: {} bytes", data.len());
        }
        let mut cursor = Cursor::new(data);
        let mode = cursor.read_u16::<LittleEndian>()?;
        let uid = cursor.read_u16::<LittleEndian>()?;
        let size = cursor.read_u32::<LittleEndian>()?;
        let atime = cursor.read_u32::<LittleEndian>()?;
        let ctime = cursor.read_u32::<LittleEndian>()?;
        let mtime = cursor.read_u32::<LittleEndian>()?;
        let dtime = cursor.read_u32::<LittleEndian>()?;
        let gid = cursor.read_u16::<LittleEndian>()?;
        let links_count = cursor.read_u16::<LittleEndian>()?;
        let blocks = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u32::<LittleEndian>()?;
        let _osd1 = cursor.read_u32::<LittleEndian>()?;
        let mut block = [0u32; N_BLOCKS];
        for slot in block.iter_mut() {
            *slot = cursor.read_u32::<LittleEndian>()?;
        }
        let generation = cursor.read_u32::<LittleEndian>()?;

        Ok(Inode {
            mode,
            uid,
            size,
            atime,
            ctime,
            mtime,
            dtime,
            gid,
            links_count,
            blocks,
            flags,
            block,
            generation,
        })
    }

    pub fn kind(&self) -> InodeKind {
        match self.mode & MODE_TYPE_MASK {
            0x1000 => InodeKind::Fifo,
            0x2000 => InodeKind::CharDevice,
            0x4000 => InodeKind::Directory,
            0x6000 => InodeKind::BlockDevice,
            0x8000 => InodeKind::Regular,
            0xA000 => InodeKind::Symlink,
            0xC000 => InodeKind::Socket,
            _ => InodeKind::Unknown,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind() == InodeKind::Directory
    }

    pub fn is_regular(&self) -> bool {
        self.kind() == InodeKind::Regular
    }

    pub fn is_symlink(&self) -> bool {
        self.kind() == InodeKind::Symlink
    }

    /// Permission bits (plus setuid/setgid/sticky), without the type nibble
    pub fn permissions(&self) -> u32 {
        (self.mode & 0o7777) as u32
    }

    /// A symlink with zero block count stores its target inline in the
    /// pointer array
    pub fn has_inline_symlink_target(&self) -> bool {
        self.is_symlink() && self.blocks == 0
    }

    /// The pointer array re-serialized as raw bytes, for inline symlink
    /// targets
    pub fn block_array_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(N_BLOCKS * 4);
        for word in &self.block {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes
    }
}
