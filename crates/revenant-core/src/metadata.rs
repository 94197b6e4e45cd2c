//! Device and metadata loader
//!
//! Owns the image handle, the superblock snapshot, and the group
//! descriptor table, and lazily materializes per-group bitmaps and inode
//! tables on first touch. Loaded group state is retained for the life of
//! the process and never handed out by reference; inode lookups return
//! owned copies.

use anyhow::{Context, Result};
use std::cell::RefCell;
use std::path::{Path, PathBuf};

use crate::fs::bitmap;
use crate::fs::group::{GroupDescriptor, GROUP_DESC_SIZE};
use crate::fs::inode::Inode;
use crate::fs::superblock::{Superblock, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE};
use crate::fs::Image;

/// One group's lazily loaded metadata
struct GroupData {
    block_bitmap: Vec<u8>,
    inode_bitmap: Vec<u8>,
    inode_table: Vec<u8>,
}

/// An opened filesystem image with its metadata
pub struct Filesystem {
    device: Image,
    device_path: PathBuf,
    superblock: Superblock,
    block_size: u32,
    groups: Vec<GroupDescriptor>,
    loaded: RefCell<Vec<Option<GroupData>>>,
}

impl Filesystem {
    /// Open an image, read the superblock and the group descriptor table
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let device_path = path.as_ref().to_path_buf();
        let device = Image::open(&device_path)?;

        let sb_bytes = device
            .slice(SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE)
            .context("Image too small to contain a superblock")?;
        let superblock = Superblock::parse(sb_bytes)
            .with_context(|| format!("{} is not an ext3-family image", device_path.display()))?;
        let block_size = superblock.block_size();

        // The group descriptor table starts in the block right after the
        // superblock's block.
        let group_count = superblock.group_count() as usize;
        let table_offset = (superblock.first_data_block as u64 + 1) * block_size as u64;
        let table_bytes = device
            .slice(table_offset, group_count * GROUP_DESC_SIZE)
            .context("Group descriptor table extends past end of image")?;
        let groups = GroupDescriptor::parse_table(table_bytes, group_count)?;

        tracing::debug!(
            "Opened {}: {} blocks of {} bytes, {} groups, {} inodes",
            device_path.display(),
            superblock.blocks_count,
            block_size,
            group_count,
            superblock.inodes_count
        );

        Ok(Filesystem {
            device,
            device_path,
            superblock,
            block_size,
            groups,
            loaded: RefCell::new((0..group_count).map(|_| None).collect()),
        })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.superblock.blocks_count
    }

    pub fn inode_count(&self) -> u32 {
        self.superblock.inodes_count
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn group_descriptor(&self, group: usize) -> &GroupDescriptor {
        &self.groups[group]
    }

    /// Whether a pointer refers to a block inside the image
    pub fn valid_block_number(&self, block: u32) -> bool {
        block < self.superblock.blocks_count
    }

    /// Read one whole block as an owned buffer
    pub fn read_block(&self, block: u32) -> Result<Vec<u8>> {
        Ok(self.device.block(block, self.block_size)?.to_vec())
    }

    /// Read one whole block into a caller-supplied buffer
    pub fn read_block_into(&self, block: u32, buf: &mut [u8]) -> Result<()> {
        let data = self.device.block(block, self.block_size)?;
        buf[..self.block_size as usize].copy_from_slice(data);
        Ok(())
    }

    /// Group housing a block
    pub fn block_to_group(&self, block: u32) -> usize {
        ((block - self.superblock.first_data_block) / self.superblock.blocks_per_group) as usize
    }

    /// Group housing an inode
    pub fn inode_to_group(&self, inode: u32) -> usize {
        ((inode - 1) / self.superblock.inodes_per_group) as usize
    }

    /// Load a group's bitmaps and inode table; a no-op after the first call
    pub fn load_group(&self, group: usize) -> Result<()> {
        if group >= self.groups.len() {
            anyhow::bail!("Group {} out of range ({} groups)", group, self.groups.len());
        }
        if self.loaded.borrow()[group].is_some() {
            return Ok(());
        }

        let desc = &self.groups[group];
        let block_bitmap = self.read_block(desc.block_bitmap)?;
        let inode_bitmap = self.read_block(desc.inode_bitmap)?;
        let table_blocks = self.superblock.inode_table_blocks() as usize;
        let table_bytes = self
            .device
            .slice(
                desc.inode_table as u64 * self.block_size as u64,
                table_blocks * self.block_size as usize,
            )
            .with_context(|| format!("Inode table of group {} is truncated", group))?
            .to_vec();

        tracing::debug!("Loaded metadata of group {}", group);
        self.loaded.borrow_mut()[group] = Some(GroupData {
            block_bitmap,
            inode_bitmap,
            inode_table: table_bytes,
        });
        Ok(())
    }

    /// Fetch an inode by number (1-based), loading its group on demand
    pub fn inode(&self, id: u32) -> Result<Inode> {
        if id == 0 || id > self.superblock.inodes_count {
            anyhow::bail!("Inode {} out of range", id);
        }
        let group = self.inode_to_group(id);
        self.load_group(group)?;
        let loaded = self.loaded.borrow();
        let data = loaded[group].as_ref().unwrap();
        let record_size = self.superblock.inode_record_size() as usize;
        let index = ((id - 1) % self.superblock.inodes_per_group) as usize;
        Inode::parse(&data.inode_table[index * record_size..])
            .with_context(|| format!("Inode {} record is truncated", id))
    }

    /// Allocation state of an inode, from the group's inode bitmap
    pub fn is_allocated_inode(&self, id: u32) -> Result<bool> {
        if id == 0 || id > self.superblock.inodes_count {
            anyhow::bail!("Inode {} out of range", id);
        }
        let group = self.inode_to_group(id);
        self.load_group(group)?;
        let loaded = self.loaded.borrow();
        let data = loaded[group].as_ref().unwrap();
        let bit = (id - 1) % self.superblock.inodes_per_group;
        Ok(bitmap::test_bit(&data.inode_bitmap, bit))
    }

    /// Allocation state of a block, from the group's block bitmap
    pub fn is_allocated_block(&self, block: u32) -> Result<bool> {
        if block < self.superblock.first_data_block || !self.valid_block_number(block) {
            anyhow::bail!("Block {} out of range", block);
        }
        let group = self.block_to_group(block);
        self.load_group(group)?;
        let loaded = self.loaded.borrow();
        let data = loaded[group].as_ref().unwrap();
        let bit = (block - self.superblock.first_data_block)
            % self.superblock.blocks_per_group;
        Ok(bitmap::test_bit(&data.block_bitmap, bit))
    }

    /// The inode-table block and byte offset where an inode record lives
    pub fn inode_position(&self, id: u32) -> (u32, usize) {
        let record_size = self.superblock.inode_record_size();
        let per_block = self.block_size / record_size;
        let group = self.inode_to_group(id);
        let index = (id - 1) % self.superblock.inodes_per_group;
        let table_block = self.groups[group].inode_table + index / per_block;
        let offset = (index % per_block) as usize * record_size as usize;
        (table_block, offset)
    }

    /// Whether a block lies inside some group's inode table
    pub fn is_in_inode_table(&self, block: u32) -> bool {
        self.first_inode_of_table_block(block).is_some()
    }

    /// First inode number stored in an inode-table block, if it is one
    pub fn first_inode_of_table_block(&self, block: u32) -> Option<u32> {
        let table_blocks = self.superblock.inode_table_blocks();
        let record_size = self.superblock.inode_record_size();
        let per_block = self.block_size / record_size;
        for (g, desc) in self.groups.iter().enumerate() {
            if block >= desc.inode_table && block < desc.inode_table + table_blocks {
                let offset_blocks = block - desc.inode_table;
                return Some(
                    g as u32 * self.superblock.inodes_per_group + offset_blocks * per_block + 1,
                );
            }
        }
        None
    }

    /// Whether a block is a group bitmap or inode-table block
    pub fn is_group_metadata_block(&self, block: u32) -> bool {
        let table_blocks = self.superblock.inode_table_blocks();
        self.groups.iter().any(|desc| {
            block == desc.block_bitmap
                || block == desc.inode_bitmap
                || (block >= desc.inode_table && block < desc.inode_table + table_blocks)
        })
    }
}
