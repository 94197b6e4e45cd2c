//! Synthetic image fixtures
//!
//! Builds a minimal but internally consistent ext3-family image: 1 KiB
//! blocks, one block group, 32 inodes, and a 12-block journal. Tests
//! hand-assemble directory blocks, inode records, and journal records on
//! top of this skeleton.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

pub const BLOCK_SIZE: usize = 1024;
pub const TOTAL_BLOCKS: u32 = 1024;
pub const INODE_COUNT: u32 = 32;
pub const INODES_PER_GROUP: u32 = 32;
pub const INODE_SIZE: usize = 128;

/// Block layout of the fixture
pub const BLOCK_BITMAP_BLOCK: u32 = 3;
pub const INODE_BITMAP_BLOCK: u32 = 4;
pub const INODE_TABLE_BLOCK: u32 = 5;
pub const INODE_TABLE_BLOCKS: u32 = 4;

/// The journal inode and its 12 direct blocks
pub const JOURNAL_INODE: u32 = 8;
pub const JOURNAL_FIRST_BLOCK: u32 = 160;
pub const JOURNAL_BLOCKS: u32 = 12;

pub const ROOT_INODE: u32 = 2;

/// Journal record constants, big-endian on disk
pub const JOURNAL_MAGIC: u32 = 0xC03B_3998;
pub const FLAG_SAME_UUID: u32 = 2;
pub const FLAG_LAST_TAG: u32 = 8;

/// File type hints
pub const FT_REG: u8 = 1;
pub const FT_DIR: u8 = 2;
pub const FT_FIFO: u8 = 5;
pub const FT_SYMLINK: u8 = 7;

/// A whole-image builder
pub struct ImageBuilder {
    blocks: Vec<Vec<u8>>,
}

/// Inode field bundle; unset pointers stay zero
#[derive(Default, Clone)]
pub struct InodeSpec {
    pub mode: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub links: u16,
    /// Block count in 512-byte units
    pub blocks512: u32,
    pub block: [u32; 15],
}

impl InodeSpec {
    pub fn directory(first_block: u32) -> Self {
        InodeSpec {
            mode: 0o040755,
            size: BLOCK_SIZE as u32,
            atime: 1_200_000_000,
            ctime: 1_200_000_000,
            mtime: 1_200_000_000,
            links: 2,
            blocks512: 2,
            block: {
                let mut b = [0u32; 15];
                b[0] = first_block;
                b
            },
            ..Default::default()
        }
    }

    pub fn regular(size: u32, data_blocks: &[u32]) -> Self {
        let mut block = [0u32; 15];
        for (i, &b) in data_blocks.iter().enumerate() {
            assert!(i < 12, "use explicit pointers for indirect layouts");
            block[i] = b;
        }
        InodeSpec {
            mode: 0o100644,
            size,
            atime: 1_200_000_000,
            ctime: 1_200_000_000,
            mtime: 1_200_000_000,
            links: 1,
            blocks512: (data_blocks.len() * 2) as u32,
            block,
            ..Default::default()
        }
    }

    pub fn encode(&self) -> [u8; INODE_SIZE] {
        let mut out = [0u8; INODE_SIZE];
        out[0..2].copy_from_slice(&self.mode.to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..12].copy_from_slice(&self.atime.to_le_bytes());
        out[12..16].copy_from_slice(&self.ctime.to_le_bytes());
        out[16..20].copy_from_slice(&self.mtime.to_le_bytes());
        out[20..24].copy_from_slice(&self.dtime.to_le_bytes());
        out[26..28].copy_from_slice(&self.links.to_le_bytes());
        out[28..32].copy_from_slice(&self.blocks512.to_le_bytes());
        for (i, ptr) in self.block.iter().enumerate() {
            let off = 40 + i * 4;
            out[off..off + 4].copy_from_slice(&ptr.to_le_bytes());
        }
        out
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        let mut builder = ImageBuilder {
            blocks: vec![vec![0u8; BLOCK_SIZE]; TOTAL_BLOCKS as usize],
        };
        builder.write_superblock();
        builder.write_group_descriptor();
        for block in 0..INODE_TABLE_BLOCK + INODE_TABLE_BLOCKS {
            builder.mark_block_allocated(block);
        }
        builder.install_journal();
        builder
    }

    fn write_superblock(&mut self) {
        let sb = &mut self.blocks[1];
        put32(sb, 0x00, INODE_COUNT);
        put32(sb, 0x04, TOTAL_BLOCKS);
        put32(sb, 0x14, 1); // first_data_block
        put32(sb, 0x18, 0); // log_block_size -> 1024
        put32(sb, 0x20, 8192); // blocks_per_group
        put32(sb, 0x28, INODES_PER_GROUP);
        put16(sb, 0x38, 0xEF53);
        put32(sb, 0x48, 0); // creator OS: Linux
        put32(sb, 0x4C, 1); // rev_level
        put16(sb, 0x58, INODE_SIZE as u16);
        put16(sb, 0x5A, 0); // block_group_nr
        put32(sb, 0x5C, 0x4); // feature_compat: has journal
        put32(sb, 0xE0, JOURNAL_INODE);
    }

    fn write_group_descriptor(&mut self) {
        let gd = &mut self.blocks[2];
        gd[0..4].copy_from_slice(&BLOCK_BITMAP_BLOCK.to_le_bytes());
        gd[4..8].copy_from_slice(&INODE_BITMAP_BLOCK.to_le_bytes());
        gd[8..12].copy_from_slice(&INODE_TABLE_BLOCK.to_le_bytes());
    }

    fn install_journal(&mut self) {
        let mut spec = InodeSpec::regular(JOURNAL_BLOCKS * BLOCK_SIZE as u32, &[]);
        for i in 0..JOURNAL_BLOCKS {
            spec.block[i as usize] = JOURNAL_FIRST_BLOCK + i;
            self.mark_block_allocated(JOURNAL_FIRST_BLOCK + i);
        }
        spec.blocks512 = JOURNAL_BLOCKS * 2;
        self.set_inode(JOURNAL_INODE, &spec);
        self.mark_inode_allocated(JOURNAL_INODE);
        self.set_block(JOURNAL_FIRST_BLOCK, &encode_journal_superblock(JOURNAL_BLOCKS, 1, 1));
    }

    pub fn set_block(&mut self, nr: u32, data: &[u8]) {
        assert!(data.len() <= BLOCK_SIZE);
        let block = &mut self.blocks[nr as usize];
        block.fill(0);
        block[..data.len()].copy_from_slice(data);
    }

    pub fn fill_block(&mut self, nr: u32, byte: u8) {
        self.blocks[nr as usize].fill(byte);
    }

    pub fn set_inode(&mut self, id: u32, spec: &InodeSpec) {
        assert!(id >= 1 && id <= INODE_COUNT);
        let index = (id - 1) as usize;
        let block = INODE_TABLE_BLOCK as usize + index / (BLOCK_SIZE / INODE_SIZE);
        let offset = (index % (BLOCK_SIZE / INODE_SIZE)) * INODE_SIZE;
        self.blocks[block][offset..offset + INODE_SIZE].copy_from_slice(&spec.encode());
    }

    pub fn mark_inode_allocated(&mut self, id: u32) {
        let bit = id - 1;
        self.blocks[INODE_BITMAP_BLOCK as usize][(bit / 8) as usize] |= 1 << (bit % 8);
    }

    pub fn mark_block_allocated(&mut self, nr: u32) {
        // Bit 0 of the block bitmap is first_data_block (block 1).
        if nr == 0 {
            return;
        }
        let bit = nr - 1;
        self.blocks[BLOCK_BITMAP_BLOCK as usize][(bit / 8) as usize] |= 1 << (bit % 8);
    }

    /// The raw bytes of one inode-table block, for journal snapshots
    pub fn inode_table_block_bytes(&self, table_block: u32) -> Vec<u8> {
        self.blocks[table_block as usize].clone()
    }

    pub fn write_to(&self, path: &Path) {
        let mut image = Vec::with_capacity(TOTAL_BLOCKS as usize * BLOCK_SIZE);
        for block in &self.blocks {
            image.extend_from_slice(block);
        }
        std::fs::write(path, image).unwrap();
    }

    /// Write the image into a temp dir and return (dir guard, image path)
    pub fn build(self) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.img");
        self.write_to(&path);
        (dir, path)
    }
}

fn put32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

/// Encode one directory entry record
pub fn encode_dir_entry(inode: u32, rec_len: u16, file_type: u8, name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(rec_len as usize);
    out.extend_from_slice(&inode.to_le_bytes());
    out.extend_from_slice(&rec_len.to_le_bytes());
    out.push(name.len() as u8);
    out.push(file_type);
    out.extend_from_slice(name.as_bytes());
    out.resize(rec_len as usize, 0);
    out
}

fn padded_rec_len(name: &str) -> u16 {
    ((8 + name.len() + 3) & !3) as u16
}

/// A directory start block: `.` and `..`, then the given entries, with the
/// final record length running to the block end
pub fn dir_start_block(self_inode: u32, parent_inode: u32, entries: &[(u32, u8, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&encode_dir_entry(self_inode, 12, FT_DIR, "."));
    out.extend_from_slice(&encode_dir_entry(parent_inode, 12, FT_DIR, ".."));
    append_entries(&mut out, entries);
    out
}

/// An extended directory block: entries only, no `.`/`..` prologue
pub fn dir_extended_block(entries: &[(u32, u8, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    append_entries(&mut out, entries);
    out
}

fn append_entries(out: &mut Vec<u8>, entries: &[(u32, u8, &str)]) {
    assert!(!entries.is_empty(), "a directory block needs at least one entry");
    for (i, &(inode, file_type, name)) in entries.iter().enumerate() {
        let rec_len = if i + 1 == entries.len() {
            (BLOCK_SIZE - out.len()) as u16
        } else {
            padded_rec_len(name)
        };
        out.extend_from_slice(&encode_dir_entry(inode, rec_len, file_type, name));
    }
    assert_eq!(out.len(), BLOCK_SIZE);
}

/// Unlink one entry from an encoded directory block by extending the
/// previous entry's record length over it, the way the filesystem does
pub fn unlink_entry(block: &mut [u8], prev_offset: usize, victim_offset: usize) {
    let prev_rec = u16::from_le_bytes([block[prev_offset + 4], block[prev_offset + 5]]) as usize;
    assert_eq!(prev_offset + prev_rec, victim_offset, "entries must be adjacent");
    let victim_rec = u16::from_le_bytes([block[victim_offset + 4], block[victim_offset + 5]]) as usize;
    let merged = (prev_rec + victim_rec) as u16;
    block[prev_offset + 4..prev_offset + 6].copy_from_slice(&merged.to_le_bytes());
}

fn journal_header(blocktype: u32, sequence: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&JOURNAL_MAGIC.to_be_bytes());
    out.extend_from_slice(&blocktype.to_be_bytes());
    out.extend_from_slice(&sequence.to_be_bytes());
    out
}

pub fn encode_journal_superblock(maxlen: u32, first: u32, sequence: u32) -> Vec<u8> {
    let mut out = journal_header(4, 0);
    out.extend_from_slice(&(BLOCK_SIZE as u32).to_be_bytes());
    out.extend_from_slice(&maxlen.to_be_bytes());
    out.extend_from_slice(&first.to_be_bytes());
    out.extend_from_slice(&sequence.to_be_bytes());
    out.extend_from_slice(&first.to_be_bytes()); // start
    out
}

/// A descriptor block; every tag carries SAME_UUID, the last LAST_TAG too
pub fn encode_descriptor_block(sequence: u32, fs_blocks: &[u32]) -> Vec<u8> {
    let mut out = journal_header(1, sequence);
    for (i, &fs_block) in fs_blocks.iter().enumerate() {
        let mut flags = FLAG_SAME_UUID;
        if i + 1 == fs_blocks.len() {
            flags |= FLAG_LAST_TAG;
        }
        out.extend_from_slice(&fs_block.to_be_bytes());
        out.extend_from_slice(&flags.to_be_bytes());
    }
    out
}

pub fn encode_commit_block(sequence: u32) -> Vec<u8> {
    journal_header(2, sequence)
}
