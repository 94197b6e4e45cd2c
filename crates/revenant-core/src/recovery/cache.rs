//! Persistent caches of the two resolver stages
//!
//! Both caches are plain text keyed by the device basename and live in the
//! working directory (or a configured cache directory). Comment lines
//! beginning with `#` are tolerated anywhere. Deleting a cache file makes
//! the engine recompute that stage on the next run.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::recovery::blockvec::BlockList;
use crate::recovery::directory::Namespace;
use crate::recovery::stage1::StageOneResult;

/// Suffix of the stage 1 cache file
pub const STAGE1_SUFFIX: &str = ".ext3grep.stage1";
/// Suffix of the stage 2 cache file
pub const STAGE2_SUFFIX: &str = ".ext3grep.stage2";

fn device_basename(device: &Path) -> String {
    device
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string())
}

pub fn stage1_path(cache_dir: &Path, device: &Path) -> PathBuf {
    cache_dir.join(format!("{}{}", device_basename(device), STAGE1_SUFFIX))
}

pub fn stage2_path(cache_dir: &Path, device: &Path) -> PathBuf {
    cache_dir.join(format!("{}{}", device_basename(device), STAGE2_SUFFIX))
}

/// Write the stage 1 cache:
/// `<inode> : <block> [<block> ...]` records, then a comment, then one
/// extended block per line
pub fn write_stage1(path: &Path, device: &Path, result: &StageOneResult) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Cannot create cache {}", path.display()))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "# Stage 1 data for {}.", device.display())?;
    writeln!(out, "# Inodes and directory start blocks that use it for dir entry '.'.")?;
    writeln!(out, "# INODE : BLOCK [BLOCK ...]")?;
    for (inode, list) in result.dir_inode_to_block.iter().enumerate() {
        if list.is_empty() {
            continue;
        }
        write!(out, "{} :", inode)?;
        for block in list.iter() {
            write!(out, " {}", block)?;
        }
        writeln!(out)?;
    }
    writeln!(out, "# Extended directory blocks.")?;
    for block in &result.extended_blocks {
        writeln!(out, "{}", block)?;
    }
    out.flush()?;
    Ok(())
}

/// Read a stage 1 cache written by `write_stage1`
pub fn read_stage1(path: &Path, inode_count: u32) -> Result<StageOneResult> {
    let file = File::open(path)
        .with_context(|| format!("Cannot open cache {}", path.display()))?;
    let mut result = StageOneResult::empty(inode_count);
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((inode_part, blocks_part)) = line.split_once(':') {
            let inode: u32 = inode_part
                .trim()
                .parse()
                .with_context(|| format!("Bad inode number in cache: '{}'", line))?;
            if inode == 0 || inode > inode_count {
                anyhow::bail!("Inode {} in cache out of range", inode);
            }
            for word in blocks_part.split_whitespace() {
                let block: u32 = word
                    .parse()
                    .with_context(|| format!("Bad block number in cache: '{}'", line))?;
                result.dir_inode_to_block[inode as usize].push(block);
            }
        } else {
            let block: u32 = line
                .parse()
                .with_context(|| format!("Bad extended block in cache: '{}'", line))?;
            result.extended_blocks.push(block);
        }
    }
    Ok(result)
}

/// One line of the stage 2 cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage2Record {
    pub inode: u32,
    /// Root-relative path; empty for the root directory
    pub path: String,
    pub blocks: Vec<u32>,
}

/// Write the stage 2 cache: `<inode> '<path>' <block> [<block> ...]`
pub fn write_stage2(path: &Path, device: &Path, namespace: &Namespace) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Cannot create cache {}", path.display()))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "# Stage 2 data for {}.", device.display())?;
    writeln!(out, "# Inodes path and directory blocks.")?;
    writeln!(out, "# INODE PATH BLOCK [BLOCK ...]")?;
    for (dir_path, directory) in &namespace.directories {
        write!(out, "{} '{}'", directory.inode, dir_path)?;
        for block in &directory.blocks {
            write!(out, " {}", block.block)?;
        }
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

/// Read a stage 2 cache written by `write_stage2`
pub fn read_stage2(path: &Path) -> Result<Vec<Stage2Record>> {
    let file = File::open(path)
        .with_context(|| format!("Cannot open cache {}", path.display()))?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        let open_quote = line
            .find('\'')
            .with_context(|| format!("Missing path quote in cache line '{}'", line))?;
        let close_quote = line[open_quote + 1..]
            .find('\'')
            .map(|i| i + open_quote + 1)
            .with_context(|| format!("Unterminated path in cache line '{}'", line))?;
        let inode: u32 = line[..open_quote]
            .trim()
            .parse()
            .with_context(|| format!("Bad inode number in cache line '{}'", line))?;
        let dir_path = line[open_quote + 1..close_quote].to_string();
        let blocks = line[close_quote + 1..]
            .split_whitespace()
            .map(|word| {
                word.parse::<u32>()
                    .with_context(|| format!("Bad block number in cache line '{}'", line))
            })
            .collect::<Result<Vec<u32>>>()?;
        records.push(Stage2Record {
            inode,
            path: dir_path,
            blocks,
        });
    }
    Ok(records)
}

/// Load the accepted-filename whitelist file, one name per line
pub fn read_accept_list(path: &Path) -> Result<BTreeSet<String>> {
    let file = File::open(path)
        .with_context(|| format!("Cannot open accept list {}", path.display()))?;
    let mut names = BTreeSet::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.trim().is_empty() && !line.starts_with('#') {
            names.insert(line);
        }
    }
    Ok(names)
}

/// Replay the per-inode block lists recorded in a stage 2 cache
pub fn block_lists_from_records(records: &[Stage2Record], inode_count: u32) -> Vec<BlockList> {
    let mut lists = vec![BlockList::default(); inode_count as usize + 1];
    for record in records {
        if record.inode == 0 || record.inode > inode_count {
            continue;
        }
        lists[record.inode as usize] = BlockList::from(record.blocks.clone());
    }
    lists
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::directory::{Directory, DirectoryBlock};

    #[test]
    fn test_stage1_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("image.ext3grep.stage1");

        let mut original = StageOneResult::empty(64);
        original.dir_inode_to_block[2].push(30);
        original.dir_inode_to_block[12].push(100);
        original.dir_inode_to_block[12].push(500);
        original.extended_blocks.push(800);
        original.extended_blocks.push(801);

        write_stage1(&cache, Path::new("/dev/sda1"), &original).unwrap();
        let restored = read_stage1(&cache, 64).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn test_stage1_tolerates_interleaved_comments() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("image.ext3grep.stage1");
        std::fs::write(
            &cache,
            "# header\n2 : 30\n# interleaved comment\n12 : 100 500\n# extended\n800\n# tail\n801\n",
        )
        .unwrap();
        let restored = read_stage1(&cache, 64).unwrap();
        assert_eq!(restored.dir_inode_to_block[12].len(), 2);
        assert_eq!(restored.extended_blocks, vec![800, 801]);
    }

    #[test]
    fn test_stage2_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("image.ext3grep.stage2");

        let mut namespace = Namespace::default();
        namespace.directories.insert(
            String::new(),
            Directory {
                inode: 2,
                blocks: vec![DirectoryBlock {
                    block: 30,
                    entries: Vec::new(),
                }],
            },
        );
        namespace.directories.insert(
            "lost+found".to_string(),
            Directory {
                inode: 11,
                blocks: vec![
                    DirectoryBlock {
                        block: 40,
                        entries: Vec::new(),
                    },
                    DirectoryBlock {
                        block: 41,
                        entries: Vec::new(),
                    },
                ],
            },
        );
        namespace.inode_paths.insert(2, String::new());
        namespace.inode_paths.insert(11, "lost+found".to_string());

        write_stage2(&cache, Path::new("/dev/sda1"), &namespace).unwrap();
        let records = read_stage2(&cache).unwrap();
        assert_eq!(records.len(), 2);
        // The root is the empty path.
        let root = records.iter().find(|r| r.inode == 2).unwrap();
        assert_eq!(root.path, "");
        assert_eq!(root.blocks, vec![30]);
        let lost = records.iter().find(|r| r.inode == 11).unwrap();
        assert_eq!(lost.path, "lost+found");
        assert_eq!(lost.blocks, vec![40, 41]);
    }

    #[test]
    fn test_stage2_path_with_spaces() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("image.ext3grep.stage2");
        std::fs::write(&cache, "20 'My Documents/old files' 700 701\n").unwrap();
        let records = read_stage2(&cache).unwrap();
        assert_eq!(records[0].path, "My Documents/old files");
        assert_eq!(records[0].blocks, vec![700, 701]);
    }
}
