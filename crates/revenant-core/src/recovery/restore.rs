//! File restorer
//!
//! Given a reconstructed path, finds the best surviving copy of the
//! target inode (the current table, or the newest journal snapshot with a
//! zero deletion time), walks its data blocks, and writes the contents
//! under the output root with the original permissions and timestamps.
//! Ancestor directories are restored on demand.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use filetime::FileTime;

use crate::fs::inode::{Inode, InodeKind};
use crate::metadata::Filesystem;
use crate::RecoveryError;
use crate::recovery::directory::Namespace;
use crate::recovery::files::FileIndex;
use crate::recovery::journal::JournalIndex;
use crate::walk::{collect_data_blocks, WalkOutcome};

/// Default output root directory
pub const DEFAULT_OUTPUT_ROOT: &str = "RESTORED_FILES";

/// Restorer configuration
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub output_root: PathBuf,
    /// Journal inode copies deleted before this time are considered too
    /// old to restore
    pub after: Option<u32>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        RestoreOptions {
            output_root: PathBuf::from(DEFAULT_OUTPUT_ROOT),
            after: None,
        }
    }
}

/// Per-path outcome, for summary counting
#[derive(Debug, Clone)]
pub enum RestoreStatus {
    Restored,
    /// Nothing was written; the reason was also logged
    Skipped(RecoveryError),
}

enum Undeleted {
    Current(Inode),
    Journal(Inode, u32),
    TooOld(u32),
    None,
}

/// Writes recovered files under the output root
pub struct Restorer<'a> {
    fs: &'a Filesystem,
    journal: &'a JournalIndex,
    namespace: &'a Namespace,
    file_index: &'a FileIndex,
    options: RestoreOptions,
}

impl<'a> Restorer<'a> {
    pub fn new(
        fs: &'a Filesystem,
        journal: &'a JournalIndex,
        namespace: &'a Namespace,
        file_index: &'a FileIndex,
        options: RestoreOptions,
    ) -> Self {
        Restorer {
            fs,
            journal,
            namespace,
            file_index,
            options,
        }
    }

    /// Restore one root-relative path, creating ancestors as needed
    pub fn restore(&self, path: &str) -> Result<RestoreStatus> {
        if path.is_empty() || path.starts_with('/') {
            anyhow::bail!("Restore paths are root-relative, got '{}'", path);
        }

        let inode_id = match self.file_index.path_to_inode.get(path) {
            Some(&inode) => inode,
            None => match self.namespace.directories.get(path) {
                Some(directory) => directory.inode,
                None => {
                    tracing::warn!("Cannot find an inode number for \"{}\"", path);
                    return Ok(RestoreStatus::Skipped(RecoveryError::UnknownPath));
                }
            },
        };

        // Make sure the parent chain exists in the output tree.
        if let Some(slash) = path.rfind('/') {
            let parent = &path[..slash];
            let parent_out = self.options.output_root.join(parent);
            match std::fs::symlink_metadata(&parent_out) {
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    self.restore(parent)?;
                }
                Err(err) => {
                    tracing::warn!("lstat {}: {}", parent_out.display(), err);
                    return Ok(RestoreStatus::Skipped(RecoveryError::from(err)));
                }
                Ok(meta) if !meta.is_dir() => {
                    anyhow::bail!(
                        "Cannot recover {}: {} exists but is not a directory",
                        path,
                        parent_out.display()
                    );
                }
                Ok(_) => {}
            }
        } else {
            std::fs::create_dir_all(&self.options.output_root).with_context(|| {
                format!(
                    "Cannot create output root {}",
                    self.options.output_root.display()
                )
            })?;
        }

        let out_path = self.options.output_root.join(path);
        let current = self.fs.inode(inode_id)?;

        if current.is_directory() {
            return self.restore_directory(path, &out_path, &current);
        }

        match self.undeleted_inode(inode_id)? {
            Undeleted::Current(inode) | Undeleted::Journal(inode, _) => {
                debug_assert_eq!(inode.dtime, 0);
                self.restore_contents(path, &out_path, &inode)
            }
            Undeleted::TooOld(dtime) => {
                tracing::warn!(
                    "Not undeleting \"{}\": it was deleted before the configured floor \
                     (dtime {})",
                    path,
                    dtime
                );
                Ok(RestoreStatus::Skipped(RecoveryError::TooOld { dtime }))
            }
            Undeleted::None => {
                tracing::warn!("Cannot find an undeleted inode for \"{}\"", path);
                Ok(RestoreStatus::Skipped(RecoveryError::NoUndeletedInode))
            }
        }
    }

    /// The current inode if it is not deleted, otherwise the newest
    /// journal copy with a zero deletion time
    fn undeleted_inode(&self, inode_id: u32) -> Result<Undeleted> {
        let current = self.fs.inode(inode_id)?;
        if current.dtime == 0 {
            return Ok(Undeleted::Current(current));
        }
        for (sequence, snapshot) in self.journal.inode_snapshots(self.fs, inode_id)? {
            if snapshot.dtime == 0 {
                return Ok(Undeleted::Journal(snapshot, sequence));
            }
            if let Some(after) = self.options.after {
                if snapshot.dtime < after {
                    return Ok(Undeleted::TooOld(snapshot.dtime));
                }
            }
        }
        Ok(Undeleted::None)
    }

    fn restore_directory(
        &self,
        path: &str,
        out_path: &std::path::Path,
        inode: &Inode,
    ) -> Result<RestoreStatus> {
        match std::fs::create_dir(out_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Could not create directory {}", out_path.display()));
            }
        }
        self.apply_mode(out_path, inode);
        self.apply_times(out_path, inode, false);
        tracing::debug!("Restored directory {}", path);
        Ok(RestoreStatus::Restored)
    }

    fn restore_contents(
        &self,
        path: &str,
        out_path: &std::path::Path,
        inode: &Inode,
    ) -> Result<RestoreStatus> {
        match inode.kind() {
            InodeKind::Regular => self.restore_regular(path, out_path, inode),
            InodeKind::Symlink => self.restore_symlink(path, out_path, inode),
            kind => {
                tracing::warn!("Not recovering \"{}\", which is a {}", path, kind);
                Ok(RestoreStatus::Skipped(RecoveryError::UnsupportedInode {
                    kind,
                }))
            }
        }
    }

    fn restore_regular(
        &self,
        path: &str,
        out_path: &std::path::Path,
        inode: &Inode,
    ) -> Result<RestoreStatus> {
        tracing::info!("Restoring {}", path);
        let (blocks, outcome) = collect_data_blocks(self.fs, inode)?;
        let mut out = File::create(out_path)
            .with_context(|| format!("Failed to open {}", out_path.display()))?;
        let block_size = self.fs.block_size() as u64;
        let mut remaining = inode.size as u64;
        for block in blocks {
            if remaining == 0 {
                break;
            }
            let data = self.fs.read_block(block)?;
            let len = remaining.min(block_size) as usize;
            out.write_all(&data[..len])?;
            remaining -= len as u64;
        }
        out.flush()?;
        drop(out);
        if outcome == WalkOutcome::Corrupted {
            tracing::warn!(
                "Failed to fully restore {}: encountered a reused or corrupted indirect block; \
                 keeping the partial file",
                path
            );
        }
        self.apply_mode(out_path, inode);
        self.apply_times(out_path, inode, false);
        Ok(RestoreStatus::Restored)
    }

    fn restore_symlink(
        &self,
        path: &str,
        out_path: &std::path::Path,
        inode: &Inode,
    ) -> Result<RestoreStatus> {
        let target = self.symlink_target(inode)?;
        if target.is_empty() {
            tracing::warn!("Failed to recover {}: symlink has zero length", path);
            return Ok(RestoreStatus::Skipped(RecoveryError::Format(format!(
                "symlink {} has a zero-length target",
                path
            ))));
        }
        #[cfg(unix)]
        {
            if let Err(err) = std::os::unix::fs::symlink(&target, out_path) {
                tracing::warn!("symlink {}: {}", out_path.display(), err);
                return Ok(RestoreStatus::Skipped(RecoveryError::from(err)));
            }
            self.apply_times(out_path, inode, true);
            tracing::info!("Restored symlink {} -> {}", path, target);
            Ok(RestoreStatus::Restored)
        }
        #[cfg(not(unix))]
        {
            tracing::warn!("Skipping symlink {} -> {}: not supported here", path, target);
            Ok(RestoreStatus::Skipped(RecoveryError::UnsupportedInode {
                kind: InodeKind::Symlink,
            }))
        }
    }

    /// Decode a symlink target: inline in the pointer array when the block
    /// count is zero, otherwise a NUL-terminated string in the first block
    fn symlink_target(&self, inode: &Inode) -> Result<String> {
        let bytes = if inode.blocks == 0 {
            if inode.size == 0 {
                return Ok(String::new());
            }
            let raw = inode.block_array_bytes();
            let limit = (inode.size as usize).min(raw.len());
            let end = raw[..limit]
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(limit);
            raw[..end].to_vec()
        } else {
            if inode.block[0] == 0 {
                return Ok(String::new());
            }
            let data = self.fs.read_block(inode.block[0])?;
            let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
            data[..end].to_vec()
        };
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn apply_mode(&self, out_path: &std::path::Path, inode: &Inode) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(inode.permissions());
            if let Err(err) = std::fs::set_permissions(out_path, perms) {
                tracing::warn!("Failed to set mode on {}: {}", out_path.display(), err);
            }
        }
        #[cfg(not(unix))]
        let _ = (out_path, inode);
    }

    /// Access time from atime, modification time from ctime: the change
    /// time is the closest surviving record of when the file last changed
    fn apply_times(&self, out_path: &std::path::Path, inode: &Inode, symlink: bool) {
        let atime = FileTime::from_unix_time(inode.atime as i64, 0);
        let mtime = FileTime::from_unix_time(inode.ctime as i64, 0);
        let result = if symlink {
            filetime::set_symlink_file_times(out_path, atime, mtime)
        } else {
            filetime::set_file_times(out_path, atime, mtime)
        };
        if let Err(err) = result {
            tracing::warn!(
                "Failed to set access and modification time on {}: {}",
                out_path.display(),
                err
            );
        }
    }
}
