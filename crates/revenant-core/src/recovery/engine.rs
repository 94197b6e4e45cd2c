//! Engine context
//!
//! Packages the opened filesystem, the journal index, and the pipeline's
//! intermediate results into one explicit context passed through the
//! stages, with cache-aware accessors that compute each stage at most
//! once per run.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metadata::Filesystem;
use crate::recovery::cache;
use crate::recovery::directory::Namespace;
use crate::recovery::files::{self, FileIndex};
use crate::recovery::journal::JournalIndex;
use crate::recovery::restore::{RestoreOptions, RestoreStatus, Restorer};
use crate::recovery::stage1::{self, StageOneResult};
use crate::recovery::stage2::{
    namespace_from_records, PathOracle, ResolveOptions, ResolveOutput, Resolver,
    RESOLVE_MAX_DEPTH,
};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Legal-but-unlikely filenames the user declared acceptable
    pub accepted_filenames: BTreeSet<String>,
    /// Floor for deletion times; older journal copies are "too old"
    pub after: Option<u32>,
    pub output_root: PathBuf,
    pub max_depth: usize,
    /// Read and write the stage caches
    pub use_caches: bool,
    /// Directory holding the stage caches
    pub cache_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            accepted_filenames: BTreeSet::new(),
            after: None,
            output_root: PathBuf::from(crate::recovery::restore::DEFAULT_OUTPUT_ROOT),
            max_depth: RESOLVE_MAX_DEPTH,
            use_caches: true,
            cache_dir: PathBuf::from("."),
        }
    }
}

/// Serializable scan summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub device: String,
    pub scanned_at: DateTime<Utc>,
    pub block_size: u32,
    pub block_count: u32,
    pub inode_count: u32,
    pub group_count: usize,
    pub journal_descriptors: usize,
    pub journal_min_sequence: u32,
    pub journal_max_sequence: u32,
    pub journal_wrapped_sequence: Option<u32>,
    pub proposed_inodes: usize,
    pub ambiguous_inodes: usize,
    pub extended_blocks: usize,
    pub directories: usize,
    pub files: usize,
}

/// The recovery engine: one image, one journal, one pipeline run
pub struct RecoveryEngine {
    fs: Filesystem,
    journal: JournalIndex,
    config: EngineConfig,
    oracle: Option<Box<dyn PathOracle>>,
    stage1: Option<StageOneResult>,
    resolved: Option<ResolveOutput>,
    file_index: Option<FileIndex>,
}

impl RecoveryEngine {
    /// Open an image and index its journal
    pub fn open(image: impl AsRef<std::path::Path>, config: EngineConfig) -> Result<Self> {
        let fs = Filesystem::open(image)?;
        let journal = JournalIndex::build(&fs)?;
        Ok(RecoveryEngine {
            fs,
            journal,
            config,
            oracle: None,
            stage1: None,
            resolved: None,
            file_index: None,
        })
    }

    /// Install the optional path oracle used for tie-breaking
    pub fn with_oracle(mut self, oracle: Box<dyn PathOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn fs(&self) -> &Filesystem {
        &self.fs
    }

    pub fn journal(&self) -> &JournalIndex {
        &self.journal
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stage 1 result, loaded from cache or computed by a full scan
    pub fn stage1(&mut self) -> Result<&StageOneResult> {
        if self.stage1.is_none() {
            let cache_path = cache::stage1_path(&self.config.cache_dir, self.fs.device_path());
            let result = if self.config.use_caches && cache_path.exists() {
                tracing::info!("Loading {}", cache_path.display());
                cache::read_stage1(&cache_path, self.fs.inode_count())
                    .with_context(|| format!("Corrupt cache {}; delete it to re-scan", cache_path.display()))?
            } else {
                let result = stage1::scan(&self.fs, &self.config.accepted_filenames)?;
                if self.config.use_caches {
                    tracing::info!(
                        "Writing stage 1 results to {}; delete that file to re-scan",
                        cache_path.display()
                    );
                    cache::write_stage1(&cache_path, self.fs.device_path(), &result)?;
                }
                result
            };
            self.stage1 = Some(result);
        }
        Ok(self.stage1.as_ref().unwrap())
    }

    /// Stage 2 result: the resolved namespace
    pub fn resolve(&mut self) -> Result<&ResolveOutput> {
        if self.resolved.is_none() {
            let cache_path = cache::stage2_path(&self.config.cache_dir, self.fs.device_path());
            let output = if self.config.use_caches && cache_path.exists() {
                tracing::info!("Loading {}", cache_path.display());
                let records = cache::read_stage2(&cache_path).with_context(|| {
                    format!("Corrupt cache {}; delete it to re-resolve", cache_path.display())
                })?;
                namespace_from_records(&self.fs, &self.config.accepted_filenames, &records)?
            } else {
                self.stage1()?;
                let stage1 = self.stage1.take().unwrap();
                let options = ResolveOptions {
                    max_depth: self.config.max_depth,
                    after: self.config.after,
                };
                let resolver = Resolver::new(
                    &self.fs,
                    &self.journal,
                    &self.config.accepted_filenames,
                    self.oracle.as_deref(),
                    options,
                    stage1.clone(),
                );
                self.stage1 = Some(stage1);
                let output = resolver.run()?;
                if self.config.use_caches {
                    tracing::info!(
                        "Writing stage 2 results to {}; delete that file to re-resolve",
                        cache_path.display()
                    );
                    cache::write_stage2(&cache_path, self.fs.device_path(), &output.namespace)?;
                }
                output
            };
            self.resolved = Some(output);
        }
        Ok(self.resolved.as_ref().unwrap())
    }

    pub fn namespace(&mut self) -> Result<&Namespace> {
        Ok(&self.resolve()?.namespace)
    }

    /// The path-to-inode file index
    pub fn file_index(&mut self) -> Result<&FileIndex> {
        if self.file_index.is_none() {
            self.resolve()?;
            let namespace = &self.resolved.as_ref().unwrap().namespace;
            let index = files::build(&self.journal, namespace)?;
            self.file_index = Some(index);
        }
        Ok(self.file_index.as_ref().unwrap())
    }

    /// Sorted union of all recovered directory and file paths
    pub fn dump_names(&mut self) -> Result<Vec<String>> {
        self.file_index()?;
        let namespace = &self.resolved.as_ref().unwrap().namespace;
        let index = self.file_index.as_ref().unwrap();
        let mut paths: Vec<String> = namespace
            .directories
            .keys()
            .filter(|path| !path.is_empty())
            .cloned()
            .chain(index.path_to_inode.keys().cloned())
            .collect();
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    fn restorer(&self) -> Restorer<'_> {
        Restorer::new(
            &self.fs,
            &self.journal,
            &self.resolved.as_ref().unwrap().namespace,
            self.file_index.as_ref().unwrap(),
            RestoreOptions {
                output_root: self.config.output_root.clone(),
                after: self.config.after,
            },
        )
    }

    /// Restore a single path
    pub fn restore(&mut self, path: &str) -> Result<RestoreStatus> {
        self.file_index()?;
        self.restorer().restore(path)
    }

    /// Restore everything that was recovered; returns (restored, skipped)
    pub fn restore_all(&mut self) -> Result<(usize, usize)> {
        let paths = self.dump_names()?;
        let restorer = self.restorer();
        let mut restored = 0;
        let mut skipped = 0;
        for path in &paths {
            match restorer.restore(path)? {
                RestoreStatus::Restored => restored += 1,
                RestoreStatus::Skipped(reason) => {
                    skipped += 1;
                    tracing::debug!("Skipped {}: {}", path, reason);
                }
            }
        }
        tracing::info!("Restored {} paths, skipped {}", restored, skipped);
        Ok((restored, skipped))
    }

    /// Inodes reachable through more than one recovered path
    pub fn hardlinks(&mut self) -> Result<Vec<(u32, Vec<String>)>> {
        let index = self.file_index()?;
        Ok(files::hardlink_groups(index))
    }

    /// Summary of the whole run, fit for serialization
    pub fn report(&mut self) -> Result<ScanReport> {
        self.stage1()?;
        self.file_index()?;
        let stage1 = self.stage1.as_ref().unwrap();
        let namespace = &self.resolved.as_ref().unwrap().namespace;
        let index = self.file_index.as_ref().unwrap();
        Ok(ScanReport {
            device: self.fs.device_path().display().to_string(),
            scanned_at: Utc::now(),
            block_size: self.fs.block_size(),
            block_count: self.fs.block_count(),
            inode_count: self.fs.inode_count(),
            group_count: self.fs.group_count(),
            journal_descriptors: self.journal.descriptor_count(),
            journal_min_sequence: self.journal.min_sequence(),
            journal_max_sequence: self.journal.max_sequence(),
            journal_wrapped_sequence: self.journal.wrapped_sequence(),
            proposed_inodes: stage1.proposed_inodes(),
            ambiguous_inodes: stage1.ambiguous_inodes(),
            extended_blocks: stage1.extended_blocks.len(),
            directories: namespace.directories.len(),
            files: index.path_to_inode.len(),
        })
    }
}
