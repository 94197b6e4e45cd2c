//! revenant-core: offline forensic recovery for journaled ext3-family
//! filesystem images
//!
//! The engine reads a raw block-device image, replays the journal into an
//! index of historical block snapshots, reconstructs the directory tree
//! (including directories whose entries or inodes were deleted), and
//! restores file contents, directories, and symlinks with their original
//! permissions and timestamps.
//!
//! The image is never written to; positioned whole-block reads are the
//! only device operation.

pub mod classify;
pub mod fs;
pub mod metadata;
pub mod recovery;
pub mod walk;

pub use classify::{ClassifyOptions, DirBlockKind};
pub use fs::{Inode, InodeKind, Superblock};
pub use metadata::Filesystem;
pub use recovery::{
    EngineConfig, FileIndex, JournalIndex, Namespace, PathOracle, RecoveryEngine, RestoreStatus,
    ScanReport, StageOneResult,
};
pub use walk::{WalkOutcome, MASK_DIRECT, MASK_POINTERS};

/// Recovery error kinds.
///
/// Only I/O and format failures on the superblock or journal superblock
/// are fatal; every other kind is logged and the pipeline continues so
/// that as many files as possible come back in a single run.
#[derive(Debug, Clone)]
pub enum RecoveryError {
    /// The image cannot be read or appears truncated
    Io(String),
    /// Magic numbers, record chains, or counts fail basic sanity
    Format(String),
    /// Stage 2 could not collapse an inode's candidate set
    AmbiguousInode { inode: u32, kept: u32 },
    /// An indirect pointer block no longer classifies as one
    CorruptedIndirectChain { inode: u32 },
    /// An extended directory block has no identifiable parent
    MissingCollaborator { block: u32 },
    /// Asked to restore a device, FIFO, or socket
    UnsupportedInode { kind: InodeKind },
    /// No journal snapshot with a zero deletion time is newer than the
    /// configured floor
    TooOld { dtime: u32 },
    /// No undeleted copy of the inode survives anywhere
    NoUndeletedInode,
    /// The path is not present in the reconstructed namespace
    UnknownPath,
}

impl std::fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryError::Io(msg) => write!(f, "I/O error: {}", msg),
            RecoveryError::Format(msg) => write!(f, "format error: {}", msg),
            RecoveryError::AmbiguousInode { inode, kept } => {
                write!(f, "inode {} has ambiguous candidates; kept block {}", inode, kept)
            }
            RecoveryError::CorruptedIndirectChain { inode } => {
                write!(f, "inode {} has a reused or corrupted indirect block", inode)
            }
            RecoveryError::MissingCollaborator { block } => {
                write!(f, "extended directory block {} has no identifiable parent", block)
            }
            RecoveryError::UnsupportedInode { kind } => {
                write!(f, "unsupported inode type: {}", kind)
            }
            RecoveryError::TooOld { dtime } => {
                write!(f, "deleted before the configured floor (dtime {})", dtime)
            }
            RecoveryError::NoUndeletedInode => write!(f, "no undeleted inode copy survives"),
            RecoveryError::UnknownPath => write!(f, "path not found in the recovered namespace"),
        }
    }
}

impl std::error::Error for RecoveryError {}

impl From<std::io::Error> for RecoveryError {
    fn from(err: std::io::Error) -> Self {
        RecoveryError::Io(err.to_string())
    }
}
