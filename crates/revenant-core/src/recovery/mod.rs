//! The multi-stage recovery pipeline
//!
//! Stage order: journal indexing, candidate proposal (stage 1),
//! disambiguation and namespace assembly (stage 2), file indexing, and
//! restoration. The two resolver stages persist text caches so repeated
//! runs against the same image skip the full-device scans.

pub mod blockvec;
pub mod cache;
pub mod directory;
pub mod engine;
pub mod files;
pub mod journal;
pub mod restore;
pub mod stage1;
pub mod stage2;

pub use blockvec::BlockList;
pub use directory::{DirEntry, Directory, DirectoryBlock, Namespace};
pub use engine::{EngineConfig, RecoveryEngine, ScanReport};
pub use files::{hardlink_groups, FileIndex};
pub use journal::{Descriptor, DescriptorKind, JournalIndex, Transaction};
pub use restore::{RestoreOptions, RestoreStatus, Restorer};
pub use stage1::StageOneResult;
pub use stage2::{PathOracle, ResolveOptions, ResolveOutput, Resolver};
