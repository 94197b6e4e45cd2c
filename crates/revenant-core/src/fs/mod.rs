//! On-disk structures of the ext3 filesystem family
//!
//! Everything here is byte-layout parsing; the recovery logic that
//! interprets these records lives in the crate root modules.

pub mod bitmap;
pub mod common;
pub mod dirent;
pub mod group;
pub mod inode;
pub mod journal;
pub mod superblock;

pub use common::Image;
pub use group::GroupDescriptor;
pub use inode::{Inode, InodeKind};
pub use superblock::Superblock;
