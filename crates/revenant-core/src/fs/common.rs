//! Raw image access
//!
//! The image is mapped read-only once and addressed by absolute byte
//! range. A range falling outside the mapping means the image is
//! truncated relative to what its metadata claims, which the error
//! message spells out.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use memmap2::Mmap;

/// A read-only mapping of a filesystem image
pub struct Image {
    map: Mmap,
}

impl Image {
    /// Map an image file read-only
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
        // The engine never writes to the image, and a run assumes nobody
        // else modifies it either.
        let map = unsafe { Mmap::map(&file) }
            .with_context(|| format!("Cannot map {}", path.display()))?;
        Ok(Image { map })
    }

    /// Image length in bytes
    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// A byte range of the image, or an error naming the truncation
    pub fn slice(&self, offset: u64, length: usize) -> Result<&[u8]> {
        usize::try_from(offset)
            .ok()
            .and_then(|start| start.checked_add(length).map(|end| start..end))
            .and_then(|range| self.map.get(range))
            .with_context(|| {
                format!(
                    "Image ends at byte {}; wanted {} bytes at offset {} (truncated image?)",
                    self.map.len(),
                    length,
                    offset
                )
            })
    }

    /// One whole block
    pub fn block(&self, number: u32, block_size: u32) -> Result<&[u8]> {
        self.slice(number as u64 * block_size as u64, block_size as usize)
    }
}
