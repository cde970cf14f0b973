// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Memory-mapped segment file operations using mmap-io.
//!
//! A segment file grows in whole blocks. The writer extends the file and
//! remaps; other mappings of the same file keep their old length until
//! they touch an offset past it, at which point they remap from disk.

use std::path::{Path, PathBuf};

use mmap_io::MemoryMappedFile;
use parking_lot::RwLock;
use tracing::trace;

use crate::{Result, error::QueueError};

/// Flushes are widened to whole pages.
const PAGE_SIZE: u64 = 4096;

fn mmap_error(e: impl std::fmt::Display) -> QueueError {
    QueueError::Mmap {
        message: e.to_string(),
    }
}

/// Shared read-write mapping of one segment file.
///
/// Every process that opens the file maps the same pages, so a word stored
/// by the writer is what readers in other processes load.
pub struct SegmentFile {
    /// Swapped for a longer mapping when the file grows.
    mmap: RwLock<MemoryMappedFile>,
    path: PathBuf,
}

impl SegmentFile {
    /// Create a zero-filled file of `size` bytes. Fails if the parent
    /// directory is missing.
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mmap = MemoryMappedFile::create_rw(&path, size).map_err(mmap_error)?;
        Ok(Self {
            mmap: RwLock::new(mmap),
            path,
        })
    }

    /// Map an existing file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mmap = MemoryMappedFile::open_rw(&path).map_err(mmap_error)?;
        Ok(Self {
            mmap: RwLock::new(mmap),
            path,
        })
    }

    #[inline]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.mmap
            .read()
            .update_region(offset, data)
            .map_err(mmap_error)
    }

    #[inline]
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.mmap.read().read_into(offset, buf).map_err(mmap_error)
    }

    #[inline]
    pub fn read_u32(&self, offset: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_at(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    #[inline]
    pub fn write_u32(&self, offset: u64, value: u32) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    #[inline]
    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_at(offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    #[inline]
    pub fn write_u64(&self, offset: u64, value: u64) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    /// Length of the current mapping.
    pub fn size(&self) -> u64 { self.mmap.read().len() }

    pub fn path(&self) -> &Path { &self.path }

    /// Map the file again if another mapping grew it. Returns the mapped
    /// length. Never shrinks the file.
    pub fn remap(&self) -> Result<u64> {
        let on_disk = std::fs::metadata(&self.path)?.len();
        let mut mmap = self.mmap.write();
        if on_disk > mmap.len() {
            let previous = mmap.len();
            *mmap = MemoryMappedFile::open_rw(&self.path).map_err(mmap_error)?;
            trace!(path = ?self.path, previous, size = mmap.len(), "Remapped grown segment file");
        }
        Ok(mmap.len())
    }

    /// Whether `[0, end)` is mapped, remapping first if the file on disk
    /// has grown past the current mapping.
    pub fn ensure_mapped(&self, end: u64) -> Result<bool> {
        if end <= self.size() {
            return Ok(true);
        }
        Ok(end <= self.remap()?)
    }

    /// Extend the file so that `[0, end)` is mapped. The new length is a
    /// multiple of `step`.
    pub fn grow(&self, end: u64, step: u64) -> Result<u64> {
        if self.ensure_mapped(end)? {
            return Ok(self.size());
        }
        let target = end.next_multiple_of(step.max(PAGE_SIZE));
        let mmap = self.mmap.write();
        if mmap.len() < target {
            mmap.resize(target).map_err(mmap_error)?;
            trace!(path = ?self.path, size = target, "Grew segment file");
        }
        Ok(mmap.len())
    }

    pub fn flush(&self) -> Result<()> { self.mmap.read().flush().map_err(mmap_error) }

    pub fn flush_range(&self, offset: u64, len: u64) -> Result<()> {
        let mmap = self.mmap.read();
        let start = offset - offset % PAGE_SIZE;
        let end = (offset + len).next_multiple_of(PAGE_SIZE).min(mmap.len());
        if end <= start {
            return Ok(());
        }
        mmap.flush_range(start, end - start).map_err(mmap_error)
    }
}
