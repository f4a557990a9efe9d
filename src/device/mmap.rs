//! Memory-mapped file device.
//!
//! Layers a shared writable mapping over the plain file device. Page reads
//! inside the mapped range are served straight from the mapping; everything
//! else falls back to `pread`/`pwrite`, which stays coherent with a
//! `MAP_SHARED` mapping of the same file. The mapping is rebuilt lazily
//! after the file grows.

use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{Error, ErrorCode, Result};
use crate::types::{EnvFlags, Rid};

use super::disk::DiskDevice;
use super::Device;

/// Memory-mapped file device.
#[derive(Debug)]
pub struct MmapDevice {
    inner: DiskDevice,
    map: Option<MmapMut>,
    mapped_len: u64,
}

impl MmapDevice {
    /// Create an unopened device.
    pub fn new(pagesize: u32, flags: EnvFlags) -> Self {
        Self {
            inner: DiskDevice::new(pagesize, flags),
            map: None,
            mapped_len: 0,
        }
    }

    fn remap(&mut self) -> Result<()> {
        self.map = None;
        self.mapped_len = 0;

        let len = self.inner.file_size()?;
        if len == 0 {
            return Ok(());
        }
        let file = self.inner.file()?;
        match unsafe { MmapOptions::new().len(len as usize).map_mut(file) } {
            Ok(map) => {
                self.map = Some(map);
                self.mapped_len = len;
                Ok(())
            }
            // The OS refusing a mapping is not fatal; reads fall back to
            // pread until memory pressure eases.
            Err(e) => {
                tracing::debug!(len, error = %e, "mmap failed, falling back to pread");
                Ok(())
            }
        }
    }

    fn ensure_mapped(&mut self, end: u64) -> Result<bool> {
        if self.mapped_len >= end {
            return Ok(true);
        }
        if self.inner.file_size()? >= end {
            self.remap()?;
        }
        Ok(self.mapped_len >= end)
    }
}

impl Device for MmapDevice {
    fn create(&mut self, path: &Path, flags: EnvFlags, mode: u32) -> Result<()> {
        self.inner.create(path, flags, mode)?;
        self.remap()
    }

    fn open(&mut self, path: &Path, flags: EnvFlags) -> Result<()> {
        self.inner.open(path, flags)?;
        self.remap()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn close(&mut self) -> Result<()> {
        if let Some(map) = self.map.take() {
            map.flush().map_err(Error::from)?;
        }
        self.mapped_len = 0;
        self.inner.close()
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(map) = &self.map {
            map.flush().map_err(Error::from)?;
        }
        self.inner.flush()
    }

    fn truncate(&mut self, new_size: u64) -> Result<()> {
        // Drop the mapping before shrinking the file under it.
        if new_size < self.mapped_len {
            self.map = None;
            self.mapped_len = 0;
        }
        self.inner.truncate(new_size)
    }

    fn file_size(&self) -> Result<u64> {
        self.inner.file_size()
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset + buf.len() as u64;
        if self.ensure_mapped(end)? {
            let map = self.map.as_ref().ok_or_else(|| Error::new(ErrorCode::InternalError))?;
            buf.copy_from_slice(&map[offset as usize..end as usize]);
            return Ok(());
        }
        self.inner.read(offset, buf)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let end = offset + buf.len() as u64;
        if self.mapped_len >= end {
            let map = self.map.as_mut().ok_or_else(|| Error::new(ErrorCode::InternalError))?;
            map[offset as usize..end as usize].copy_from_slice(buf);
            return Ok(());
        }
        self.inner.write(offset, buf)
    }

    fn alloc(&mut self, size: u64) -> Result<Rid> {
        self.inner.alloc(size)
    }

    fn pagesize(&self) -> u32 {
        self.inner.pagesize()
    }

    fn set_pagesize(&mut self, pagesize: u32) {
        self.inner.set_pagesize(pagesize);
    }

    fn flags(&self) -> EnvFlags {
        self.inner.flags()
    }

    fn set_flags(&mut self, flags: EnvFlags) {
        self.inner.set_flags(flags);
    }
}

// ============================================================================
// Tests
// ============================================================================
