//! Page filters.
//!
//! A filter transforms page images on their way to and from the device
//! (compression, encryption). Filters form a chain applied in registration
//! order on write and in reverse on read; the environment header page and
//! the log files are never filtered. Filters must be installed at
//! environment create/open time, before any page I/O.

use std::path::Path;

use crate::device::Device;
use crate::error::Result;
use crate::types::{EnvFlags, Rid};

/// One page transformation.
pub trait PageFilter: std::fmt::Debug {
    /// Transform a page image in place before it reaches the device.
    fn before_write(&self, address: Rid, page: &mut [u8]) -> Result<()>;

    /// Undo the transformation after a page was read.
    fn after_read(&self, address: Rid, page: &mut [u8]) -> Result<()>;
}

/// An ordered chain of page filters.
#[derive(Default, Debug)]
pub struct FilterChain {
    filters: Vec<Box<dyn PageFilter>>,
}

impl FilterChain {
    /// Empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter to the chain.
    pub fn push(&mut self, filter: Box<dyn PageFilter>) {
        self.filters.push(filter);
    }

    /// True when no filters are installed.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    fn apply_write(&self, address: Rid, page: &mut [u8]) -> Result<()> {
        for filter in &self.filters {
            filter.before_write(address, page)?;
        }
        Ok(())
    }

    fn apply_read(&self, address: Rid, page: &mut [u8]) -> Result<()> {
        for filter in self.filters.iter().rev() {
            filter.after_read(address, page)?;
        }
        Ok(())
    }
}

/// Device wrapper running every page through the filter chain. The header
/// page at address 0 passes through untouched so the file stays
/// recognizable.
#[derive(Debug)]
pub struct FilteredDevice {
    inner: Box<dyn Device>,
    chain: FilterChain,
}

impl FilteredDevice {
    /// Wrap a device with a filter chain.
    pub fn new(inner: Box<dyn Device>, chain: FilterChain) -> Self {
        Self { inner, chain }
    }
}

impl Device for FilteredDevice {
    fn create(&mut self, path: &Path, flags: EnvFlags, mode: u32) -> Result<()> {
        self.inner.create(path, flags, mode)
    }

    fn open(&mut self, path: &Path, flags: EnvFlags) -> Result<()> {
        self.inner.open(path, flags)
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    fn truncate(&mut self, new_size: u64) -> Result<()> {
        self.inner.truncate(new_size)
    }

    fn file_size(&self) -> Result<u64> {
        self.inner.file_size()
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read(offset, buf)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.inner.write(offset, buf)
    }

    fn read_page(&mut self, address: Rid, pagesize: u32) -> Result<Vec<u8>> {
        let mut page = self.inner.read_page(address, pagesize)?;
        if address != 0 {
            self.chain.apply_read(address, &mut page)?;
        }
        Ok(page)
    }

    fn write_page(&mut self, address: Rid, data: &[u8]) -> Result<()> {
        if address == 0 || self.chain.is_empty() {
            return self.inner.write_page(address, data);
        }
        let mut copy = data.to_vec();
        self.chain.apply_write(address, &mut copy)?;
        self.inner.write_page(address, &copy)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::InMemoryDevice;
    use std::path::PathBuf;

    /// Filter XORing every byte; its own inverse.
    #[derive(Debug)]
    struct XorFilter(u8);

    impl PageFilter for XorFilter {
        fn before_write(&self, _address: Rid, page: &mut [u8]) -> Result<()> {
            page.iter_mut().for_each(|b| *b ^= self.0);
            Ok(())
        }

        fn after_read(&self, _address: Rid, page: &mut [u8]) -> Result<()> {
            page.iter_mut().for_each(|b| *b ^= self.0);
            Ok(())
        }
    }

    fn filtered_mem() -> FilteredDevice {
        let mut inner = InMemoryDevice::new(512, EnvFlags::IN_MEMORY);
        inner
            .create(&PathBuf::from(":memory:"), EnvFlags::IN_MEMORY, 0)
            .unwrap();
        let mut chain = FilterChain::new();
        chain.push(Box::new(XorFilter(0x5A)));
        FilteredDevice::new(Box::new(inner), chain)
    }

    #[test]
    fn test_pages_transform_roundtrip() {
        let mut dev = filtered_mem();
        dev.alloc(1024).unwrap();

        let page = vec![0x11u8; 512];
        dev.write_page(512, &page).unwrap();

        // The stored bytes differ, the read-back bytes match.
        let mut raw = vec![0u8; 512];
        dev.read(512, &mut raw).unwrap();
        assert!(raw.iter().all(|&b| b == 0x11 ^ 0x5A));
        assert_eq!(dev.read_page(512, 512).unwrap(), page);
    }

    #[test]
    fn test_header_page_is_exempt() {
        let mut dev = filtered_mem();
        dev.alloc(1024).unwrap();

        let header = vec![0x22u8; 512];
        dev.write_page(0, &header).unwrap();
        let mut raw = vec![0u8; 512];
        dev.read(0, &mut raw).unwrap();
        assert_eq!(raw, header);
    }
}
