//! Device abstraction.
//!
//! A device turns `(offset, size)` requests into reads and writes against a
//! backing store. Three implementations ship with the crate: a plain file
//! device, a memory-mapped file device, and a pure in-memory device.
//! Applications can register additional factories under a name and select
//! them with the `custom_device` environment parameter.

mod disk;
mod mem;
mod mmap;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub use disk::DiskDevice;
pub use mem::InMemoryDevice;
pub use mmap::MmapDevice;

use crate::error::{Error, ErrorCode, Result};
use crate::types::{EnvFlags, EnvParams, Rid};

// ============================================================================
// Device Trait
// ============================================================================

/// Byte-addressable page-granular persistence.
///
/// All offsets are absolute byte positions in the backing store. Allocation
/// extends the store and returns the offset of the new space; freeing space
/// inside the store is the freelist's job, not the device's.
pub trait Device: std::fmt::Debug {
    /// Create a new backing store. Fails if the path exists and truncation
    /// is not possible, or with `WouldBlock` if another process holds the
    /// file lock.
    fn create(&mut self, path: &Path, flags: EnvFlags, mode: u32) -> Result<()>;

    /// Open an existing backing store. `FileNotFound` if it does not exist.
    fn open(&mut self, path: &Path, flags: EnvFlags) -> Result<()>;

    /// True while the device is usable.
    fn is_open(&self) -> bool;

    /// Release the backing store and the file lock.
    fn close(&mut self) -> Result<()>;

    /// Push buffered writes to stable storage.
    fn flush(&mut self) -> Result<()>;

    /// Resize the backing store.
    fn truncate(&mut self, new_size: u64) -> Result<()>;

    /// Current size of the backing store in bytes.
    fn file_size(&self) -> Result<u64>;

    /// Read `buf.len()` bytes at `offset`.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` at `offset`, extending the store if needed.
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Read one page. The default goes through [`Device::read`]; mapped
    /// devices serve it from the mapping instead.
    fn read_page(&mut self, address: Rid, pagesize: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; pagesize as usize];
        self.read(address, &mut buf)?;
        Ok(buf)
    }

    /// Write one page.
    fn write_page(&mut self, address: Rid, data: &[u8]) -> Result<()> {
        self.write(address, data)
    }

    /// Extend the store by `size` bytes and return the offset of the new
    /// space. Fails with `LimitsReached` when the OS refuses.
    fn alloc(&mut self, size: u64) -> Result<Rid>;

    /// Extend the store by one page and return its address.
    fn alloc_page(&mut self, pagesize: u32) -> Result<Rid> {
        self.alloc(pagesize as u64)
    }

    /// Configured page size.
    fn pagesize(&self) -> u32;

    /// Change the configured page size. Only valid before the first I/O.
    fn set_pagesize(&mut self, pagesize: u32);

    /// Flags the device was opened with.
    fn flags(&self) -> EnvFlags;

    /// Update the device flags.
    fn set_flags(&mut self, flags: EnvFlags);
}

// ============================================================================
// Factory Registry
// ============================================================================

/// Builds a device instance for an environment.
pub type DeviceFactory = Arc<dyn Fn(u32, EnvFlags) -> Box<dyn Device> + Send + Sync>;

struct DeviceRegistry {
    factories: HashMap<String, DeviceFactory>,
}

impl DeviceRegistry {
    fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }
}

lazy_static::lazy_static! {
    static ref DEVICE_REGISTRY: Mutex<DeviceRegistry> = Mutex::new(DeviceRegistry::new());
}

/// Register a device factory under a name.
pub fn device_register<S: Into<String>>(name: S, factory: DeviceFactory) {
    DEVICE_REGISTRY
        .lock()
        .unwrap()
        .factories
        .insert(name.into(), factory);
}

/// Remove a registered factory.
pub fn device_unregister(name: &str) {
    DEVICE_REGISTRY.lock().unwrap().factories.remove(name);
}

fn device_find(name: &str) -> Option<DeviceFactory> {
    DEVICE_REGISTRY.lock().unwrap().factories.get(name).cloned()
}

/// Build the device for an environment according to its parameters.
pub fn device_create(params: &EnvParams, flags: EnvFlags) -> Result<Box<dyn Device>> {
    if let Some(name) = &params.custom_device {
        let factory = device_find(name).ok_or_else(|| {
            Error::with_message(
                ErrorCode::InvalidParameter,
                format!("no device factory registered as '{}'", name),
            )
        })?;
        return Ok(factory(params.pagesize, flags));
    }

    if flags.contains(EnvFlags::IN_MEMORY) {
        return Ok(Box::new(InMemoryDevice::new(params.pagesize, flags)));
    }
    if flags.contains(EnvFlags::DISABLE_MMAP) || flags.contains(EnvFlags::READ_ONLY) {
        return Ok(Box::new(DiskDevice::new(params.pagesize, flags)));
    }
    Ok(Box::new(MmapDevice::new(params.pagesize, flags)))
}

// ============================================================================
// Tests
// ============================================================================
