//! File-backed device.
//!
//! Raw `pread`/`pwrite` against a file descriptor, with an exclusive
//! advisory lock taken at create/open time. A second opener receives
//! `WouldBlock` instead of waiting.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::error::{Error, ErrorCode, Result};
use crate::types::{EnvFlags, Rid};

use super::Device;

/// Get errno in a cross-platform way (Linux vs macOS/BSD).
#[cfg(target_os = "linux")]
fn get_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[cfg(not(target_os = "linux"))]
fn get_errno() -> i32 {
    unsafe { *libc::__error() }
}

/// fdatasync - use fsync on platforms without fdatasync (macOS).
#[cfg(target_os = "linux")]
unsafe fn platform_fdatasync(fd: i32) -> i32 {
    libc::fdatasync(fd)
}

#[cfg(not(target_os = "linux"))]
unsafe fn platform_fdatasync(fd: i32) -> i32 {
    libc::fsync(fd)
}

/// Map the current errno onto an error code.
fn error_from_errno() -> Error {
    let errno = get_errno();
    let msg = std::io::Error::from_raw_os_error(errno).to_string();

    let code = match errno {
        libc::ENOENT => ErrorCode::FileNotFound,
        libc::EACCES | libc::EPERM => ErrorCode::AccessDenied,
        libc::ENOSPC | libc::EDQUOT => ErrorCode::LimitsReached,
        libc::EBUSY | libc::EAGAIN | libc::EWOULDBLOCK => ErrorCode::WouldBlock,
        libc::ENOMEM => ErrorCode::LimitsReached,
        libc::EROFS => ErrorCode::ReadOnly,
        _ => ErrorCode::IoError,
    };

    Error::with_message(code, msg)
}

/// Plain file device.
#[derive(Debug)]
pub struct DiskDevice {
    file: Option<File>,
    pagesize: u32,
    flags: EnvFlags,
    size: u64,
}

impl DiskDevice {
    /// Create an unopened device.
    pub fn new(pagesize: u32, flags: EnvFlags) -> Self {
        Self {
            file: None,
            pagesize,
            flags,
            size: 0,
        }
    }

    /// Borrow the underlying file. Only valid while open.
    pub(super) fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or_else(|| Error::new(ErrorCode::NotReady))
    }

    fn fd(&self) -> Result<i32> {
        Ok(self.file()?.as_raw_fd())
    }

    fn lock_exclusive(file: &File) -> Result<()> {
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(error_from_errno());
        }
        Ok(())
    }

    fn attach(&mut self, file: File) -> Result<()> {
        Self::lock_exclusive(&file)?;
        self.size = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }
}

impl Device for DiskDevice {
    fn create(&mut self, path: &Path, flags: EnvFlags, mode: u32) -> Result<()> {
        if self.file.is_some() {
            return Err(Error::new(ErrorCode::AlreadyInitialized));
        }
        self.flags = flags;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(path)?;
        self.attach(file)
    }

    fn open(&mut self, path: &Path, flags: EnvFlags) -> Result<()> {
        if self.file.is_some() {
            return Err(Error::new(ErrorCode::AlreadyInitialized));
        }
        self.flags = flags;
        let read_only = flags.contains(EnvFlags::READ_ONLY);
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        self.attach(file)
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let fd = self.fd()?;
        if unsafe { platform_fdatasync(fd) } != 0 {
            return Err(error_from_errno());
        }
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> Result<()> {
        let fd = self.fd()?;
        if unsafe { libc::ftruncate(fd, new_size as libc::off_t) } != 0 {
            return Err(error_from_errno());
        }
        self.size = new_size;
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        self.file()?;
        Ok(self.size)
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let fd = self.fd()?;
        let mut done = 0usize;
        while done < buf.len() {
            let rc = unsafe {
                libc::pread(
                    fd,
                    buf[done..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - done,
                    (offset + done as u64) as libc::off_t,
                )
            };
            if rc < 0 {
                return Err(error_from_errno());
            }
            if rc == 0 {
                // Short file: the tail reads as zeroes.
                buf[done..].fill(0);
                return Ok(());
            }
            done += rc as usize;
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.flags.contains(EnvFlags::READ_ONLY) {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        let fd = self.fd()?;
        let mut done = 0usize;
        while done < buf.len() {
            let rc = unsafe {
                libc::pwrite(
                    fd,
                    buf[done..].as_ptr() as *const libc::c_void,
                    buf.len() - done,
                    (offset + done as u64) as libc::off_t,
                )
            };
            if rc < 0 {
                return Err(error_from_errno());
            }
            done += rc as usize;
        }
        self.size = self.size.max(offset + buf.len() as u64);
        Ok(())
    }

    fn alloc(&mut self, size: u64) -> Result<Rid> {
        let address = self.file_size()?;
        self.truncate(address + size)?;
        Ok(address)
    }

    fn pagesize(&self) -> u32 {
        self.pagesize
    }

    fn set_pagesize(&mut self, pagesize: u32) {
        self.pagesize = pagesize;
    }

    fn flags(&self) -> EnvFlags {
        self.flags
    }

    fn set_flags(&mut self, flags: EnvFlags) {
        self.flags = flags;
    }
}

impl Drop for DiskDevice {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// ============================================================================
// Tests
// ============================================================================
