//! Write-ahead log.
//!
//! Two append-only files, `<name>.log0` and `<name>.log1`, alternate:
//! appends go to the active file, and a checkpoint — after flushing every
//! dirty page — switches to the other file and truncates it for reuse.
//! Entries carry monotonically increasing LSNs; page before-images enable
//! undo of uncommitted transactions during recovery.
//!
//! A cleanly closed environment leaves both files empty, so any content
//! found at open time means the previous run ended uncleanly.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use crate::device::Device;
use crate::error::{Error, ErrorCode, Result};
use crate::types::{Lsn, Rid, TxnId, LOG_MAGIC};

// ============================================================================
// Constants
// ============================================================================

/// Log file header: magic(8) + version(4) + reserved(4).
pub const LOG_FILE_HEADER_SIZE: u64 = 16;

/// Entry header: lsn(8) + txn_id(8) + flags(4) + data_size(4).
pub const LOG_ENTRY_HEADER_SIZE: usize = 24;

/// Log file format version.
pub const LOG_VERSION: u32 = 1;

/// Entry types, stored in the entry flags word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LogEntryType {
    /// A transaction started.
    TxnBegin = 1,
    /// A transaction committed.
    TxnCommit = 2,
    /// A transaction aborted.
    TxnAbort = 3,
    /// Page image taken before a transaction's first modification.
    PageBeforeImg = 4,
    /// All dirty pages were flushed up to this LSN.
    Checkpoint = 5,
}

impl LogEntryType {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(LogEntryType::TxnBegin),
            2 => Some(LogEntryType::TxnCommit),
            3 => Some(LogEntryType::TxnAbort),
            4 => Some(LogEntryType::PageBeforeImg),
            5 => Some(LogEntryType::Checkpoint),
            _ => None,
        }
    }
}

/// One parsed log entry.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Sequence number.
    pub lsn: Lsn,
    /// Owning transaction, 0 for checkpoints.
    pub txn_id: TxnId,
    /// Entry type.
    pub entry_type: LogEntryType,
    /// Raw payload (page address + image for before-images).
    pub payload: Vec<u8>,
}

// ============================================================================
// Log
// ============================================================================

/// The environment's write-ahead log.
pub struct Log {
    files: [File; 2],
    paths: [PathBuf; 2],
    /// File receiving appends.
    current: usize,
    next_lsn: Lsn,
    checkpoint_lsn: Lsn,
}

fn log_paths(db_path: &Path) -> [PathBuf; 2] {
    let base = db_path.to_string_lossy();
    [
        PathBuf::from(format!("{}.log0", base)),
        PathBuf::from(format!("{}.log1", base)),
    ]
}

fn write_file_header(file: &mut File) -> Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    let mut header = [0u8; LOG_FILE_HEADER_SIZE as usize];
    header[..8].copy_from_slice(&LOG_MAGIC);
    LittleEndian::write_u32(&mut header[8..12], LOG_VERSION);
    file.write_all(&header)?;
    file.flush()?;
    Ok(())
}

fn validate_file_header(file: &mut File) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    let mut header = [0u8; LOG_FILE_HEADER_SIZE as usize];
    match file.read_exact(&mut header) {
        Ok(()) => {}
        // A zero-length file is a fresh log, not corruption.
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    if header[..8] != LOG_MAGIC {
        return Err(Error::new(ErrorCode::InvalidFileHeader));
    }
    if LittleEndian::read_u32(&header[8..12]) != LOG_VERSION {
        return Err(Error::new(ErrorCode::InvalidFileVersion));
    }
    Ok(())
}

/// Parse every complete entry of one file. A torn entry at the tail ends
/// the scan; that is the crash point, not an error.
fn scan_file(file: &mut File) -> Result<Vec<LogEntry>> {
    let len = file.metadata()?.len();
    if len <= LOG_FILE_HEADER_SIZE {
        return Ok(Vec::new());
    }
    let mut buf = vec![0u8; (len - LOG_FILE_HEADER_SIZE) as usize];
    file.seek(SeekFrom::Start(LOG_FILE_HEADER_SIZE))?;
    file.read_exact(&mut buf)?;

    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos + LOG_ENTRY_HEADER_SIZE <= buf.len() {
        let lsn = LittleEndian::read_u64(&buf[pos..]);
        let txn_id = LittleEndian::read_u64(&buf[pos + 8..]);
        let flags = LittleEndian::read_u32(&buf[pos + 16..]);
        let data_size = LittleEndian::read_u32(&buf[pos + 20..]) as usize;

        let Some(entry_type) = LogEntryType::from_u32(flags) else {
            break;
        };
        if lsn == 0 {
            break;
        }
        let padded = data_size.div_ceil(8) * 8;
        if pos + LOG_ENTRY_HEADER_SIZE + padded > buf.len() {
            break;
        }
        let payload =
            buf[pos + LOG_ENTRY_HEADER_SIZE..pos + LOG_ENTRY_HEADER_SIZE + data_size].to_vec();
        entries.push(LogEntry {
            lsn,
            txn_id,
            entry_type,
            payload,
        });
        pos += LOG_ENTRY_HEADER_SIZE + padded;
    }
    Ok(entries)
}

impl Log {
    /// Create fresh, empty log files.
    pub fn create(db_path: &Path, file_mode: u32) -> Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;
        let paths = log_paths(db_path);
        let open = |path: &Path| -> Result<File> {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .mode(file_mode)
                .open(path)?;
            write_file_header(&mut file)?;
            Ok(file)
        };
        let f0 = open(&paths[0])?;
        let f1 = open(&paths[1])?;
        Ok(Self {
            files: [f0, f1],
            paths,
            current: 0,
            next_lsn: 1,
            checkpoint_lsn: 0,
        })
    }

    /// Open existing log files, creating them when missing. Returns the
    /// log and whether it holds entries from an unclean shutdown.
    pub fn open(db_path: &Path, file_mode: u32) -> Result<(Self, bool)> {
        use std::os::unix::fs::OpenOptionsExt;
        let paths = log_paths(db_path);
        let open = |path: &Path| -> Result<File> {
            let exists = path.exists();
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .mode(file_mode)
                .open(path)?;
            if exists {
                validate_file_header(&mut file)?;
            } else {
                write_file_header(&mut file)?;
            }
            Ok(file)
        };
        let mut f0 = open(&paths[0])?;
        let mut f1 = open(&paths[1])?;

        let e0 = scan_file(&mut f0)?;
        let e1 = scan_file(&mut f1)?;
        let dirty = !e0.is_empty() || !e1.is_empty();

        let max_lsn = e0
            .iter()
            .chain(e1.iter())
            .map(|e| e.lsn)
            .max()
            .unwrap_or(0);
        // The file whose newest entry is younger receives further appends.
        let newest0 = e0.last().map(|e| e.lsn).unwrap_or(0);
        let newest1 = e1.last().map(|e| e.lsn).unwrap_or(0);
        let current = if newest1 > newest0 { 1 } else { 0 };

        Ok((
            Self {
                files: [f0, f1],
                paths,
                current,
                next_lsn: max_lsn + 1,
                checkpoint_lsn: 0,
            },
            dirty,
        ))
    }

    /// LSN of the most recent checkpoint.
    pub fn checkpoint_lsn(&self) -> Lsn {
        self.checkpoint_lsn
    }

    /// LSN the next entry will get.
    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn
    }

    fn append_entry(
        &mut self,
        entry_type: LogEntryType,
        txn_id: TxnId,
        payload: &[u8],
    ) -> Result<Lsn> {
        let lsn = self.next_lsn;
        self.next_lsn += 1;

        let padded = payload.len().div_ceil(8) * 8;
        let mut buf = vec![0u8; LOG_ENTRY_HEADER_SIZE + padded];
        LittleEndian::write_u64(&mut buf[0..8], lsn);
        LittleEndian::write_u64(&mut buf[8..16], txn_id);
        LittleEndian::write_u32(&mut buf[16..20], entry_type as u32);
        LittleEndian::write_u32(&mut buf[20..24], payload.len() as u32);
        buf[LOG_ENTRY_HEADER_SIZE..LOG_ENTRY_HEADER_SIZE + payload.len()]
            .copy_from_slice(payload);

        let file = &mut self.files[self.current];
        file.seek(SeekFrom::End(0))?;
        file.write_all(&buf)?;
        Ok(lsn)
    }

    /// Append a transaction-begin marker.
    pub fn append_txn_begin(&mut self, txn_id: TxnId) -> Result<Lsn> {
        self.append_entry(LogEntryType::TxnBegin, txn_id, &[])
    }

    /// Append a commit marker. The caller must already have made the
    /// transaction's page writes durable.
    pub fn append_txn_commit(&mut self, txn_id: TxnId) -> Result<Lsn> {
        self.append_entry(LogEntryType::TxnCommit, txn_id, &[])
    }

    /// Append an abort marker.
    pub fn append_txn_abort(&mut self, txn_id: TxnId) -> Result<Lsn> {
        self.append_entry(LogEntryType::TxnAbort, txn_id, &[])
    }

    /// Append a page before-image: the page address followed by the full
    /// page bytes as they were before the transaction's first touch.
    pub fn append_before_image(
        &mut self,
        txn_id: TxnId,
        page_address: Rid,
        image: &[u8],
    ) -> Result<Lsn> {
        let mut payload = Vec::with_capacity(8 + image.len());
        payload.extend_from_slice(&page_address.to_le_bytes());
        payload.extend_from_slice(image);
        self.append_entry(LogEntryType::PageBeforeImg, txn_id, &payload)
    }

    /// Record a checkpoint: every dirty page up to this point is on disk.
    /// Rotates to the other file and truncates it for recycling.
    pub fn checkpoint(&mut self) -> Result<Lsn> {
        let lsn = self.append_entry(LogEntryType::Checkpoint, 0, &[])?;
        self.flush()?;
        self.checkpoint_lsn = lsn;

        self.current ^= 1;
        write_file_header(&mut self.files[self.current])?;
        tracing::debug!(lsn, file = self.current, "log checkpoint, rotated");
        Ok(lsn)
    }

    /// Force the active file to stable storage.
    pub fn flush(&mut self) -> Result<()> {
        self.files[self.current].flush()?;
        self.files[self.current].sync_data()?;
        Ok(())
    }

    /// Empty both files; called on clean close.
    pub fn clear(&mut self) -> Result<()> {
        write_file_header(&mut self.files[0])?;
        write_file_header(&mut self.files[1])?;
        self.checkpoint_lsn = 0;
        Ok(())
    }

    /// All entries of both files, ordered by LSN.
    pub fn all_entries(&mut self) -> Result<Vec<LogEntry>> {
        let mut entries = scan_file(&mut self.files[0])?;
        entries.extend(scan_file(&mut self.files[1])?);
        entries.sort_by_key(|e| e.lsn);
        Ok(entries)
    }

    /// Undo every uncommitted transaction by writing its page
    /// before-images back, oldest first, then reset the log.
    pub fn recover(&mut self, device: &mut dyn Device, pagesize: u32) -> Result<()> {
        let entries = self.all_entries()?;

        let horizon = entries
            .iter()
            .filter(|e| e.entry_type == LogEntryType::Checkpoint)
            .map(|e| e.lsn)
            .max()
            .unwrap_or(0);

        let committed: HashSet<TxnId> = entries
            .iter()
            .filter(|e| e.entry_type == LogEntryType::TxnCommit)
            .map(|e| e.txn_id)
            .collect();

        // Before-images of one page may stack up across transactions;
        // applying them newest-to-oldest leaves the oldest (pre-first-txn)
        // image in place.
        let mut undone = 0usize;
        for entry in entries.iter().rev() {
            if entry.lsn <= horizon {
                break;
            }
            if entry.entry_type != LogEntryType::PageBeforeImg {
                continue;
            }
            if committed.contains(&entry.txn_id) {
                continue;
            }
            if entry.payload.len() < 8 + pagesize as usize {
                tracing::warn!(lsn = entry.lsn, "truncated before-image skipped");
                continue;
            }
            let address = LittleEndian::read_u64(&entry.payload[0..8]);
            // Through write_page so a filter chain re-applies on the way
            // back to disk.
            device.write_page(address, &entry.payload[8..8 + pagesize as usize])?;
            undone += 1;
        }
        device.flush()?;
        self.clear()?;
        tracing::debug!(undone, horizon, "recovery finished");
        Ok(())
    }

    /// Paths of the two log files.
    pub fn paths(&self) -> &[PathBuf; 2] {
        &self.paths
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::InMemoryDevice;
    use crate::types::EnvFlags;

    fn temp_base() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.db");
        (dir, path)
    }

    #[test]
    fn test_append_and_scan_roundtrip() {
        let (_dir, base) = temp_base();
        let mut log = Log::create(&base, 0o644).unwrap();

        log.append_txn_begin(1).unwrap();
        log.append_before_image(1, 4096, &[0xAB; 64]).unwrap();
        log.append_txn_commit(1).unwrap();

        let entries = log.all_entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].entry_type, LogEntryType::TxnBegin);
        assert_eq!(entries[1].entry_type, LogEntryType::PageBeforeImg);
        assert_eq!(entries[1].payload.len(), 8 + 64);
        assert_eq!(entries[2].entry_type, LogEntryType::TxnCommit);
        assert!(entries.windows(2).all(|w| w[0].lsn < w[1].lsn));
    }

    #[test]
    fn test_reopen_detects_dirty_log() {
        let (_dir, base) = temp_base();
        {
            let mut log = Log::create(&base, 0o644).unwrap();
            log.append_txn_begin(1).unwrap();
            log.flush().unwrap();
        }
        let (mut log, dirty) = Log::open(&base, 0o644).unwrap();
        assert!(dirty);
        assert!(log.next_lsn() > 1);

        log.clear().unwrap();
        drop(log);
        let (_, dirty) = Log::open(&base, 0o644).unwrap();
        assert!(!dirty);
    }

    #[test]
    fn test_checkpoint_rotates_and_truncates() {
        let (_dir, base) = temp_base();
        let mut log = Log::create(&base, 0o644).unwrap();

        log.append_txn_begin(1).unwrap();
        log.append_txn_commit(1).unwrap();
        let cp = log.checkpoint().unwrap();
        assert_eq!(log.checkpoint_lsn(), cp);

        // New appends land in the rotated (truncated) file.
        log.append_txn_begin(2).unwrap();
        let entries = log.all_entries().unwrap();
        let last = entries.last().unwrap();
        assert_eq!(last.entry_type, LogEntryType::TxnBegin);
        assert_eq!(last.txn_id, 2);
    }

    #[test]
    fn test_recover_undoes_uncommitted_only() {
        let (_dir, base) = temp_base();
        const PS: u32 = 512;

        let mut dev = InMemoryDevice::new(PS, EnvFlags::IN_MEMORY);
        dev.create(&PathBuf::from(":memory:"), EnvFlags::IN_MEMORY, 0)
            .unwrap();
        use crate::device::Device;
        dev.alloc(PS as u64 * 4).unwrap();

        let mut log = Log::create(&base, 0o644).unwrap();

        // Committed txn 1 modified page 1; its before-image must stay
        // un-applied. Uncommitted txn 2 modified page 2; it must be undone.
        let before1 = vec![0x11u8; PS as usize];
        let before2 = vec![0x22u8; PS as usize];
        log.append_txn_begin(1).unwrap();
        log.append_before_image(1, PS as u64, &before1).unwrap();
        log.append_txn_commit(1).unwrap();
        log.append_txn_begin(2).unwrap();
        log.append_before_image(2, 2 * PS as u64, &before2).unwrap();

        // Current on-disk state: both pages carry the "after" bytes.
        dev.write(PS as u64, &vec![0xAAu8; PS as usize]).unwrap();
        dev.write(2 * PS as u64, &vec![0xBBu8; PS as usize]).unwrap();

        log.recover(&mut dev, PS).unwrap();

        let mut buf = vec![0u8; PS as usize];
        dev.read(PS as u64, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAA), "committed change rolled back");
        dev.read(2 * PS as u64, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x22), "uncommitted change survived");

        // Recovery leaves a clean log.
        assert!(log.all_entries().unwrap().is_empty());
    }

    #[test]
    fn test_torn_tail_is_tolerated() {
        let (_dir, base) = temp_base();
        {
            let mut log = Log::create(&base, 0o644).unwrap();
            log.append_txn_begin(1).unwrap();
            log.append_before_image(1, 4096, &[0xCD; 128]).unwrap();
            log.flush().unwrap();
        }
        // Chop the last entry mid-payload.
        let path = log_paths(&base)[0].clone();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        file.set_len(len - 40).unwrap();

        let (mut log, dirty) = Log::open(&base, 0o644).unwrap();
        assert!(dirty);
        let entries = log.all_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, LogEntryType::TxnBegin);
    }
}
