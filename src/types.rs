//! Core type aliases, flag sets and value types.
//!
//! Everything that crosses a module boundary lives here: record ids,
//! log sequence numbers, the public flag sets, and the key/record value
//! types handed in and out of database operations.

use bitflags::bitflags;

// ============================================================================
// Numeric Type Aliases
// ============================================================================

/// Record id: a 64-bit byte offset into the backing file. Zero is null.
pub type Rid = u64;

/// Log sequence number.
pub type Lsn = u64;

/// Transaction id.
pub type TxnId = u64;

/// Database name: a 16-bit identifier stored in the index slot.
/// Zero and values >= `0xF000` are reserved.
pub type DbName = u16;

// ============================================================================
// Constants
// ============================================================================

/// Magic bytes at offset 0 of the environment file.
pub const ENV_MAGIC: [u8; 4] = [b'H', b'A', b'M', 0];

/// Magic bytes at offset 0 of a log file.
pub const LOG_MAGIC: [u8; 8] = [b'H', b'A', b'M', b'L', b'0', b'0', b'0', b'1'];

/// File format version: major, minor, revision, file-format.
pub const ENV_VERSION: [u8; 4] = [2, 0, 0, 1];

/// Default page size in bytes.
pub const DEFAULT_PAGESIZE: u32 = 4096;

/// Smallest allowed page size.
pub const MIN_PAGESIZE: u32 = 512;

/// Largest allowed page size.
pub const MAX_PAGESIZE: u32 = 65536;

/// Allocation granularity of the freelist, in bytes.
pub const CHUNK_SIZE: u32 = 32;

/// Default inline key slot width.
pub const DEFAULT_KEYSIZE: u16 = 21;

/// Smallest inline key slot that still fits an extended-key rid.
pub const MIN_KEYSIZE: u16 = 8;

/// Default number of database index slots per environment.
pub const DEFAULT_MAX_DATABASES: u16 = 16;

/// Default cache limit, in pages.
pub const DEFAULT_CACHE_PAGES: usize = 256;

/// First database name reserved for internal use.
pub const DBNAME_RESERVED_FIRST: DbName = 0xF000;

// ============================================================================
// Flag Sets
// ============================================================================

bitflags! {
    /// Environment create/open flags. The low 16 bits are persisted in the
    /// header page; the rest only shape the in-process behavior.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnvFlags: u32 {
        /// Keep all data in memory; nothing is written to disk
        const IN_MEMORY        = 0x0000_0080;
        /// Open the file read-only
        const READ_ONLY        = 0x0000_0004;
        /// Maintain a write-ahead log and replay it on open
        const ENABLE_RECOVERY  = 0x0000_8000;
        /// Perform recovery silently when the log is unclean
        const AUTO_RECOVERY    = 0x0001_0000;
        /// Allow transactions on this environment
        const ENABLE_TRANSACTIONS = 0x0002_0000;
        /// Flush the log file on every commit
        const WRITE_THROUGH    = 0x0000_0001;
        /// Do not use a memory-mapped device even if available
        const DISABLE_MMAP     = 0x0000_0200;
        /// Fail with `CacheFull` instead of growing past the cache limit
        const CACHE_STRICT     = 0x0000_4000;
        /// Never evict; the cache may grow without bound
        const CACHE_UNLIMITED  = 0x0004_0000;
    }

    /// Per-database flags. The low 16 bits are persisted in the index slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DbFlags: u32 {
        /// A key may carry more than one record
        const ENABLE_DUPLICATES = 0x0000_2000;
        /// Keys are auto-incremented 64-bit record numbers
        const RECNO             = 0x0000_0040;
        /// Keep duplicates ordered by the record comparator
        const SORT_DUPLICATES   = 0x0000_0800;
        /// Keys longer than the slot width are rejected instead of spilled
        const DISABLE_VARIABLE_KEYS = 0x0000_0008;
        /// Maintain the per-node fast-index indirection array
        const FAST_INDEX        = 0x0000_0100;
    }

    /// Data-access-mode hints.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Dam: u16 {
        /// Mostly random point writes
        const RANDOM_WRITE      = 0x0001;
        /// Mostly ordered appends
        const SEQUENTIAL_INSERT = 0x0002;
        /// Trade lookup speed for insert speed
        const FAST_INSERT       = 0x0004;
        /// Write freelist pages in the legacy (v1) format
        const ENFORCE_PRE110_FORMAT = 0x0008;
    }

    /// Flags for insert operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InsertFlags: u32 {
        /// Replace the record if the key exists
        const OVERWRITE              = 0x0001;
        /// Add another record to the key
        const DUPLICATE              = 0x0002;
        /// Place the duplicate before the cursor position
        const DUPLICATE_INSERT_BEFORE = 0x0004;
        /// Place the duplicate after the cursor position
        const DUPLICATE_INSERT_AFTER  = 0x0008;
        /// Place the duplicate at the front of the table
        const DUPLICATE_INSERT_FIRST  = 0x0010;
        /// Place the duplicate at the end of the table
        const DUPLICATE_INSERT_LAST   = 0x0020;
        /// Only write the window described by the record's partial fields
        const PARTIAL                = 0x0080;
        /// The key is expected to sort past the current maximum
        const HINT_APPEND            = 0x0008_0000;
        /// The key is expected to sort before the current minimum
        const HINT_PREPEND           = 0x0010_0000;
    }

    /// Flags for find operations. An empty set means exact match.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FindFlags: u32 {
        /// Accept the largest key below the search key
        const LT_MATCH    = 0x1000;
        /// Accept the smallest key above the search key
        const GT_MATCH    = 0x2000;
        /// Accept an exact hit
        const EXACT_MATCH = 0x4000;
        /// Only read the partial window described by the record
        const PARTIAL     = 0x0080;
    }

    /// Direction flags set on a [`Key`] after an approximate match.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ApproxFlags: u8 {
        /// The returned key is less than the search key
        const LT = 0x01;
        /// The returned key is greater than the search key
        const GT = 0x02;
    }

    /// Flags for erase operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EraseFlags: u32 {
        /// Remove every duplicate of the key, not just one entry
        const ERASE_ALL_DUPLICATES = 0x0001;
    }

    /// Flags for cursor moves.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CursorFlags: u32 {
        /// Move to the first key of the database
        const FIRST           = 0x0001;
        /// Move to the last key of the database
        const LAST            = 0x0002;
        /// Move to the next key or duplicate
        const NEXT            = 0x0004;
        /// Move to the previous key or duplicate
        const PREVIOUS        = 0x0008;
        /// Step over remaining duplicates of the current key
        const SKIP_DUPLICATES = 0x0010;
        /// Stay within the duplicates of the current key
        const ONLY_DUPLICATES = 0x0020;
    }

    /// Flags for transaction begin/commit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TxnFlags: u32 {
        /// Flush the log as part of commit
        const WRITE_THROUGH = 0x0001;
    }
}

impl FindFlags {
    /// `<=`: exact or less-than.
    pub const LEQ_MATCH: FindFlags = FindFlags::EXACT_MATCH.union(FindFlags::LT_MATCH);
    /// `>=`: exact or greater-than.
    pub const GEQ_MATCH: FindFlags = FindFlags::EXACT_MATCH.union(FindFlags::GT_MATCH);
    /// Nearest neighbour in either direction, exact preferred.
    pub const NEAR_MATCH: FindFlags = FindFlags::EXACT_MATCH
        .union(FindFlags::LT_MATCH)
        .union(FindFlags::GT_MATCH);

    /// True if any approximate-match bit is set.
    pub fn is_approximate(&self) -> bool {
        self.intersects(FindFlags::LT_MATCH | FindFlags::GT_MATCH)
    }
}

// ============================================================================
// Keys and Records
// ============================================================================

/// A key as handed in and out of database operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Key {
    /// Key bytes.
    pub data: Vec<u8>,
    /// Set after an approximate match to tell the caller which side of the
    /// search key the returned key is on.
    pub approx: ApproxFlags,
}

impl Key {
    /// Key from a byte slice.
    pub fn new(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            approx: ApproxFlags::empty(),
        }
    }

    /// A record-number key. Stored little-endian, compared host-endian.
    pub fn from_recno(recno: u64) -> Self {
        Self {
            data: recno.to_le_bytes().to_vec(),
            approx: ApproxFlags::empty(),
        }
    }

    /// Interpret the key bytes as a record number.
    pub fn as_recno(&self) -> Option<u64> {
        if self.data.len() == 8 {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&self.data);
            Some(u64::from_le_bytes(buf))
        } else {
            None
        }
    }
}

/// A record as handed in and out of database operations.
///
/// For `PARTIAL` reads and writes, `partial_offset`/`partial_size` describe
/// the window within the stored record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    /// Record bytes. For a partial write, only the window contents.
    pub data: Vec<u8>,
    /// Byte offset of the partial window.
    pub partial_offset: u32,
    /// Size of the partial window.
    pub partial_size: u32,
}

impl Record {
    /// Record from a byte slice.
    pub fn new(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            partial_offset: 0,
            partial_size: 0,
        }
    }

    /// Record describing a partial window.
    pub fn partial(data: &[u8], offset: u32, size: u32) -> Self {
        Self {
            data: data.to_vec(),
            partial_offset: offset,
            partial_size: size,
        }
    }
}

// ============================================================================
// Configuration Parameters
// ============================================================================

/// Parameters accepted by environment create/open.
#[derive(Debug, Clone)]
pub struct EnvParams {
    /// Page size in bytes; power of two, multiple of 512.
    pub pagesize: u32,
    /// Cache limit: bytes, or a page count when < 512.
    pub cachesize: usize,
    /// Number of database index slots.
    pub max_databases: u16,
    /// Default data-access-mode for databases in this environment.
    pub dam: Dam,
    /// POSIX mode bits for the created file.
    pub file_mode: u32,
    /// Pre-extend the file to this many bytes on create.
    pub initial_db_size: u64,
    /// Name of a registered custom device factory.
    pub custom_device: Option<String>,
}

impl Default for EnvParams {
    fn default() -> Self {
        Self {
            pagesize: DEFAULT_PAGESIZE,
            cachesize: DEFAULT_CACHE_PAGES,
            max_databases: DEFAULT_MAX_DATABASES,
            dam: Dam::empty(),
            file_mode: 0o644,
            initial_db_size: 0,
            custom_device: None,
        }
    }
}

impl EnvParams {
    /// Resolve the cache limit to a page count.
    pub fn cache_pages(&self, pagesize: u32) -> usize {
        if self.cachesize == 0 {
            DEFAULT_CACHE_PAGES
        } else if self.cachesize < 512 {
            self.cachesize
        } else {
            (self.cachesize / pagesize as usize).max(1)
        }
    }
}

/// Parameters accepted by database create/open.
#[derive(Debug, Clone)]
pub struct DbParams {
    /// Inline key slot width.
    pub keysize: u16,
    /// Data-access-mode override for this database.
    pub dam: Dam,
}

impl Default for DbParams {
    fn default() -> Self {
        Self {
            keysize: DEFAULT_KEYSIZE,
            dam: Dam::empty(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_flag_combinations() {
        assert!(FindFlags::LEQ_MATCH.contains(FindFlags::EXACT_MATCH));
        assert!(FindFlags::LEQ_MATCH.contains(FindFlags::LT_MATCH));
        assert!(!FindFlags::LEQ_MATCH.contains(FindFlags::GT_MATCH));
        assert!(FindFlags::NEAR_MATCH.is_approximate());
        assert!(!FindFlags::EXACT_MATCH.is_approximate());
    }

    #[test]
    fn test_recno_key_roundtrip() {
        let k = Key::from_recno(0x1122_3344_5566_7788);
        assert_eq!(k.data.len(), 8);
        assert_eq!(k.as_recno(), Some(0x1122_3344_5566_7788));
        assert_eq!(Key::new(b"abc").as_recno(), None);
    }

    #[test]
    fn test_cache_pages_resolution() {
        let mut p = EnvParams::default();
        p.cachesize = 64;
        assert_eq!(p.cache_pages(4096), 64);
        p.cachesize = 1 << 20;
        assert_eq!(p.cache_pages(4096), 256);
        p.cachesize = 0;
        assert_eq!(p.cache_pages(4096), DEFAULT_CACHE_PAGES);
    }
}
