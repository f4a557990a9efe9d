//! Blob store.
//!
//! Records and other variable-length byte strings are stored either inline
//! (in the 8 rid bytes of a key record or duplicate entry, for sizes up to
//! 8) or out of line as a *blob*: a 28-byte header followed by the data.
//! Small blobs are carved out of chunk-aligned freelist space anywhere in
//! the file; blobs of a page or more get a page-aligned extent whose first
//! page carries a typed page header, while continuation pages stay raw.
//!
//! Duplicate tables are themselves blobs holding a `{count, capacity}`
//! header plus fixed 16-byte entries with the same inline encoding as key
//! records.

use std::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, ErrorCode, Result};
use crate::types::{InsertFlags, Record, Rid};

use super::freelist::{round_to_chunks, AllocHints, Freelist};
use super::page::{PageRef, PageType, PAGE_HEADER_SIZE};
use super::PageIo;

// ============================================================================
// Constants
// ============================================================================

/// Persisted blob header: self_rid(8) + allocated_size(8) + actual_size(8)
/// + flags(4).
pub const BLOB_HEADER_SIZE: usize = 28;

/// Inline record of up to 7 bytes; the length sits in the last rid byte.
pub const BLOB_FLAG_TINY: u8 = 0x01;

/// Inline record of exactly 8 bytes filling the rid.
pub const BLOB_FLAG_SMALL: u8 = 0x02;

/// Record with zero bytes.
pub const BLOB_FLAG_EMPTY: u8 = 0x04;

/// Mask of all inline encodings.
pub const BLOB_FLAG_INLINE_MASK: u8 = BLOB_FLAG_TINY | BLOB_FLAG_SMALL | BLOB_FLAG_EMPTY;

/// Size of one duplicate table entry.
pub const DUPE_ENTRY_SIZE: usize = 16;

/// Duplicate table header: count(4) + capacity(4).
pub const DUPE_TABLE_HEADER_SIZE: usize = 8;

/// Capacity of a freshly created duplicate table.
const DUPE_TABLE_INITIAL_CAPACITY: u32 = 8;

// ============================================================================
// Inline Encoding
// ============================================================================

/// Encode data of up to 8 bytes into the rid field. Returns `None` when the
/// data needs a real blob.
pub fn encode_inline(data: &[u8]) -> Option<([u8; 8], u8)> {
    let mut rid = [0u8; 8];
    match data.len() {
        0 => Some((rid, BLOB_FLAG_EMPTY)),
        n @ 1..=7 => {
            rid[..n].copy_from_slice(data);
            rid[7] = n as u8;
            Some((rid, BLOB_FLAG_TINY))
        }
        8 => {
            rid.copy_from_slice(data);
            Some((rid, BLOB_FLAG_SMALL))
        }
        _ => None,
    }
}

/// Decode an inline rid field. Returns `None` when the flags describe an
/// out-of-line blob.
pub fn decode_inline(rid: &[u8; 8], flags: u8) -> Option<Vec<u8>> {
    if flags & BLOB_FLAG_EMPTY != 0 {
        Some(Vec::new())
    } else if flags & BLOB_FLAG_TINY != 0 {
        let len = (rid[7] as usize).min(7);
        Some(rid[..len].to_vec())
    } else if flags & BLOB_FLAG_SMALL != 0 {
        Some(rid.to_vec())
    } else {
        None
    }
}

/// Out-of-line rid as a u64.
pub fn rid_value(rid: &[u8; 8]) -> Rid {
    LittleEndian::read_u64(rid)
}

/// u64 rid into its persisted form.
pub fn rid_bytes(rid: Rid) -> [u8; 8] {
    let mut buf = [0u8; 8];
    LittleEndian::write_u64(&mut buf, rid);
    buf
}

// ============================================================================
// Blob Header
// ============================================================================

/// Parsed blob header.
#[derive(Debug, Clone, Copy)]
pub struct BlobHeader {
    /// Address of this header in the file.
    pub self_rid: Rid,
    /// Bytes allocated for header plus data (excluding a leading page
    /// header on page-aligned extents).
    pub allocated_size: u64,
    /// Bytes of live data after the header.
    pub actual_size: u64,
    /// Reserved; zero.
    pub flags: u32,
}

impl BlobHeader {
    fn to_bytes(self) -> [u8; BLOB_HEADER_SIZE] {
        let mut buf = [0u8; BLOB_HEADER_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.self_rid);
        LittleEndian::write_u64(&mut buf[8..16], self.allocated_size);
        LittleEndian::write_u64(&mut buf[16..24], self.actual_size);
        LittleEndian::write_u32(&mut buf[24..28], self.flags);
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            self_rid: LittleEndian::read_u64(&buf[0..8]),
            allocated_size: LittleEndian::read_u64(&buf[8..16]),
            actual_size: LittleEndian::read_u64(&buf[16..24]),
            flags: LittleEndian::read_u32(&buf[24..28]),
        }
    }
}

/// Read and validate the header at `rid`.
pub fn read_header(io: &mut PageIo<'_>, rid: Rid) -> Result<BlobHeader> {
    let mut buf = [0u8; BLOB_HEADER_SIZE];
    io.device.read(rid, &mut buf)?;
    let header = BlobHeader::from_bytes(&buf);
    if header.self_rid != rid {
        return Err(Error::with_message(
            ErrorCode::BlobNotFound,
            format!("no blob header at {:#x}", rid),
        ));
    }
    Ok(header)
}

// ============================================================================
// Extent Management
// ============================================================================

/// True when `rid` sits just past a page header, i.e. the blob owns a
/// page-aligned extent.
fn is_page_extent(io: &PageIo<'_>, rid: Rid) -> bool {
    rid % io.pagesize as u64 == PAGE_HEADER_SIZE as u64
}

/// Allocate space for `total` bytes of header+data. Returns the blob rid
/// and the allocated size to record in the header.
fn alloc_extent(
    io: &mut PageIo<'_>,
    fl: &mut Freelist,
    header: &PageRef,
    total: u64,
    kind: PageType,
    hints: &AllocHints,
) -> Result<(Rid, u64)> {
    let pagesize = io.pagesize as u64;

    if total + PAGE_HEADER_SIZE as u64 > pagesize {
        // Page-aligned extent; the first page carries a typed header.
        let npages = (total + PAGE_HEADER_SIZE as u64).div_ceil(pagesize);
        let extent_size = npages * pagesize;
        let mut page_hints = *hints;
        page_hints.page_aligned = true;
        let extent = match fl.alloc_area(io, header, extent_size, &page_hints)? {
            Some(rid) => rid,
            None => io.device.alloc(extent_size)?,
        };
        // The extent start gets a page-type header; evict any stale cached
        // image of that page first.
        io.discard_page(extent)?;
        let mut page_hdr = [0u8; PAGE_HEADER_SIZE];
        LittleEndian::write_u32(&mut page_hdr[0..4], kind as u32);
        io.device.write(extent, &page_hdr)?;
        Ok((extent + PAGE_HEADER_SIZE as u64, extent_size - PAGE_HEADER_SIZE as u64))
    } else {
        let alloc = round_to_chunks(total);
        let rid = match fl.alloc_area(io, header, alloc, hints)? {
            Some(rid) => rid,
            None => {
                // Extend by whole pages and return the tail to the freelist.
                let grow = alloc.div_ceil(pagesize) * pagesize;
                let rid = io.device.alloc(grow)?;
                if grow > alloc {
                    fl.mark_free(io, header, rid + alloc, grow - alloc, false)?;
                }
                rid
            }
        };
        Ok((rid, alloc))
    }
}

/// Return a blob's extent to the freelist.
fn free_extent(
    io: &mut PageIo<'_>,
    fl: &mut Freelist,
    header: &PageRef,
    blob: &BlobHeader,
) -> Result<()> {
    if is_page_extent(io, blob.self_rid) {
        let extent = blob.self_rid - PAGE_HEADER_SIZE as u64;
        io.discard_page(extent)?;
        fl.mark_free(io, header, extent, blob.allocated_size + PAGE_HEADER_SIZE as u64, false)
    } else {
        fl.mark_free(io, header, blob.self_rid, blob.allocated_size, false)
    }
}

// ============================================================================
// Blob Operations
// ============================================================================

/// Store a record. Returns the rid bytes and blob flags to put into the
/// referencing key record or duplicate entry.
pub fn allocate(
    io: &mut PageIo<'_>,
    fl: &mut Freelist,
    header: &PageRef,
    record: &Record,
    flags: InsertFlags,
    kind: PageType,
    hints: &AllocHints,
) -> Result<([u8; 8], u8)> {
    let partial = flags.contains(InsertFlags::PARTIAL);
    if partial && record.data.len() != record.partial_size as usize {
        return Err(Error::with_message(
            ErrorCode::InvalidParameter,
            "partial write data does not match partial_size",
        ));
    }

    let total: u64 = if partial {
        record.partial_offset as u64 + record.partial_size as u64
    } else {
        record.data.len() as u64
    };

    if total <= 8 {
        // Inline; materialize the full bytes (zero gap for partial writes).
        let mut full = vec![0u8; total as usize];
        if partial {
            full[record.partial_offset as usize..].copy_from_slice(&record.data);
        } else {
            full.copy_from_slice(&record.data);
        }
        let (rid, blob_flags) = encode_inline(&full).expect("total <= 8 always inlines");
        return Ok((rid, blob_flags));
    }

    let (rid, allocated) = alloc_extent(io, fl, header, BLOB_HEADER_SIZE as u64 + total, kind, hints)?;
    let blob = BlobHeader {
        self_rid: rid,
        allocated_size: allocated,
        actual_size: total,
        flags: 0,
    };

    let mut image = vec![0u8; BLOB_HEADER_SIZE + total as usize];
    image[..BLOB_HEADER_SIZE].copy_from_slice(&blob.to_bytes());
    if partial {
        let off = BLOB_HEADER_SIZE + record.partial_offset as usize;
        image[off..off + record.partial_size as usize].copy_from_slice(&record.data);
    } else {
        image[BLOB_HEADER_SIZE..].copy_from_slice(&record.data);
    }
    io.device.write(rid, &image)?;
    Ok((rid_bytes(rid), 0))
}

/// Read a record, decoding inline forms first.
pub fn read(
    io: &mut PageIo<'_>,
    rid: &[u8; 8],
    blob_flags: u8,
    partial: Option<(u32, u32)>,
) -> Result<Record> {
    let full = match decode_inline(rid, blob_flags) {
        Some(data) => data,
        None => {
            let blob = read_header(io, rid_value(rid))?;
            let mut data = vec![0u8; blob.actual_size as usize];
            io.device
                .read(blob.self_rid + BLOB_HEADER_SIZE as u64, &mut data)?;
            data
        }
    };

    match partial {
        None => Ok(Record::new(&full)),
        Some((offset, size)) => {
            // Clip the window to the true size and report it.
            let start = (offset as usize).min(full.len());
            let end = (offset as usize + size as usize).min(full.len());
            Ok(Record {
                data: full[start..end].to_vec(),
                partial_offset: offset,
                partial_size: (end - start) as u32,
            })
        }
    }
}

/// Size of the stored record without reading the data.
pub fn datasize(io: &mut PageIo<'_>, rid: &[u8; 8], blob_flags: u8) -> Result<u64> {
    if blob_flags & BLOB_FLAG_EMPTY != 0 {
        return Ok(0);
    }
    if blob_flags & BLOB_FLAG_TINY != 0 {
        return Ok(rid[7] as u64);
    }
    if blob_flags & BLOB_FLAG_SMALL != 0 {
        return Ok(8);
    }
    Ok(read_header(io, rid_value(rid))?.actual_size)
}

/// Overwrite a record, reusing the old extent when the new size fits.
/// Returns the new rid bytes and blob flags.
pub fn overwrite(
    io: &mut PageIo<'_>,
    fl: &mut Freelist,
    header: &PageRef,
    old_rid: &[u8; 8],
    old_flags: u8,
    record: &Record,
    flags: InsertFlags,
    kind: PageType,
    hints: &AllocHints,
) -> Result<([u8; 8], u8)> {
    let partial = flags.contains(InsertFlags::PARTIAL);

    // Partial overwrites preserve the bytes outside the window, so build
    // the merged image first.
    if partial {
        let old = read(io, old_rid, old_flags, None)?;
        let end = record.partial_offset as u64 + record.partial_size as u64;
        let new_len = (old.data.len() as u64).max(end) as usize;
        let mut merged = old.data;
        merged.resize(new_len, 0);
        merged[record.partial_offset as usize..end as usize].copy_from_slice(&record.data);

        let merged_record = Record::new(&merged);
        return overwrite(
            io,
            fl,
            header,
            old_rid,
            old_flags,
            &merged_record,
            flags & !InsertFlags::PARTIAL,
            kind,
            hints,
        );
    }

    // Old record inline: nothing on disk to reuse or free.
    if old_flags & BLOB_FLAG_INLINE_MASK != 0 {
        return allocate(io, fl, header, record, flags, kind, hints);
    }

    let old_blob = read_header(io, rid_value(old_rid))?;
    let needed = BLOB_HEADER_SIZE as u64 + record.data.len() as u64;

    if record.data.len() > 8 && needed <= old_blob.allocated_size {
        // Fits in place; the rid stays stable.
        let blob = BlobHeader {
            actual_size: record.data.len() as u64,
            ..old_blob
        };
        let mut image = vec![0u8; BLOB_HEADER_SIZE + record.data.len()];
        image[..BLOB_HEADER_SIZE].copy_from_slice(&blob.to_bytes());
        image[BLOB_HEADER_SIZE..].copy_from_slice(&record.data);
        io.device.write(blob.self_rid, &image)?;
        return Ok((*old_rid, 0));
    }

    free_extent(io, fl, header, &old_blob)?;
    allocate(io, fl, header, record, flags, kind, hints)
}

/// Release a record's storage. Inline forms are a no-op.
pub fn free(
    io: &mut PageIo<'_>,
    fl: &mut Freelist,
    header: &PageRef,
    rid: &[u8; 8],
    blob_flags: u8,
) -> Result<()> {
    if blob_flags & BLOB_FLAG_INLINE_MASK != 0 {
        return Ok(());
    }
    let blob = read_header(io, rid_value(rid))?;
    free_extent(io, fl, header, &blob)
}

// ============================================================================
// Duplicate Tables
// ============================================================================

/// One persisted duplicate entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DupeEntry {
    /// Inline-encoding flags, same bits as key records.
    pub flags: u8,
    /// Record rid or inline bytes.
    pub rid: [u8; 8],
}

impl DupeEntry {
    fn to_bytes(self) -> [u8; DUPE_ENTRY_SIZE] {
        let mut buf = [0u8; DUPE_ENTRY_SIZE];
        buf[7] = self.flags;
        buf[8..16].copy_from_slice(&self.rid);
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        let mut rid = [0u8; 8];
        rid.copy_from_slice(&buf[8..16]);
        Self { flags: buf[7], rid }
    }

    /// Read the record this entry points at.
    pub fn read_record(
        &self,
        io: &mut PageIo<'_>,
        partial: Option<(u32, u32)>,
    ) -> Result<Record> {
        read(io, &self.rid, self.flags, partial)
    }
}

/// Parsed duplicate table.
struct DupeTable {
    rid: Rid,
    capacity: u32,
    entries: Vec<DupeEntry>,
}

fn table_load(io: &mut PageIo<'_>, table_rid: Rid) -> Result<DupeTable> {
    let blob = read_header(io, table_rid)?;
    let mut data = vec![0u8; blob.actual_size as usize];
    io.device.read(table_rid + BLOB_HEADER_SIZE as u64, &mut data)?;

    let count = LittleEndian::read_u32(&data[0..4]);
    let capacity = LittleEndian::read_u32(&data[4..8]);
    if data.len() < DUPE_TABLE_HEADER_SIZE + capacity as usize * DUPE_ENTRY_SIZE
        || count > capacity
    {
        return Err(Error::with_message(
            ErrorCode::IntegrityViolated,
            format!("malformed duplicate table at {:#x}", table_rid),
        ));
    }

    let mut entries = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let off = DUPE_TABLE_HEADER_SIZE + i * DUPE_ENTRY_SIZE;
        entries.push(DupeEntry::from_bytes(&data[off..off + DUPE_ENTRY_SIZE]));
    }
    Ok(DupeTable {
        rid: table_rid,
        capacity,
        entries,
    })
}

fn table_bytes(capacity: u32, entries: &[DupeEntry]) -> Vec<u8> {
    let mut data = vec![0u8; DUPE_TABLE_HEADER_SIZE + capacity as usize * DUPE_ENTRY_SIZE];
    LittleEndian::write_u32(&mut data[0..4], entries.len() as u32);
    LittleEndian::write_u32(&mut data[4..8], capacity);
    for (i, entry) in entries.iter().enumerate() {
        let off = DUPE_TABLE_HEADER_SIZE + i * DUPE_ENTRY_SIZE;
        data[off..off + DUPE_ENTRY_SIZE].copy_from_slice(&entry.to_bytes());
    }
    data
}

/// Write a table back, growing its blob when capacity demands. Returns the
/// (possibly moved) table rid.
fn table_store(
    io: &mut PageIo<'_>,
    fl: &mut Freelist,
    header: &PageRef,
    table: &DupeTable,
    hints: &AllocHints,
) -> Result<Rid> {
    let mut capacity = table.capacity.max(DUPE_TABLE_INITIAL_CAPACITY);
    while (table.entries.len() as u32) > capacity {
        capacity *= 2;
    }

    let data = table_bytes(capacity, &table.entries);
    let record = Record::new(&data);
    if table.rid == 0 {
        let (rid, _) = allocate(
            io,
            fl,
            header,
            &record,
            InsertFlags::empty(),
            PageType::DupeTable,
            hints,
        )?;
        return Ok(rid_value(&rid));
    }

    let old_rid = rid_bytes(table.rid);
    let (rid, _) = overwrite(
        io,
        fl,
        header,
        &old_rid,
        0,
        &record,
        InsertFlags::empty(),
        PageType::DupeTable,
        hints,
    )?;
    Ok(rid_value(&rid))
}

/// Comparator used for sorted duplicate placement.
pub type RecordCompare<'c> = &'c dyn Fn(&[u8], &[u8]) -> Ordering;

/// Insert one duplicate record.
///
/// `table_rid == 0` creates a fresh table seeded with `seed` (the records
/// already attached to the key, in order). The insert position comes from
/// the placement flags, or from `sort` when the database keeps duplicates
/// ordered. Returns the new table rid and the entry's position.
#[allow(clippy::too_many_arguments)]
pub fn dupe_insert(
    io: &mut PageIo<'_>,
    fl: &mut Freelist,
    header: &PageRef,
    table_rid: Rid,
    seed: &[DupeEntry],
    record: &Record,
    position: u32,
    flags: InsertFlags,
    sort: Option<RecordCompare<'_>>,
    hints: &AllocHints,
) -> Result<(Rid, u32)> {
    if flags.contains(InsertFlags::PARTIAL) && sort.is_some() {
        return Err(Error::with_message(
            ErrorCode::InvalidParameter,
            "partial writes cannot target sorted duplicates",
        ));
    }

    let mut table = if table_rid == 0 {
        DupeTable {
            rid: 0,
            capacity: DUPE_TABLE_INITIAL_CAPACITY,
            entries: seed.to_vec(),
        }
    } else {
        table_load(io, table_rid)?
    };

    let (rid, blob_flags) = allocate(io, fl, header, record, flags, PageType::Blob, hints)?;
    let entry = DupeEntry {
        flags: blob_flags,
        rid,
    };

    let pos = if let Some(cmp) = sort {
        let mut lo = 0usize;
        let mut hi = table.entries.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let other = table.entries[mid].read_record(io, None)?;
            if cmp(&record.data, &other.data) == Ordering::Less {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo
    } else if flags.contains(InsertFlags::DUPLICATE_INSERT_FIRST) {
        0
    } else if flags.contains(InsertFlags::DUPLICATE_INSERT_BEFORE) {
        (position as usize).min(table.entries.len())
    } else if flags.contains(InsertFlags::DUPLICATE_INSERT_AFTER) {
        (position as usize + 1).min(table.entries.len())
    } else {
        // DUPLICATE_INSERT_LAST and plain DUPLICATE append.
        table.entries.len()
    };

    table.entries.insert(pos, entry);
    let new_rid = table_store(io, fl, header, &table, hints)?;
    Ok((new_rid, pos as u32))
}

/// Erase one duplicate (or the whole table with `all == true`), freeing the
/// out-of-line records it referenced. Returns the new table rid, 0 when the
/// table is gone.
pub fn dupe_erase(
    io: &mut PageIo<'_>,
    fl: &mut Freelist,
    header: &PageRef,
    table_rid: Rid,
    position: u32,
    all: bool,
    hints: &AllocHints,
) -> Result<Rid> {
    let mut table = table_load(io, table_rid)?;

    if all {
        for entry in &table.entries {
            free(io, fl, header, &entry.rid, entry.flags)?;
        }
        let blob = read_header(io, table_rid)?;
        free_extent(io, fl, header, &blob)?;
        return Ok(0);
    }

    if position as usize >= table.entries.len() {
        return Err(Error::new(ErrorCode::KeyNotFound));
    }
    let entry = table.entries.remove(position as usize);
    free(io, fl, header, &entry.rid, entry.flags)?;

    if table.entries.is_empty() {
        let blob = read_header(io, table_rid)?;
        free_extent(io, fl, header, &blob)?;
        return Ok(0);
    }
    table_store(io, fl, header, &table, hints)
}

/// Fetch one entry of a duplicate table.
pub fn dupe_get(io: &mut PageIo<'_>, table_rid: Rid, position: u32) -> Result<DupeEntry> {
    let table = table_load(io, table_rid)?;
    table
        .entries
        .get(position as usize)
        .copied()
        .ok_or_else(|| Error::new(ErrorCode::KeyNotFound))
}

/// Number of entries in a duplicate table.
pub fn dupe_count(io: &mut PageIo<'_>, table_rid: Rid) -> Result<u32> {
    Ok(table_load(io, table_rid)?.entries.len() as u32)
}

/// All entries of a duplicate table, for scans.
pub fn dupe_get_all(io: &mut PageIo<'_>, table_rid: Rid) -> Result<Vec<DupeEntry>> {
    Ok(table_load(io, table_rid)?.entries)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, InMemoryDevice};
    use crate::storage::cache::Cache;
    use crate::storage::page::Page;
    use crate::types::EnvFlags;
    use std::cell::RefCell;
    use std::path::PathBuf;
    use std::rc::Rc;

    const PAGESIZE: u32 = 1024;

    struct Fixture {
        device: Box<dyn Device>,
        cache: Cache,
        dirty: Vec<Rid>,
        header: PageRef,
        fl: Freelist,
    }

    impl Fixture {
        fn new() -> Self {
            let mut dev = InMemoryDevice::new(PAGESIZE, EnvFlags::IN_MEMORY);
            dev.create(&PathBuf::from(":memory:"), EnvFlags::IN_MEMORY, 0)
                .unwrap();
            dev.alloc_page(PAGESIZE).unwrap();
            let header = Rc::new(RefCell::new(Page::new(0, PAGESIZE, PageType::Header)));
            let mut fx = Self {
                device: Box::new(dev),
                cache: Cache::new(64, false, false),
                dirty: Vec::new(),
                header,
                fl: Freelist::new(64, false),
            };
            let header = fx.header.clone();
            let (mut io, fl) = fx.split();
            fl.init_new(&mut io, &header).unwrap();
            fx
        }

        fn split(&mut self) -> (PageIo<'_>, &mut Freelist) {
            (
                PageIo {
                    device: self.device.as_mut(),
                    cache: &mut self.cache,
                    log: None,
                    txn_id: None,
                    txn_dirty: &mut self.dirty,
                    pagesize: PAGESIZE,
                },
                &mut self.fl,
            )
        }
    }

    #[test]
    fn test_inline_encodings() {
        let (rid, flags) = encode_inline(b"").unwrap();
        assert_eq!(flags, BLOB_FLAG_EMPTY);
        assert_eq!(decode_inline(&rid, flags).unwrap(), b"");

        let (rid, flags) = encode_inline(b"tiny").unwrap();
        assert_eq!(flags, BLOB_FLAG_TINY);
        assert_eq!(decode_inline(&rid, flags).unwrap(), b"tiny");

        let (rid, flags) = encode_inline(b"8bytes!!").unwrap();
        assert_eq!(flags, BLOB_FLAG_SMALL);
        assert_eq!(decode_inline(&rid, flags).unwrap(), b"8bytes!!");

        assert!(encode_inline(b"nine bytes").is_none());
    }

    #[test]
    fn test_blob_roundtrip() {
        let mut fx = Fixture::new();
        let header = fx.header.clone();
        let (mut io, fl) = fx.split();

        let payload = vec![0x42u8; 300];
        let record = Record::new(&payload);
        let (rid, flags) = allocate(
            &mut io,
            fl,
            &header,
            &record,
            InsertFlags::empty(),
            PageType::Blob,
            &AllocHints::default(),
        )
        .unwrap();
        assert_eq!(flags, 0);

        let back = read(&mut io, &rid, flags, None).unwrap();
        assert_eq!(back.data, payload);
        assert_eq!(datasize(&mut io, &rid, flags).unwrap(), 300);
    }

    #[test]
    fn test_multi_page_blob() {
        let mut fx = Fixture::new();
        let header = fx.header.clone();
        let (mut io, fl) = fx.split();

        let payload: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let (rid, flags) = allocate(
            &mut io,
            fl,
            &header,
            &Record::new(&payload),
            InsertFlags::empty(),
            PageType::Blob,
            &AllocHints::default(),
        )
        .unwrap();

        // Page-aligned extent: the blob header sits right after the page
        // header of the extent's first page.
        assert_eq!(rid_value(&rid) % PAGESIZE as u64, PAGE_HEADER_SIZE as u64);
        let back = read(&mut io, &rid, flags, None).unwrap();
        assert_eq!(back.data, payload);
    }

    #[test]
    fn test_free_then_reuse() {
        let mut fx = Fixture::new();
        let header = fx.header.clone();
        let (mut io, fl) = fx.split();

        let record = Record::new(&[0x11u8; 200]);
        let (rid, flags) = allocate(
            &mut io,
            fl,
            &header,
            &record,
            InsertFlags::empty(),
            PageType::Blob,
            &AllocHints::default(),
        )
        .unwrap();
        let free_before = fl.free_bytes();
        free(&mut io, fl, &header, &rid, flags).unwrap();
        assert!(fl.free_bytes() > free_before);
    }

    #[test]
    fn test_overwrite_in_place_keeps_rid() {
        let mut fx = Fixture::new();
        let header = fx.header.clone();
        let (mut io, fl) = fx.split();

        let (rid, flags) = allocate(
            &mut io,
            fl,
            &header,
            &Record::new(&[0xAAu8; 200]),
            InsertFlags::empty(),
            PageType::Blob,
            &AllocHints::default(),
        )
        .unwrap();

        let (new_rid, new_flags) = overwrite(
            &mut io,
            fl,
            &header,
            &rid,
            flags,
            &Record::new(&[0xBBu8; 150]),
            InsertFlags::empty(),
            PageType::Blob,
            &AllocHints::default(),
        )
        .unwrap();
        assert_eq!(new_rid, rid, "shrinking overwrite must reuse the extent");
        assert_eq!(read(&mut io, &new_rid, new_flags, None).unwrap().data, vec![0xBBu8; 150]);
    }

    #[test]
    fn test_partial_overwrite_preserves_surroundings() {
        let mut fx = Fixture::new();
        let header = fx.header.clone();
        let (mut io, fl) = fx.split();

        let (rid, flags) = allocate(
            &mut io,
            fl,
            &header,
            &Record::new(&[0xAAu8; 1024]),
            InsertFlags::empty(),
            PageType::Blob,
            &AllocHints::default(),
        )
        .unwrap();

        let window = Record::partial(&[0xBBu8; 10], 100, 10);
        let (rid, flags) = overwrite(
            &mut io,
            fl,
            &header,
            &rid,
            flags,
            &window,
            InsertFlags::PARTIAL,
            PageType::Blob,
            &AllocHints::default(),
        )
        .unwrap();

        let back = read(&mut io, &rid, flags, None).unwrap();
        assert_eq!(back.data.len(), 1024);
        assert!(back.data[..100].iter().all(|&b| b == 0xAA));
        assert!(back.data[100..110].iter().all(|&b| b == 0xBB));
        assert!(back.data[110..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_partial_insert_zero_fills_gap() {
        let mut fx = Fixture::new();
        let header = fx.header.clone();
        let (mut io, fl) = fx.split();

        let window = Record::partial(&[0xCCu8; 8], 64, 8);
        let (rid, flags) = allocate(
            &mut io,
            fl,
            &header,
            &window,
            InsertFlags::PARTIAL,
            PageType::Blob,
            &AllocHints::default(),
        )
        .unwrap();

        let back = read(&mut io, &rid, flags, None).unwrap();
        assert_eq!(back.data.len(), 72);
        assert!(back.data[..64].iter().all(|&b| b == 0));
        assert!(back.data[64..].iter().all(|&b| b == 0xCC));
    }

    #[test]
    fn test_partial_read_clips() {
        let mut fx = Fixture::new();
        let header = fx.header.clone();
        let (mut io, fl) = fx.split();

        let (rid, flags) = allocate(
            &mut io,
            fl,
            &header,
            &Record::new(&[0x77u8; 100]),
            InsertFlags::empty(),
            PageType::Blob,
            &AllocHints::default(),
        )
        .unwrap();

        let back = read(&mut io, &rid, flags, Some((90, 50))).unwrap();
        assert_eq!(back.data, vec![0x77u8; 10]);
        assert_eq!(back.partial_size, 10);
    }

    #[test]
    fn test_dupe_table_insert_order() {
        let mut fx = Fixture::new();
        let header = fx.header.clone();
        let (mut io, fl) = fx.split();
        let hints = AllocHints::default();

        // Start with r1, append r2 LAST, then r3 FIRST: table is r3 r1 r2.
        let (r1_rid, r1_flags) = allocate(
            &mut io, fl, &header,
            &Record::new(b"r1"), InsertFlags::empty(), PageType::Blob, &hints,
        ).unwrap();
        let seed = [DupeEntry { flags: r1_flags, rid: r1_rid }];

        let (table, pos) = dupe_insert(
            &mut io, fl, &header, 0, &seed,
            &Record::new(b"r2"), 0, InsertFlags::DUPLICATE_INSERT_LAST, None, &hints,
        ).unwrap();
        assert_eq!(pos, 1);

        let (table, pos) = dupe_insert(
            &mut io, fl, &header, table, &[],
            &Record::new(b"r3"), 0, InsertFlags::DUPLICATE_INSERT_FIRST, None, &hints,
        ).unwrap();
        assert_eq!(pos, 0);
        assert_eq!(dupe_count(&mut io, table).unwrap(), 3);

        let records: Vec<Vec<u8>> = dupe_get_all(&mut io, table)
            .unwrap()
            .iter()
            .map(|e| e.read_record(&mut io, None).unwrap().data)
            .collect();
        assert_eq!(records, vec![b"r3".to_vec(), b"r1".to_vec(), b"r2".to_vec()]);
    }

    #[test]
    fn test_dupe_table_growth() {
        let mut fx = Fixture::new();
        let header = fx.header.clone();
        let (mut io, fl) = fx.split();
        let hints = AllocHints::default();

        let mut table = 0;
        for i in 0..40u32 {
            let record = Record::new(format!("record-{i}").as_bytes());
            let (t, _) = dupe_insert(
                &mut io, fl, &header, table, &[],
                &record, 0, InsertFlags::DUPLICATE_INSERT_LAST, None, &hints,
            ).unwrap();
            table = t;
        }
        assert_eq!(dupe_count(&mut io, table).unwrap(), 40);
        let entry = dupe_get(&mut io, table, 39).unwrap();
        assert_eq!(entry.read_record(&mut io, None).unwrap().data, b"record-39");
    }

    #[test]
    fn test_dupe_erase_single_and_all() {
        let mut fx = Fixture::new();
        let header = fx.header.clone();
        let (mut io, fl) = fx.split();
        let hints = AllocHints::default();

        let mut table = 0;
        for name in [b"a".as_slice(), b"b", b"c"] {
            let (t, _) = dupe_insert(
                &mut io, fl, &header, table, &[],
                &Record::new(name), 0, InsertFlags::DUPLICATE_INSERT_LAST, None, &hints,
            ).unwrap();
            table = t;
        }

        let table = dupe_erase(&mut io, fl, &header, table, 1, false, &hints).unwrap();
        assert_ne!(table, 0);
        let records: Vec<Vec<u8>> = dupe_get_all(&mut io, table)
            .unwrap()
            .iter()
            .map(|e| e.read_record(&mut io, None).unwrap().data)
            .collect();
        assert_eq!(records, vec![b"a".to_vec(), b"c".to_vec()]);

        let table = dupe_erase(&mut io, fl, &header, table, 0, true, &hints).unwrap();
        assert_eq!(table, 0);
    }

    #[test]
    fn test_sorted_dupes_reject_partial() {
        let mut fx = Fixture::new();
        let header = fx.header.clone();
        let (mut io, fl) = fx.split();
        let cmp: RecordCompare<'_> = &|a, b| a.cmp(b);

        let err = dupe_insert(
            &mut io, fl, &header, 0, &[],
            &Record::partial(b"x", 0, 1), 0,
            InsertFlags::PARTIAL, Some(cmp), &AllocHints::default(),
        ).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParameter);
    }

    #[test]
    fn test_sorted_dupe_placement() {
        let mut fx = Fixture::new();
        let header = fx.header.clone();
        let (mut io, fl) = fx.split();
        let hints = AllocHints::default();
        let cmp: RecordCompare<'_> = &|a, b| a.cmp(b);

        let mut table = 0;
        for name in [b"m".as_slice(), b"a", b"z", b"k"] {
            let (t, _) = dupe_insert(
                &mut io, fl, &header, table, &[],
                &Record::new(name), 0, InsertFlags::DUPLICATE, Some(cmp), &hints,
            ).unwrap();
            table = t;
        }

        let records: Vec<Vec<u8>> = dupe_get_all(&mut io, table)
            .unwrap()
            .iter()
            .map(|e| e.read_record(&mut io, None).unwrap().data)
            .collect();
        assert_eq!(
            records,
            vec![b"a".to_vec(), b"k".to_vec(), b"m".to_vec(), b"z".to_vec()]
        );
    }
}
