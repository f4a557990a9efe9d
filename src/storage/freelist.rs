//! Freelist: chunk-granular space management.
//!
//! Free space is tracked in bitmaps at a 32-byte chunk granularity. The
//! first bitmap is embedded in the tail of the environment header page;
//! overflow bitmaps live in dedicated freelist pages chained through an
//! `overflow` rid. A set bit means the chunk is free.
//!
//! Two persisted formats exist. The legacy v1 format is a bare bitmap with
//! a small header; the default v2 format embeds per-page allocation
//! statistics which the hinter uses to start searches where a size class
//! was served before, instead of scanning from the front every time.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, ErrorCode, Result};
use crate::types::{Dam, DbName, Rid, CHUNK_SIZE};

use super::page::{PageRef, PageType, PAGE_FREELIST_V2_MARKER, PAGE_HEADER_SIZE};
use super::PageIo;

// ============================================================================
// Constants
// ============================================================================

/// Smallest size class: log2(32).
pub const SIZE_CLASS_MIN_LOG2: u32 = 5;

/// Largest size class: log2(64 KiB).
pub const SIZE_CLASS_MAX_LOG2: u32 = 16;

/// Number of size classes tracked per freelist page.
pub const SIZE_CLASS_COUNT: usize = (SIZE_CLASS_MAX_LOG2 - SIZE_CLASS_MIN_LOG2 + 1) as usize;

/// v1 payload header: overflow(8) + max_bits(2) + allocated_bits(2) + start(8).
const V1_HEADER_SIZE: usize = 20;

/// v2 payload header: overflow(8) + start(8) + max_bits(4) + allocated_bits(4)
/// + freed_chunks(4) + scans(4) + class stats.
const V2_HEADER_SIZE: usize = 32 + SIZE_CLASS_COUNT * CLASS_STATS_SIZE;

/// Persisted size of one per-class statistics record.
const CLASS_STATS_SIZE: usize = 28;

/// Map an allocation size in bytes onto its size class (ceil of log2).
fn size_class(size: u64) -> usize {
    let size = size.max(1);
    let log2 = if size.is_power_of_two() {
        size.trailing_zeros()
    } else {
        64 - size.leading_zeros()
    };
    (log2.clamp(SIZE_CLASS_MIN_LOG2, SIZE_CLASS_MAX_LOG2) - SIZE_CLASS_MIN_LOG2) as usize
}

// ============================================================================
// Statistics
// ============================================================================

/// Per-size-class allocation history of one freelist page.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassStats {
    /// Free runs of this class handed to this page, lifetime.
    pub count: u32,
    /// Successful allocations of this class from this page.
    pub allocs: u32,
    /// Searches of this class that came up empty here.
    pub fails: u32,
    /// Searches that succeeded at or near the hinted offset.
    pub hits: u32,
    /// First bit known (or last known) to start a free run of this class.
    pub first_free: u32,
    /// Bit of the most recent allocation of this class.
    pub last_alloc: u32,
    /// EMA of allocation bit offsets, for the hinter.
    pub ema: u32,
}

/// Per-page statistics block of a v2 freelist page.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageStats {
    /// Chunks ever freed into this page.
    pub freed_chunks: u32,
    /// Bitmap searches performed on this page.
    pub scans: u32,
    /// Per-size-class history.
    pub classes: [ClassStats; SIZE_CLASS_COUNT],
}

impl PageStats {
    fn read(buf: &[u8]) -> Self {
        let mut stats = PageStats {
            freed_chunks: LittleEndian::read_u32(&buf[0..4]),
            scans: LittleEndian::read_u32(&buf[4..8]),
            classes: [ClassStats::default(); SIZE_CLASS_COUNT],
        };
        for (i, class) in stats.classes.iter_mut().enumerate() {
            let b = &buf[8 + i * CLASS_STATS_SIZE..];
            class.count = LittleEndian::read_u32(&b[0..4]);
            class.allocs = LittleEndian::read_u32(&b[4..8]);
            class.fails = LittleEndian::read_u32(&b[8..12]);
            class.hits = LittleEndian::read_u32(&b[12..16]);
            class.first_free = LittleEndian::read_u32(&b[16..20]);
            class.last_alloc = LittleEndian::read_u32(&b[20..24]);
            class.ema = LittleEndian::read_u32(&b[24..28]);
        }
        stats
    }

    fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.freed_chunks);
        LittleEndian::write_u32(&mut buf[4..8], self.scans);
        for (i, class) in self.classes.iter().enumerate() {
            let b = &mut buf[8 + i * CLASS_STATS_SIZE..];
            LittleEndian::write_u32(&mut b[0..4], class.count);
            LittleEndian::write_u32(&mut b[4..8], class.allocs);
            LittleEndian::write_u32(&mut b[8..12], class.fails);
            LittleEndian::write_u32(&mut b[12..16], class.hits);
            LittleEndian::write_u32(&mut b[16..20], class.first_free);
            LittleEndian::write_u32(&mut b[20..24], class.last_alloc);
            LittleEndian::write_u32(&mut b[24..28], class.ema);
        }
    }
}

// ============================================================================
// Allocation Hints
// ============================================================================

/// Hints passed down with every allocation request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocHints {
    /// Data-access-mode of the requesting database.
    pub dam: Dam,
    /// Allocate at or above this address.
    pub lower_bound: Rid,
    /// The requesting database, for tracing.
    pub db: DbName,
    /// The result must be page-aligned.
    pub page_aligned: bool,
}

// ============================================================================
// Freelist
// ============================================================================

/// One bitmap in the chain.
struct Entry {
    /// Address of the freelist page; 0 for the bitmap embedded in the
    /// environment header page.
    page_id: Rid,
    /// First byte covered by this bitmap.
    start: Rid,
    /// Bitmap capacity in bits.
    max_bits: u32,
    /// Bits currently initialized (equals capacity for pages this crate
    /// writes; older files may carry less).
    allocated_bits: u32,
    /// Cached number of set (free) bits.
    free_bits: u32,
    /// In-memory copy of the statistics block (v2 only).
    stats: PageStats,
}

/// The environment's freelist.
pub struct Freelist {
    entries: Vec<Entry>,
    /// Write the legacy v1 format without statistics.
    v1: bool,
    /// Offset of the embedded bitmap within the header page payload.
    header_payload_offset: usize,
}

impl Freelist {
    /// Create an empty freelist handle.
    ///
    /// `header_payload_offset` is where the embedded root begins within the
    /// header page payload; `v1` selects the legacy persisted format.
    pub fn new(header_payload_offset: usize, v1: bool) -> Self {
        Self {
            entries: Vec::new(),
            v1,
            header_payload_offset,
        }
    }

    fn header_size(&self) -> usize {
        if self.v1 {
            V1_HEADER_SIZE
        } else {
            V2_HEADER_SIZE
        }
    }

    /// Bits one dedicated freelist page can manage.
    fn bits_per_page(&self, pagesize: u32) -> u32 {
        let avail = pagesize as usize - PAGE_HEADER_SIZE - self.header_size();
        let bits = (avail * 8) as u32;
        if self.v1 {
            // v1 stores bit counts in 16-bit fields.
            bits.min(u16::MAX as u32 & !7)
        } else {
            bits
        }
    }

    /// Bits the embedded root can manage.
    fn bits_embedded(&self, pagesize: u32) -> u32 {
        let avail = pagesize as usize
            - PAGE_HEADER_SIZE
            - self.header_payload_offset
            - self.header_size();
        let bits = (avail * 8) as u32;
        if self.v1 {
            bits.min(u16::MAX as u32 & !7)
        } else {
            bits
        }
    }

    /// End of the address range covered by the chain.
    pub fn coverage_end(&self) -> Rid {
        match self.entries.last() {
            Some(e) => e.start + e.max_bits as u64 * CHUNK_SIZE as u64,
            None => 0,
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn entry_page(&self, io: &mut PageIo<'_>, header: &PageRef, idx: usize) -> Result<(PageRef, usize)> {
        let entry = &self.entries[idx];
        if entry.page_id == 0 {
            Ok((header.clone(), self.header_payload_offset))
        } else {
            let page = io.fetch_typed(entry.page_id, PageType::Freelist)?;
            Ok((page, 0))
        }
    }

    fn write_entry_header(&self, io: &mut PageIo<'_>, header: &PageRef, idx: usize, overflow: Rid) -> Result<()> {
        let (page, base) = self.entry_page(io, header, idx)?;
        io.make_dirty(&page)?;
        let entry = &self.entries[idx];
        let mut p = page.borrow_mut();
        let buf = &mut p.payload_mut()[base..];
        if self.v1 {
            LittleEndian::write_u64(&mut buf[0..8], overflow);
            LittleEndian::write_u16(&mut buf[8..10], entry.max_bits as u16);
            LittleEndian::write_u16(&mut buf[10..12], entry.allocated_bits as u16);
            LittleEndian::write_u64(&mut buf[12..20], entry.start);
        } else {
            LittleEndian::write_u64(&mut buf[0..8], overflow);
            LittleEndian::write_u64(&mut buf[8..16], entry.start);
            LittleEndian::write_u32(&mut buf[16..20], entry.max_bits);
            LittleEndian::write_u32(&mut buf[20..24], entry.allocated_bits);
            entry.stats.write(&mut buf[24..]);
        }
        Ok(())
    }

    fn write_entry_stats(&self, io: &mut PageIo<'_>, header: &PageRef, idx: usize) -> Result<()> {
        if self.v1 {
            return Ok(());
        }
        let (page, base) = self.entry_page(io, header, idx)?;
        io.make_dirty(&page)?;
        let mut p = page.borrow_mut();
        self.entries[idx].stats.write(&mut p.payload_mut()[base + 24..]);
        Ok(())
    }

    fn read_entry(&self, page: &PageRef, base: usize, page_id: Rid) -> (Entry, Rid) {
        let p = page.borrow();
        let buf = &p.payload()[base..];
        if self.v1 {
            let overflow = LittleEndian::read_u64(&buf[0..8]);
            let max_bits = LittleEndian::read_u16(&buf[8..10]) as u32;
            let allocated_bits = LittleEndian::read_u16(&buf[10..12]) as u32;
            let start = LittleEndian::read_u64(&buf[12..20]);
            (
                Entry {
                    page_id,
                    start,
                    max_bits,
                    allocated_bits,
                    free_bits: 0,
                    stats: PageStats::default(),
                },
                overflow,
            )
        } else {
            let overflow = LittleEndian::read_u64(&buf[0..8]);
            let start = LittleEndian::read_u64(&buf[8..16]);
            let max_bits = LittleEndian::read_u32(&buf[16..20]);
            let allocated_bits = LittleEndian::read_u32(&buf[20..24]);
            let stats = PageStats::read(&buf[24..]);
            (
                Entry {
                    page_id,
                    start,
                    max_bits,
                    allocated_bits,
                    free_bits: 0,
                    stats,
                },
                overflow,
            )
        }
    }

    /// Initialize a fresh freelist: one embedded bitmap covering the space
    /// right after the header page, all chunks in use.
    pub fn init_new(&mut self, io: &mut PageIo<'_>, header: &PageRef) -> Result<()> {
        let pagesize = io.pagesize;
        let max_bits = self.bits_embedded(pagesize);
        self.entries.clear();
        self.entries.push(Entry {
            page_id: 0,
            start: pagesize as u64,
            max_bits,
            allocated_bits: max_bits,
            free_bits: 0,
            stats: PageStats::default(),
        });
        self.write_entry_header(io, header, 0, 0)?;
        // Zero the embedded bitmap.
        io.make_dirty(header)?;
        let hdr = self.header_size();
        let base = self.header_payload_offset;
        let mut p = header.borrow_mut();
        let bitmap = &mut p.payload_mut()[base + hdr..];
        let nbytes = (max_bits / 8) as usize;
        bitmap[..nbytes].fill(0);
        Ok(())
    }

    /// Load the chain from an opened environment.
    pub fn load(&mut self, io: &mut PageIo<'_>, header: &PageRef) -> Result<()> {
        self.entries.clear();
        let (entry, mut overflow) = self.read_entry(header, self.header_payload_offset, 0);
        self.entries.push(entry);
        while overflow != 0 {
            let page = io.fetch_typed(overflow, PageType::Freelist)?;
            let (entry, next) = self.read_entry(&page, 0, overflow);
            self.entries.push(entry);
            overflow = next;
        }
        // Rebuild the free-bit counts from the bitmaps.
        for idx in 0..self.entries.len() {
            let (page, base) = self.entry_page(io, header, idx)?;
            let hdr = self.header_size();
            let p = page.borrow();
            let bitmap = &p.payload()[base + hdr..];
            let entry = &self.entries[idx];
            let mut free = 0u32;
            for byte in bitmap.iter().take((entry.max_bits / 8) as usize) {
                free += byte.count_ones();
            }
            drop(p);
            self.entries[idx].free_bits = free;
        }
        Ok(())
    }

    /// Append one freelist page to the chain, extending coverage.
    fn grow_chain(&mut self, io: &mut PageIo<'_>, header: &PageRef) -> Result<()> {
        let pagesize = io.pagesize;
        let page = io.alloc_page_raw(PageType::Freelist)?;
        if !self.v1 {
            let mut p = page.borrow_mut();
            let flags = p.flags() | PAGE_FREELIST_V2_MARKER;
            p.set_flags(flags);
        }
        let address = page.borrow().address();
        let start = self.coverage_end();
        let max_bits = self.bits_per_page(pagesize);

        let prev_idx = self.entries.len() - 1;
        self.entries.push(Entry {
            page_id: address,
            start,
            max_bits,
            allocated_bits: max_bits,
            free_bits: 0,
            stats: PageStats::default(),
        });
        let new_idx = self.entries.len() - 1;
        self.write_entry_header(io, header, new_idx, 0)?;

        // Link the predecessor; its overflow is the only field changing.
        self.write_entry_header(io, header, prev_idx, address)?;
        tracing::trace!(address, start, max_bits, "freelist chain grown");
        Ok(())
    }

    fn overflow_of(&self, idx: usize) -> Rid {
        self.entries.get(idx + 1).map_or(0, |e| e.page_id)
    }

    /// Entry index covering `address`, growing the chain as needed.
    fn entry_covering(&mut self, io: &mut PageIo<'_>, header: &PageRef, address: Rid) -> Result<usize> {
        while address >= self.coverage_end() {
            self.grow_chain(io, header)?;
        }
        for (idx, e) in self.entries.iter().enumerate() {
            let end = e.start + e.max_bits as u64 * CHUNK_SIZE as u64;
            if address >= e.start && address < end {
                return Ok(idx);
            }
        }
        Err(Error::with_message(
            ErrorCode::IntegrityViolated,
            format!("address {:#x} below freelist coverage", address),
        ))
    }

    // ------------------------------------------------------------------
    // Bitmap primitives
    // ------------------------------------------------------------------

    fn with_bitmap<R>(
        &self,
        io: &mut PageIo<'_>,
        header: &PageRef,
        idx: usize,
        dirty: bool,
        f: impl FnOnce(&mut [u8], u32) -> R,
    ) -> Result<R> {
        let (page, base) = self.entry_page(io, header, idx)?;
        if dirty {
            io.make_dirty(&page)?;
        }
        let hdr = self.header_size();
        let max_bits = self.entries[idx].max_bits;
        let mut p = page.borrow_mut();
        let bitmap = &mut p.payload_mut()[base + hdr..];
        Ok(f(bitmap, max_bits))
    }

    fn bit_is_set(bitmap: &[u8], bit: u32) -> bool {
        bitmap[(bit / 8) as usize] & (1 << (bit % 8)) != 0
    }

    fn set_bit(bitmap: &mut [u8], bit: u32) {
        bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
    }

    fn clear_bit(bitmap: &mut [u8], bit: u32) {
        bitmap[(bit / 8) as usize] &= !(1 << (bit % 8));
    }

    /// Search `bitmap` for a run of `chunks` set bits starting at or after
    /// `from`, optionally constrained to page-aligned addresses.
    fn find_run(
        bitmap: &[u8],
        nbits: u32,
        chunks: u32,
        from: u32,
        align: Option<(Rid, u32)>,
    ) -> Option<u32> {
        if chunks == 0 || chunks > nbits {
            return None;
        }
        let mut bit = from;
        'outer: while bit + chunks <= nbits {
            // Fast-skip fully used bytes.
            if bit % 8 == 0 {
                while bit + 8 <= nbits && bitmap[(bit / 8) as usize] == 0 {
                    bit += 8;
                }
                if bit + chunks > nbits {
                    return None;
                }
            }
            if let Some((start, pagesize)) = align {
                let addr = start + bit as u64 * CHUNK_SIZE as u64;
                let misalign = addr % pagesize as u64;
                if misalign != 0 {
                    bit += ((pagesize as u64 - misalign) / CHUNK_SIZE as u64) as u32;
                    continue;
                }
            }
            for i in 0..chunks {
                if !Self::bit_is_set(bitmap, bit + i) {
                    bit = match align {
                        // Aligned searches can jump straight to the next
                        // page boundary.
                        Some((_, pagesize)) => bit + pagesize / CHUNK_SIZE,
                        None => bit + i + 1,
                    };
                    continue 'outer;
                }
            }
            return Some(bit);
        }
        None
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate `size` bytes (rounded up to whole chunks). Returns `None`
    /// when no free run is large enough; the caller then extends the file.
    pub fn alloc_area(
        &mut self,
        io: &mut PageIo<'_>,
        header: &PageRef,
        size: u64,
        hints: &AllocHints,
    ) -> Result<Option<Rid>> {
        let size = round_to_chunks(size);
        let chunks = (size / CHUNK_SIZE as u64) as u32;
        let class = size_class(size);
        let align = hints
            .page_aligned
            .then_some(io.pagesize);

        // Sequential databases append; searching the youngest bitmaps
        // first keeps their allocations near the file tail.
        let order: Vec<usize> = if hints.dam.contains(Dam::SEQUENTIAL_INSERT) {
            (0..self.entries.len()).rev().collect()
        } else {
            (0..self.entries.len()).collect()
        };

        for idx in order {
            let entry_start = self.entries[idx].start;
            let entry_end = entry_start + self.entries[idx].max_bits as u64 * CHUNK_SIZE as u64;
            if entry_end <= hints.lower_bound {
                continue;
            }
            if self.entries[idx].free_bits < chunks {
                continue;
            }

            let lower_bit = if hints.lower_bound > entry_start {
                ((hints.lower_bound - entry_start) / CHUNK_SIZE as u64) as u32
            } else {
                0
            };
            let hinted = if self.v1 {
                lower_bit
            } else {
                self.entries[idx].stats.classes[class].first_free.max(lower_bit)
            };

            let found = self.with_bitmap(io, header, idx, false, |bitmap, nbits| {
                let align = align.map(|ps| (entry_start, ps));
                let hit = Self::find_run(bitmap, nbits, chunks, hinted, align);
                match hit {
                    Some(bit) => Some((bit, true)),
                    // A failed hint widens the search to the whole bitmap.
                    None if hinted > lower_bit => {
                        Self::find_run(bitmap, nbits, chunks, lower_bit, align).map(|b| (b, false))
                    }
                    None => None,
                }
            })?;

            if !self.v1 {
                self.entries[idx].stats.scans = self.entries[idx].stats.scans.wrapping_add(1);
            }

            let Some((bit, hint_hit)) = found else {
                if !self.v1 {
                    self.entries[idx].stats.classes[class].fails += 1;
                    self.write_entry_stats(io, header, idx)?;
                }
                continue;
            };

            self.with_bitmap(io, header, idx, true, |bitmap, _| {
                for i in 0..chunks {
                    Self::clear_bit(bitmap, bit + i);
                }
            })?;
            self.entries[idx].free_bits -= chunks;

            if !self.v1 {
                let stats = &mut self.entries[idx].stats.classes[class];
                stats.allocs += 1;
                if hint_hit {
                    stats.hits += 1;
                }
                stats.last_alloc = bit;
                stats.ema = (stats.ema / 8).wrapping_mul(7).wrapping_add(bit / 8);
                stats.first_free = bit + chunks;
                self.write_entry_stats(io, header, idx)?;
            }

            let rid = entry_start + bit as u64 * CHUNK_SIZE as u64;
            tracing::trace!(rid, size, db = hints.db, "freelist allocation");
            return Ok(Some(rid));
        }
        Ok(None)
    }

    /// Allocate one page-aligned page of space.
    pub fn alloc_page(
        &mut self,
        io: &mut PageIo<'_>,
        header: &PageRef,
        hints: &AllocHints,
    ) -> Result<Option<Rid>> {
        let mut hints = *hints;
        hints.page_aligned = true;
        let size = io.pagesize as u64;
        self.alloc_area(io, header, size, &hints)
    }

    /// Return an area to the freelist.
    ///
    /// With `overwrite == true` the area must currently be allocated and the
    /// statistics are updated so a following insert can find it quickly;
    /// with `overwrite == false` double frees merge silently.
    pub fn mark_free(
        &mut self,
        io: &mut PageIo<'_>,
        header: &PageRef,
        rid: Rid,
        size: u64,
        overwrite: bool,
    ) -> Result<()> {
        if rid == 0 || rid % CHUNK_SIZE as u64 != 0 {
            return Err(Error::with_message(
                ErrorCode::InvalidParameter,
                format!("mark_free of unaligned rid {:#x}", rid),
            ));
        }
        let size = round_to_chunks(size);
        let mut remaining = (size / CHUNK_SIZE as u64) as u32;
        let mut address = rid;

        while remaining > 0 {
            let idx = self.entry_covering(io, header, address)?;
            let entry_start = self.entries[idx].start;
            let entry_bits = self.entries[idx].max_bits;
            let first_bit = ((address - entry_start) / CHUNK_SIZE as u64) as u32;
            let run = remaining.min(entry_bits - first_bit);

            let double_free = self.with_bitmap(io, header, idx, true, |bitmap, _| {
                let mut seen_free = false;
                for i in 0..run {
                    if Self::bit_is_set(bitmap, first_bit + i) {
                        seen_free = true;
                    }
                    Self::set_bit(bitmap, first_bit + i);
                }
                seen_free
            })?;
            if double_free && overwrite {
                return Err(Error::with_message(
                    ErrorCode::IntegrityViolated,
                    format!("chunk at {:#x} freed twice", address),
                ));
            }

            self.entries[idx].free_bits += run;
            if !self.v1 {
                let class = size_class(run as u64 * CHUNK_SIZE as u64);
                self.entries[idx].stats.freed_chunks += run;
                let stats = &mut self.entries[idx].stats.classes[class];
                stats.count += 1;
                if stats.first_free > first_bit || stats.count == 1 {
                    stats.first_free = first_bit;
                }
                self.write_entry_stats(io, header, idx)?;
            }

            remaining -= run;
            address += run as u64 * CHUNK_SIZE as u64;
        }
        Ok(())
    }

    /// True if the chunk at `rid` is currently free. Chunks outside the
    /// covered range count as in use.
    pub fn is_chunk_free(&self, io: &mut PageIo<'_>, header: &PageRef, rid: Rid) -> Result<bool> {
        for idx in 0..self.entries.len() {
            let e = &self.entries[idx];
            let end = e.start + e.max_bits as u64 * CHUNK_SIZE as u64;
            if rid >= e.start && rid < end {
                let bit = ((rid - e.start) / CHUNK_SIZE as u64) as u32;
                return self.with_bitmap(io, header, idx, false, |bitmap, _| {
                    Self::bit_is_set(bitmap, bit)
                });
            }
        }
        Ok(false)
    }

    /// Total free bytes tracked by the chain.
    pub fn free_bytes(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| e.free_bits as u64 * CHUNK_SIZE as u64)
            .sum()
    }

    /// Persist the overflow links of the whole chain. Called once after
    /// the chain grew, before the environment header is flushed.
    pub fn persist_links(&self, io: &mut PageIo<'_>, header: &PageRef) -> Result<()> {
        for idx in 0..self.entries.len() {
            self.write_entry_header(io, header, idx, self.overflow_of(idx))?;
        }
        Ok(())
    }
}

/// Round a byte size up to whole chunks.
pub fn round_to_chunks(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE as u64) * CHUNK_SIZE as u64
}

// ============================================================================
// Tests
// ============================================================================
