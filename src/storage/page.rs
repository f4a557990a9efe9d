//! Pages: the fixed-size unit of I/O and caching.
//!
//! A page carries a 12-byte persisted header (`flags:u32, reserved:u64`)
//! followed by the typed payload. The flags word encodes the page type in
//! its low byte; everything else about a page (dirty marker, owner, ref
//! counting, insert statistics) is in-memory only.

use std::cell::RefCell;
use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, ErrorCode, Result};
use crate::types::{DbName, Lsn, Rid, TxnId};

// ============================================================================
// Constants
// ============================================================================

/// Size of the persisted page header.
pub const PAGE_HEADER_SIZE: usize = 12;

/// Marker in byte 2 of the flags word: freelist page in the v2 format.
pub const PAGE_FREELIST_V2_MARKER: u32 = 0x00F2_0000;

/// Sentinel transaction id for pages dirtied outside a transaction.
pub const DIRTY_NO_TXN: TxnId = TxnId::MAX;

// ============================================================================
// Page Type
// ============================================================================

/// Page type, persisted in the low byte of the page flags word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// The environment header page at address 0
    Header = 0x01,
    /// Root node of a B+tree
    BtreeRoot = 0x02,
    /// Interior or leaf node of a B+tree
    BtreeIndex = 0x04,
    /// Freelist bitmap page
    Freelist = 0x08,
    /// First page of a blob extent
    Blob = 0x10,
    /// Duplicate-table blob
    DupeTable = 0x20,
    /// Extended-key blob
    Extkey = 0x40,
    /// Raw record data
    RecordData = 0x80,
}

impl PageType {
    /// Decode the type from a flags word. `None` for untyped pages, e.g.
    /// blob continuation pages.
    pub fn from_flags(flags: u32) -> Option<PageType> {
        match flags as u8 {
            0x01 => Some(PageType::Header),
            0x02 => Some(PageType::BtreeRoot),
            0x04 => Some(PageType::BtreeIndex),
            0x08 => Some(PageType::Freelist),
            0x10 => Some(PageType::Blob),
            0x20 => Some(PageType::DupeTable),
            0x40 => Some(PageType::Extkey),
            0x80 => Some(PageType::RecordData),
            _ => None,
        }
    }
}

// ============================================================================
// Insert Statistics
// ============================================================================

/// Where inserts land within a node, kept as an exponential moving average
/// of the relative position (`[-1, +1]` in Q15) plus a chi-square-like
/// accumulator of squared deviations. The B+tree uses both to pick split
/// points: a tight cluster of recent inserts pulls the split point toward
/// the cluster, a noisy history falls back to the midpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertStats {
    /// EMA of the relative insert offset, Q15 fixed point.
    pub ema_q15: i32,
    /// Accumulated squared deviation from the EMA, Q15 units.
    pub chi_acc: u64,
    /// Number of samples folded in.
    pub samples: u32,
}

impl InsertStats {
    /// Fold in one insert/erase at `slot` of a node holding `count` keys.
    pub fn record(&mut self, slot: usize, count: usize) {
        if count == 0 {
            return;
        }
        let rel = ((2 * slot as i64 - count as i64) * 32767 / count as i64) as i32;
        let rel = rel.clamp(-32767, 32767);
        let delta = rel - self.ema_q15;
        // EMA with 1/8 weight.
        self.ema_q15 += delta / 8;
        self.chi_acc += (delta as i64 * delta as i64) as u64 >> 15;
        self.samples = self.samples.saturating_add(1);
    }

    /// True once the history is long and tight enough to trust.
    pub fn is_reliable(&self) -> bool {
        if self.samples < 8 {
            return false;
        }
        // Mean squared deviation above ~ (0.5)^2 in Q15 means the inserts
        // are scattered; the midpoint is the better split point then.
        let mean_chi = self.chi_acc / self.samples as u64;
        mean_chi < 8192
    }

    /// Pick the split slot for a node holding `count` keys.
    pub fn hinted_split_slot(&self, count: usize) -> usize {
        let mid = count / 2;
        if !self.is_reliable() {
            return mid;
        }
        // Pull the split toward the insert cluster, clamped to the middle
        // half so both halves stay above the fill minimum.
        let bias = (self.ema_q15 as i64 * (count as i64 / 4)) / 32767;
        let slot = (mid as i64 + bias) as usize;
        slot.clamp(count / 4, (count * 3) / 4)
    }
}

// ============================================================================
// Page
// ============================================================================

/// An in-memory page.
#[derive(Debug)]
pub struct Page {
    /// Byte address of this page in the file; also its cache key.
    address: Rid,
    /// Full page image including the persisted header.
    data: Vec<u8>,
    /// Name of the database that last used this page, 0 if none.
    owner: DbName,
    /// Dirty marker: id of the dirtying transaction, [`DIRTY_NO_TXN`] for
    /// non-transactional dirtying, `None` when clean.
    dirty_txn: Option<TxnId>,
    /// LSN of the most recent before-image written for this page.
    before_img_lsn: Lsn,
    /// Cache bookkeeping: monotonically increasing insertion counter.
    pub(crate) cache_counter: u64,
    /// Cache bookkeeping: hit frequency.
    pub(crate) cache_hits: u64,
    /// Insert-position statistics for split hinting.
    pub stats: InsertStats,
}

/// Shared handle to a cached page. Holding one pins the page.
pub type PageRef = Rc<RefCell<Page>>;

impl Page {
    /// Fresh page of `pagesize` bytes with the given type.
    pub fn new(address: Rid, pagesize: u32, ptype: PageType) -> Self {
        let mut page = Self {
            address,
            data: vec![0u8; pagesize as usize],
            owner: 0,
            dirty_txn: None,
            before_img_lsn: 0,
            cache_counter: 0,
            cache_hits: 0,
            stats: InsertStats::default(),
        };
        page.set_type(ptype);
        page
    }

    /// Page from a raw device image.
    pub fn from_bytes(address: Rid, data: Vec<u8>) -> Self {
        Self {
            address,
            data,
            owner: 0,
            dirty_txn: None,
            before_img_lsn: 0,
            cache_counter: 0,
            cache_hits: 0,
            stats: InsertStats::default(),
        }
    }

    /// Byte address of the page.
    pub fn address(&self) -> Rid {
        self.address
    }

    /// Full page image.
    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    /// Full page image, mutable. Callers must mark the page dirty.
    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Page size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Typed payload after the persisted header.
    pub fn payload(&self) -> &[u8] {
        &self.data[PAGE_HEADER_SIZE..]
    }

    /// Typed payload, mutable.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[PAGE_HEADER_SIZE..]
    }

    /// The persisted flags word.
    pub fn flags(&self) -> u32 {
        LittleEndian::read_u32(&self.data[0..4])
    }

    /// Replace the persisted flags word.
    pub fn set_flags(&mut self, flags: u32) {
        LittleEndian::write_u32(&mut self.data[0..4], flags);
    }

    /// The page type from the flags word.
    pub fn ptype(&self) -> Option<PageType> {
        PageType::from_flags(self.flags())
    }

    /// Set the page type, preserving the other flag bits.
    pub fn set_type(&mut self, ptype: PageType) {
        let flags = (self.flags() & !0xFF) | ptype as u32;
        self.set_flags(flags);
    }

    /// Require a specific page type.
    pub fn expect_type(&self, ptype: PageType) -> Result<()> {
        if self.ptype() != Some(ptype) {
            return Err(Error::with_message(
                ErrorCode::IntegrityViolated,
                format!(
                    "page {:#x}: expected type {:?}, found flags {:#x}",
                    self.address,
                    ptype,
                    self.flags()
                ),
            ));
        }
        Ok(())
    }

    /// Database that last used this page.
    pub fn owner(&self) -> DbName {
        self.owner
    }

    /// Record the owning database.
    pub fn set_owner(&mut self, owner: DbName) {
        self.owner = owner;
    }

    /// True while the page has unwritten modifications.
    pub fn is_dirty(&self) -> bool {
        self.dirty_txn.is_some()
    }

    /// Transaction that dirtied this page, if any.
    pub fn dirty_txn(&self) -> Option<TxnId> {
        self.dirty_txn
    }

    /// Mark the page dirty on behalf of `txn_id` ([`DIRTY_NO_TXN`] outside
    /// transactions).
    pub fn set_dirty(&mut self, txn_id: TxnId) {
        self.dirty_txn = Some(txn_id);
    }

    /// Clear the dirty marker after a flush.
    pub fn set_clean(&mut self) {
        self.dirty_txn = None;
    }

    /// LSN of the most recent before-image.
    pub fn before_img_lsn(&self) -> Lsn {
        self.before_img_lsn
    }

    /// Record the LSN of a freshly written before-image.
    pub fn set_before_img_lsn(&mut self, lsn: Lsn) {
        self.before_img_lsn = lsn;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_encoding() {
        let mut page = Page::new(0x1000, 512, PageType::BtreeIndex);
        assert_eq!(page.ptype(), Some(PageType::BtreeIndex));

        page.set_type(PageType::Freelist);
        assert_eq!(page.ptype(), Some(PageType::Freelist));

        page.set_flags(page.flags() | PAGE_FREELIST_V2_MARKER);
        assert_eq!(page.ptype(), Some(PageType::Freelist));
        assert_ne!(page.flags() & PAGE_FREELIST_V2_MARKER, 0);
    }

    #[test]
    fn test_untyped_page() {
        let page = Page::from_bytes(0x2000, vec![0u8; 512]);
        assert_eq!(page.ptype(), None);
        assert!(page.expect_type(PageType::Blob).is_err());
    }

    #[test]
    fn test_dirty_bookkeeping() {
        let mut page = Page::new(0x1000, 512, PageType::Blob);
        assert!(!page.is_dirty());

        page.set_dirty(7);
        assert!(page.is_dirty());
        assert_eq!(page.dirty_txn(), Some(7));

        page.set_clean();
        assert!(!page.is_dirty());
    }

    #[test]
    fn test_split_hint_midpoint_when_unreliable() {
        let stats = InsertStats::default();
        assert_eq!(stats.hinted_split_slot(100), 50);
    }

    #[test]
    fn test_split_hint_follows_append_cluster() {
        let mut stats = InsertStats::default();
        // Repeated appends at the right edge.
        for _ in 0..64 {
            stats.record(99, 100);
        }
        assert!(stats.is_reliable());
        let slot = stats.hinted_split_slot(100);
        assert!(slot > 50, "append-heavy stats should split late, got {}", slot);
        assert!(slot <= 75);
    }

    #[test]
    fn test_split_hint_scattered_stays_midpoint() {
        let mut stats = InsertStats::default();
        for i in 0..64 {
            // Alternate both edges: high variance, EMA near zero.
            stats.record(if i % 2 == 0 { 0 } else { 99 }, 100);
        }
        assert_eq!(stats.hinted_split_slot(100), 50);
    }
}
