//! Key handling: comparators and the record side of key slots.
//!
//! A key record either points at an out-of-line blob, carries its record
//! inline (tiny/small/empty), or points at a duplicate table. The functions
//! here move a slot between those states; the B+tree proper never touches
//! record storage directly.

use std::cmp::Ordering;

use crate::error::{Error, ErrorCode, Result};
use crate::storage::blob;
use crate::storage::page::{PageRef, PageType};
use crate::types::{DbFlags, EraseFlags, InsertFlags, Record};

use super::node;
use super::TreeOp;

// ============================================================================
// Comparators
// ============================================================================

/// Full-key comparator.
pub trait KeyCompare {
    /// Three-way comparison of two complete keys.
    fn compare(&self, lhs: &[u8], rhs: &[u8]) -> Ordering;
}

/// Default comparator: lexicographic byte order.
pub struct LexicalCompare;

impl KeyCompare for LexicalCompare {
    fn compare(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        lhs.cmp(rhs)
    }
}

/// Record-number comparator: host-endian numeric order over the
/// little-endian persisted form.
pub struct RecnoCompare;

impl KeyCompare for RecnoCompare {
    fn compare(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        let decode = |b: &[u8]| -> u64 {
            let mut buf = [0u8; 8];
            let n = b.len().min(8);
            buf[..n].copy_from_slice(&b[..n]);
            u64::from_le_bytes(buf)
        };
        decode(lhs).cmp(&decode(rhs))
    }
}

/// Prefix comparator, consulted before an extended key is materialized.
pub trait PrefixCompare {
    /// Compare a search key against the inline prefix of a stored key.
    /// `None` requests the full key.
    fn compare_prefix(
        &self,
        lhs: &[u8],
        rhs_prefix: &[u8],
        rhs_total: usize,
    ) -> Option<Ordering>;
}

/// Record ordering for sorted duplicates.
pub type RecordOrder<'c> = &'c dyn Fn(&[u8], &[u8]) -> Ordering;

// ============================================================================
// Key Materialization and Comparison
// ============================================================================

impl TreeOp<'_> {
    /// Materialize the complete key bytes at a slot.
    pub fn full_key(&mut self, page: &PageRef, slot: usize) -> Result<Vec<u8>> {
        let (inline, size, flags, ext_rid) = {
            let p = page.borrow();
            let payload = p.payload();
            let layout = &self.index.layout;
            (
                node::key_inline(payload, layout, slot).to_vec(),
                node::key_size(payload, layout, slot),
                node::key_flags(payload, layout, slot),
                node::key_extended_rid(payload, layout, slot),
            )
        };
        if flags & node::KEY_FLAG_EXTENDED == 0 {
            if size > inline.len() {
                return Err(Error::with_message(
                    ErrorCode::IntegrityViolated,
                    format!("slot {} claims {} key bytes in a {}-byte slot", slot, size, inline.len()),
                ));
            }
            return Ok(inline[..size].to_vec());
        }
        let full = self.extkeys.fetch(&mut self.io, ext_rid)?;
        if full.len() != size {
            return Err(Error::with_message(
                ErrorCode::IntegrityViolated,
                format!("extended key at {:#x} has size {}, slot says {}", ext_rid, full.len(), size),
            ));
        }
        Ok(full)
    }

    /// Compare a search key against the key stored at a slot.
    pub fn compare_to_slot(
        &mut self,
        key: &[u8],
        page: &PageRef,
        slot: usize,
    ) -> Result<Ordering> {
        let (flags, size) = {
            let p = page.borrow();
            let payload = p.payload();
            let layout = &self.index.layout;
            (
                node::key_flags(payload, layout, slot),
                node::key_size(payload, layout, slot),
            )
        };

        if flags & node::KEY_FLAG_EXTENDED == 0 {
            let p = page.borrow();
            let inline = node::key_inline(p.payload(), &self.index.layout, slot);
            if size > inline.len() {
                return Err(Error::with_message(
                    ErrorCode::IntegrityViolated,
                    format!("slot {} claims {} key bytes in a {}-byte slot", slot, size, inline.len()),
                ));
            }
            return Ok(self.cmp.compare(key, &inline[..size]));
        }

        if let Some(prefix_cmp) = self.prefix_cmp {
            let p = page.borrow();
            let inline = node::key_inline(p.payload(), &self.index.layout, slot);
            let prefix_len = self.index.layout.keysize as usize - 8;
            if let Some(ord) = prefix_cmp.compare_prefix(key, &inline[..prefix_len], size) {
                return Ok(ord);
            }
        }

        let full = self.full_key(page, slot)?;
        Ok(self.cmp.compare(key, &full))
    }

    // ------------------------------------------------------------------
    // Writing key bytes
    // ------------------------------------------------------------------

    /// Write key bytes into a slot, spilling to an extkey blob when they
    /// exceed the inline width. Record flags and rid are preserved.
    pub fn write_key_bytes(&mut self, page: &PageRef, slot: usize, key: &[u8]) -> Result<()> {
        let keysize = self.index.layout.keysize as usize;
        if key.len() > u16::MAX as usize {
            return Err(Error::new(ErrorCode::InvalidKeysize));
        }
        if key.len() > keysize && self.db_flags.contains(DbFlags::DISABLE_VARIABLE_KEYS) {
            return Err(Error::new(ErrorCode::InvalidKeysize));
        }

        self.io.make_dirty(page)?;
        if key.len() <= keysize {
            let mut p = page.borrow_mut();
            let layout = self.index.layout;
            node::set_key_size(p.payload_mut(), &layout, slot, key.len());
            let flags = node::key_flags(p.payload(), &layout, slot) & !node::KEY_FLAG_EXTENDED;
            node::set_key_flags(p.payload_mut(), &layout, slot, flags);
            let inline = node::key_inline_mut(p.payload_mut(), &layout, slot);
            inline[..key.len()].copy_from_slice(key);
            inline[key.len()..].fill(0);
            return Ok(());
        }

        let hints = self.hints;
        let ext_rid = self
            .extkeys
            .store(&mut self.io, self.fl, self.header, key, &hints)?;
        let mut p = page.borrow_mut();
        let layout = self.index.layout;
        node::set_key_size(p.payload_mut(), &layout, slot, key.len());
        let flags = node::key_flags(p.payload(), &layout, slot) | node::KEY_FLAG_EXTENDED;
        node::set_key_flags(p.payload_mut(), &layout, slot, flags);
        let inline = node::key_inline_mut(p.payload_mut(), &layout, slot);
        inline[..keysize - 8].copy_from_slice(&key[..keysize - 8]);
        inline[keysize - 8..].copy_from_slice(&blob::rid_bytes(ext_rid));
        Ok(())
    }

    /// Release the extkey blob of a slot, if it has one. Used when a key
    /// record is dropped without its key bytes moving elsewhere.
    pub fn free_key_extkey(&mut self, page: &PageRef, slot: usize) -> Result<()> {
        let (flags, ext_rid) = {
            let p = page.borrow();
            let payload = p.payload();
            let layout = &self.index.layout;
            (
                node::key_flags(payload, layout, slot),
                node::key_extended_rid(payload, layout, slot),
            )
        };
        if flags & node::KEY_FLAG_EXTENDED != 0 {
            self.extkeys
                .free(&mut self.io, self.fl, self.header, ext_rid)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Record attachment
    // ------------------------------------------------------------------

    /// Attach or update the record of a leaf slot.
    ///
    /// Handles plain overwrite, the single-record to duplicate-table
    /// promotion, and insertion into an existing duplicate table. Returns
    /// the duplicate position of the written record.
    pub fn set_record_at(
        &mut self,
        page: &PageRef,
        slot: usize,
        record: &Record,
        position: u32,
        flags: InsertFlags,
    ) -> Result<u32> {
        let layout = self.index.layout;
        let (old_rid, old_flags) = {
            let p = page.borrow();
            (
                node::key_rid(p.payload(), &layout, slot),
                node::key_flags(p.payload(), &layout, slot),
            )
        };
        let blob_bits = old_flags & blob::BLOB_FLAG_INLINE_MASK;
        let has_dupes = old_flags & node::KEY_FLAG_HAS_DUPLICATES != 0;
        let hints = self.hints;

        self.io.make_dirty(page)?;

        if flags.contains(InsertFlags::DUPLICATE)
            && self.db_flags.contains(DbFlags::ENABLE_DUPLICATES)
        {
            let sort = self
                .db_flags
                .contains(DbFlags::SORT_DUPLICATES)
                .then_some(self.dupe_cmp)
                .flatten();
            let (table_rid, seed);
            if has_dupes {
                table_rid = blob::rid_value(&old_rid);
                seed = Vec::new();
            } else {
                // Promote the existing single record into a fresh table.
                table_rid = 0;
                seed = vec![blob::DupeEntry {
                    flags: blob_bits,
                    rid: old_rid,
                }];
            }
            let (new_table, pos) = blob::dupe_insert(
                &mut self.io,
                self.fl,
                self.header,
                table_rid,
                &seed,
                record,
                position,
                flags,
                sort,
                &hints,
            )?;
            let mut p = page.borrow_mut();
            node::set_key_rid(p.payload_mut(), &layout, slot, &blob::rid_bytes(new_table));
            let new_flags = (old_flags & !blob::BLOB_FLAG_INLINE_MASK)
                | node::KEY_FLAG_HAS_DUPLICATES;
            node::set_key_flags(p.payload_mut(), &layout, slot, new_flags);
            return Ok(pos);
        }

        if has_dupes {
            // Overwrite one entry of the duplicate table: drop the old
            // entry, insert the new record at the same position. Partial
            // overwrites merge into the old bytes first.
            let table_rid = blob::rid_value(&old_rid);
            let (record, flags) = if flags.contains(InsertFlags::PARTIAL) {
                let entry = blob::dupe_get(&mut self.io, table_rid, position)?;
                let old = entry.read_record(&mut self.io, None)?;
                let end = record.partial_offset as usize + record.partial_size as usize;
                let mut merged = old.data;
                merged.resize(merged.len().max(end), 0);
                merged[record.partial_offset as usize..end].copy_from_slice(&record.data);
                (Record::new(&merged), flags & !InsertFlags::PARTIAL)
            } else {
                (record.clone(), flags)
            };
            let table =
                blob::dupe_erase(&mut self.io, self.fl, self.header, table_rid, position, false, &hints)?;
            let (new_table, pos) = if table == 0 {
                blob::dupe_insert(
                    &mut self.io, self.fl, self.header, 0, &[],
                    &record, 0, InsertFlags::DUPLICATE_INSERT_FIRST, None, &hints,
                )?
            } else {
                blob::dupe_insert(
                    &mut self.io, self.fl, self.header, table, &[],
                    &record, position, flags | InsertFlags::DUPLICATE_INSERT_BEFORE, None, &hints,
                )?
            };
            let mut p = page.borrow_mut();
            node::set_key_rid(p.payload_mut(), &layout, slot, &blob::rid_bytes(new_table));
            return Ok(pos);
        }

        // Plain store or overwrite of a single record.
        let (rid, rflags) = if blob_bits != 0 || blob::rid_value(&old_rid) != 0 {
            blob::overwrite(
                &mut self.io,
                self.fl,
                self.header,
                &old_rid,
                blob_bits,
                record,
                flags,
                PageType::Blob,
                &hints,
            )?
        } else {
            blob::allocate(
                &mut self.io,
                self.fl,
                self.header,
                record,
                flags,
                PageType::Blob,
                &hints,
            )?
        };

        let mut p = page.borrow_mut();
        node::set_key_rid(p.payload_mut(), &layout, slot, &rid);
        let new_flags = (old_flags & !blob::BLOB_FLAG_INLINE_MASK) | rflags;
        node::set_key_flags(p.payload_mut(), &layout, slot, new_flags);
        Ok(0)
    }

    /// Detach a record (or all records) from a leaf slot. Returns true when
    /// the slot has no records left and the key must be removed.
    pub fn erase_record_at(
        &mut self,
        page: &PageRef,
        slot: usize,
        dup_id: u32,
        flags: EraseFlags,
    ) -> Result<bool> {
        let layout = self.index.layout;
        let (rid, kflags) = {
            let p = page.borrow();
            (
                node::key_rid(p.payload(), &layout, slot),
                node::key_flags(p.payload(), &layout, slot),
            )
        };
        let hints = self.hints;
        self.io.make_dirty(page)?;

        if kflags & node::KEY_FLAG_HAS_DUPLICATES != 0 {
            let table_rid = blob::rid_value(&rid);
            let all = flags.contains(EraseFlags::ERASE_ALL_DUPLICATES);
            let new_table = blob::dupe_erase(
                &mut self.io,
                self.fl,
                self.header,
                table_rid,
                dup_id,
                all,
                &hints,
            )?;
            if new_table == 0 {
                return Ok(true);
            }
            let mut p = page.borrow_mut();
            node::set_key_rid(p.payload_mut(), &layout, slot, &blob::rid_bytes(new_table));
            return Ok(false);
        }

        blob::free(
            &mut self.io,
            self.fl,
            self.header,
            &rid,
            kflags & blob::BLOB_FLAG_INLINE_MASK,
        )?;
        Ok(true)
    }

    /// Read the record of a leaf slot, honoring duplicates and partial
    /// windows.
    pub fn read_record_at(
        &mut self,
        page: &PageRef,
        slot: usize,
        dup_id: u32,
        partial: Option<(u32, u32)>,
    ) -> Result<Record> {
        let layout = self.index.layout;
        let (rid, kflags) = {
            let p = page.borrow();
            (
                node::key_rid(p.payload(), &layout, slot),
                node::key_flags(p.payload(), &layout, slot),
            )
        };
        if kflags & node::KEY_FLAG_HAS_DUPLICATES != 0 {
            let entry = blob::dupe_get(&mut self.io, blob::rid_value(&rid), dup_id)?;
            return entry.read_record(&mut self.io, partial);
        }
        blob::read(&mut self.io, &rid, kflags & blob::BLOB_FLAG_INLINE_MASK, partial)
    }

    /// Number of records attached to a leaf slot.
    pub fn record_count_at(&mut self, page: &PageRef, slot: usize) -> Result<u32> {
        let layout = self.index.layout;
        let (rid, kflags) = {
            let p = page.borrow();
            (
                node::key_rid(p.payload(), &layout, slot),
                node::key_flags(p.payload(), &layout, slot),
            )
        };
        if kflags & node::KEY_FLAG_HAS_DUPLICATES != 0 {
            blob::dupe_count(&mut self.io, blob::rid_value(&rid))
        } else {
            Ok(1)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
