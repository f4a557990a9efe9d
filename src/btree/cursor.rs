//! Tree cursors.
//!
//! A cursor is *coupled* (standing on a leaf slot plus a duplicate id),
//! *uncoupled* (holding a private copy of its key after the tree changed
//! under it), or *nil*. Structural operations uncouple every affected
//! cursor; movement re-couples on demand by searching for the saved key.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, ErrorCode, Result};
use crate::storage::page::PageRef;
use crate::types::{CursorFlags, FindFlags, Record, Rid};

use super::node;
use super::TreeOp;

// ============================================================================
// Cursor State
// ============================================================================

/// Where a cursor stands.
#[derive(Debug, Clone)]
pub enum CursorPos {
    /// Not positioned.
    Nil,
    /// Standing on a leaf slot.
    Coupled {
        /// Leaf page address.
        page: Rid,
        /// Slot within the leaf.
        slot: usize,
    },
    /// Detached, holding a copy of the current key.
    Uncoupled {
        /// The saved key.
        key: Vec<u8>,
    },
}

/// Shared cursor state; the tree holds weak references for uncoupling.
#[derive(Debug)]
pub struct CursorState {
    /// Position.
    pub pos: CursorPos,
    /// Duplicate id within the current key.
    pub dup_id: u32,
}

impl CursorState {
    /// A fresh, unpositioned cursor state.
    pub fn new() -> Rc<RefCell<CursorState>> {
        Rc::new(RefCell::new(CursorState {
            pos: CursorPos::Nil,
            dup_id: 0,
        }))
    }
}

impl TreeOp<'_> {
    /// Re-couple a cursor to a live leaf slot. Returns the page, the slot,
    /// and whether re-coupling already moved past the saved key (because
    /// it was erased).
    fn resolve_position(
        &mut self,
        state: &Rc<RefCell<CursorState>>,
    ) -> Result<(PageRef, usize, bool)> {
        let pos = state.borrow().pos.clone();
        match pos {
            CursorPos::Nil => Err(Error::with_message(
                ErrorCode::InvalidParameter,
                "cursor is not positioned",
            )),
            CursorPos::Coupled { page, slot } => Ok((self.fetch_node(page)?, slot, false)),
            CursorPos::Uncoupled { key } => {
                let found = self
                    .locate(&key, FindFlags::GEQ_MATCH)?
                    .ok_or_else(|| Error::new(ErrorCode::KeyNotFound))?;
                let moved = !found.approx.is_empty();
                let mut s = state.borrow_mut();
                s.pos = CursorPos::Coupled {
                    page: found.page.borrow().address(),
                    slot: found.slot,
                };
                if moved {
                    s.dup_id = 0;
                }
                Ok((found.page, found.slot, moved))
            }
        }
    }

    fn couple_to(&mut self, state: &Rc<RefCell<CursorState>>, page: &PageRef, slot: usize, dup: u32) {
        let mut s = state.borrow_mut();
        s.pos = CursorPos::Coupled {
            page: page.borrow().address(),
            slot,
        };
        s.dup_id = dup;
    }

    /// Current key and record of a coupled cursor.
    pub fn cursor_read(
        &mut self,
        state: &Rc<RefCell<CursorState>>,
        partial: Option<(u32, u32)>,
    ) -> Result<(Vec<u8>, Record)> {
        let (page, slot, _) = self.resolve_position(state)?;
        let dup = state.borrow().dup_id;
        let key = self.full_key(&page, slot)?;
        let record = self.read_record_at(&page, slot, dup, partial)?;
        Ok((key, record))
    }

    /// Position a cursor by key lookup.
    pub fn cursor_find(
        &mut self,
        state: &Rc<RefCell<CursorState>>,
        key: &[u8],
        flags: FindFlags,
    ) -> Result<(Vec<u8>, Record)> {
        let found = self
            .locate(key, flags)?
            .ok_or_else(|| Error::new(ErrorCode::KeyNotFound))?;
        self.couple_to(state, &found.page, found.slot, 0);
        self.cursor_read(state, None)
    }

    /// Move a cursor and return the key/record it lands on.
    pub fn cursor_move(
        &mut self,
        state: &Rc<RefCell<CursorState>>,
        flags: CursorFlags,
    ) -> Result<(Vec<u8>, Record)> {
        if flags.contains(CursorFlags::FIRST) {
            let leaf = self.edge_leaf(false)?;
            if node::node_count(leaf.borrow().payload()) == 0 {
                return Err(Error::new(ErrorCode::KeyNotFound));
            }
            self.couple_to(state, &leaf, 0, 0);
            return self.cursor_read(state, None);
        }

        if flags.contains(CursorFlags::LAST) {
            let leaf = self.edge_leaf(true)?;
            let count = node::node_count(leaf.borrow().payload());
            if count == 0 {
                return Err(Error::new(ErrorCode::KeyNotFound));
            }
            let dups = self.record_count_at(&leaf, count - 1)?;
            self.couple_to(state, &leaf, count - 1, dups.saturating_sub(1));
            return self.cursor_read(state, None);
        }

        if flags.contains(CursorFlags::NEXT) {
            return self.cursor_step(state, flags, true);
        }
        if flags.contains(CursorFlags::PREVIOUS) {
            return self.cursor_step(state, flags, false);
        }
        Err(Error::new(ErrorCode::InvalidParameter))
    }

    fn cursor_step(
        &mut self,
        state: &Rc<RefCell<CursorState>>,
        flags: CursorFlags,
        forward: bool,
    ) -> Result<(Vec<u8>, Record)> {
        let (page, slot, moved) = self.resolve_position(state)?;

        // Re-coupling past an erased key already performed the forward
        // step; backward movement still has to step from here.
        if moved && forward {
            if flags.contains(CursorFlags::ONLY_DUPLICATES) {
                return Err(Error::new(ErrorCode::KeyNotFound));
            }
            return self.cursor_read(state, None);
        }

        let dup = state.borrow().dup_id;
        let within_dupes = !flags.contains(CursorFlags::SKIP_DUPLICATES);

        if within_dupes {
            let dups = self.record_count_at(&page, slot)?;
            if forward && dup + 1 < dups {
                self.couple_to(state, &page, slot, dup + 1);
                return self.cursor_read(state, None);
            }
            if !forward && dup > 0 {
                self.couple_to(state, &page, slot, dup - 1);
                return self.cursor_read(state, None);
            }
        }
        if flags.contains(CursorFlags::ONLY_DUPLICATES) {
            return Err(Error::new(ErrorCode::KeyNotFound));
        }

        // Step to the neighbouring key, crossing the sibling link at the
        // node edge.
        let count = node::node_count(page.borrow().payload());
        let (next_page, next_slot) = if forward {
            if slot + 1 < count {
                (page, slot + 1)
            } else {
                let sibling = node::node_right_sibling(page.borrow().payload());
                if sibling == 0 {
                    return Err(Error::new(ErrorCode::KeyNotFound));
                }
                let next = self.fetch_node(sibling)?;
                if node::node_count(next.borrow().payload()) == 0 {
                    return Err(Error::new(ErrorCode::KeyNotFound));
                }
                (next, 0)
            }
        } else if slot > 0 {
            (page, slot - 1)
        } else {
            let sibling = node::node_left_sibling(page.borrow().payload());
            if sibling == 0 {
                return Err(Error::new(ErrorCode::KeyNotFound));
            }
            let next = self.fetch_node(sibling)?;
            let ncount = node::node_count(next.borrow().payload());
            if ncount == 0 {
                return Err(Error::new(ErrorCode::KeyNotFound));
            }
            (next, ncount - 1)
        };

        // Landing on a new key: forward starts at its first duplicate,
        // backward at its last.
        let dup = if forward || flags.contains(CursorFlags::SKIP_DUPLICATES) {
            0
        } else {
            self.record_count_at(&next_page, next_slot)?.saturating_sub(1)
        };
        self.couple_to(state, &next_page, next_slot, dup);
        self.cursor_read(state, None)
    }

    /// Number of duplicates at the cursor position.
    pub fn cursor_dupe_count(&mut self, state: &Rc<RefCell<CursorState>>) -> Result<u32> {
        let (page, slot, _) = self.resolve_position(state)?;
        self.record_count_at(&page, slot)
    }

    /// Replace the record under the cursor without moving it.
    pub fn cursor_overwrite(
        &mut self,
        state: &Rc<RefCell<CursorState>>,
        record: &Record,
    ) -> Result<()> {
        let (page, slot, _) = self.resolve_position(state)?;
        let dup = state.borrow().dup_id;
        self.set_record_at(&page, slot, record, dup, crate::types::InsertFlags::OVERWRITE)?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
