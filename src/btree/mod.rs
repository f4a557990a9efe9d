//! B+tree index backend.
//!
//! [`BtreeIndex`] is the per-database facade: root page, node geometry and
//! the cached edge leaves for append/prepend fast paths. Every operation
//! builds a [`TreeOp`] that borrows the environment's page machinery plus
//! the database's comparators, and the submodules implement search, insert,
//! erase, cursors and the integrity walk on top of it.

pub mod check;
pub mod cursor;
pub mod erase;
pub mod find;
pub mod insert;
pub mod keys;
pub mod node;

use std::cell::RefCell;
use std::rc::Weak;

use crate::error::{Error, ErrorCode, Result};
use crate::storage::freelist::{AllocHints, Freelist};
use crate::storage::extkey::ExtKeyCache;
use crate::storage::page::{Page, PageRef, PageType, PAGE_HEADER_SIZE};
use crate::storage::PageIo;
use crate::types::{DbFlags, DbName, Rid};

use cursor::CursorState;
use keys::{KeyCompare, PrefixCompare, RecordOrder};
use node::NodeLayout;

// ============================================================================
// BtreeIndex
// ============================================================================

/// Persistent and cached state of one database's B+tree.
#[derive(Debug, Clone)]
pub struct BtreeIndex {
    /// Address of the root page.
    pub root: Rid,
    /// Node geometry.
    pub layout: NodeLayout,
    /// Cached leftmost leaf for the prepend fast path.
    pub leftmost_leaf: Option<Rid>,
    /// Cached rightmost leaf for the append fast path.
    pub rightmost_leaf: Option<Rid>,
}

impl BtreeIndex {
    /// Geometry for a fresh database.
    pub fn layout_for(pagesize: u32, keysize: u16, fast_index: bool) -> Result<NodeLayout> {
        let payload = pagesize as usize - PAGE_HEADER_SIZE;
        let max_keys = NodeLayout::compute_max_keys(payload, keysize, fast_index);
        if max_keys < 4 {
            return Err(Error::with_message(
                ErrorCode::InvalidKeysize,
                format!("key size {} leaves room for only {} keys per node", keysize, max_keys),
            ));
        }
        Ok(NodeLayout {
            keysize,
            max_keys,
            fast_index,
        })
    }

    /// Drop the cached edge leaves after a structural change.
    pub fn invalidate_edge_cache(&mut self) {
        self.leftmost_leaf = None;
        self.rightmost_leaf = None;
    }
}

// ============================================================================
// TreeOp
// ============================================================================

/// One B+tree operation's view of the world.
pub struct TreeOp<'a> {
    /// Page fetch/alloc/dirty machinery.
    pub io: PageIo<'a>,
    /// The environment freelist.
    pub fl: &'a mut Freelist,
    /// The pinned environment header page.
    pub header: &'a PageRef,
    /// This database's extended-key cache.
    pub extkeys: &'a mut ExtKeyCache,
    /// This database's tree state; root updates land here.
    pub index: &'a mut BtreeIndex,
    /// Persistent database flags.
    pub db_flags: DbFlags,
    /// Name of the database, for page ownership and tracing.
    pub dbname: DbName,
    /// Full-key comparator.
    pub cmp: &'a dyn KeyCompare,
    /// Optional prefix comparator tried before materializing extended keys.
    pub prefix_cmp: Option<&'a dyn PrefixCompare>,
    /// Record comparator for sorted duplicates.
    pub dupe_cmp: Option<RecordOrder<'a>>,
    /// Allocation hints forwarded to the freelist.
    pub hints: AllocHints,
    /// Cursors bound to this database, for uncoupling.
    pub cursors: &'a [Weak<RefCell<CursorState>>],
}

impl TreeOp<'_> {
    /// Fetch a node page, accepting root or interior typing.
    pub fn fetch_node(&mut self, rid: Rid) -> Result<PageRef> {
        let page = self.io.fetch(rid)?;
        let ptype = page.borrow().ptype();
        match ptype {
            Some(PageType::BtreeRoot) | Some(PageType::BtreeIndex) => {
                page.borrow_mut().set_owner(self.dbname);
                Ok(page)
            }
            other => Err(Error::with_message(
                ErrorCode::IntegrityViolated,
                format!("page {:#x} is {:?}, expected a btree node", rid, other),
            )),
        }
    }

    /// Allocate a node page, preferring freelist space.
    pub fn alloc_node(&mut self, leaf: bool) -> Result<PageRef> {
        let page = match self.fl.alloc_page(&mut self.io, self.header, &self.hints)? {
            Some(rid) => {
                self.io.discard_page(rid)?;
                let page = std::rc::Rc::new(RefCell::new(Page::new(
                    rid,
                    self.io.pagesize,
                    PageType::BtreeIndex,
                )));
                self.io.cache.insert(page.clone())?;
                page
            }
            None => self.io.alloc_page_raw(PageType::BtreeIndex)?,
        };
        {
            let mut p = page.borrow_mut();
            p.set_owner(self.dbname);
            node::node_init(p.payload_mut(), leaf);
        }
        self.io.make_dirty(&page)?;
        Ok(page)
    }

    /// Return a node page to the freelist. The caller's handle goes stale.
    pub fn free_node(&mut self, page: &PageRef) -> Result<()> {
        let address = page.borrow().address();
        self.io.forget_page(address);
        let pagesize = self.io.pagesize as u64;
        self.fl
            .mark_free(&mut self.io, self.header, address, pagesize, false)
    }

    /// Binary-search a node. Returns the greatest slot whose key compares
    /// `<=` the search key (or -1), plus the ordering of the search key
    /// against the key at the returned slot (slot 0 when -1).
    pub fn node_search(
        &mut self,
        page: &PageRef,
        key: &[u8],
    ) -> Result<(isize, std::cmp::Ordering)> {
        use std::cmp::Ordering;

        let count = {
            let p = page.borrow();
            node::node_count(p.payload())
        };
        if count == 0 {
            return Ok((-1, Ordering::Less));
        }
        if count > self.index.layout.max_keys as usize {
            return Err(Error::with_message(
                ErrorCode::IntegrityViolated,
                format!("node {:#x} claims {} keys", page.borrow().address(), count),
            ));
        }

        let mut lo = 0isize;
        let mut hi = count as isize - 1;
        let mut slot = -1isize;
        let mut last = self.compare_to_slot(key, page, 0)?;
        if last != Ordering::Less {
            while lo <= hi {
                let mid = (lo + hi) / 2;
                let ord = self.compare_to_slot(key, page, mid as usize)?;
                match ord {
                    Ordering::Less => hi = mid - 1,
                    _ => {
                        slot = mid;
                        last = ord;
                        lo = mid + 1;
                    }
                }
            }
        }
        Ok((slot, last))
    }

    /// Child pointer to follow from an internal node for `key`.
    pub fn descend_child(&mut self, page: &PageRef, key: &[u8]) -> Result<(Rid, isize)> {
        let (slot, _) = self.node_search(page, key)?;
        let p = page.borrow();
        let rid = if slot < 0 {
            node::node_ptr_left(p.payload())
        } else {
            node::key_rid_value(p.payload(), &self.index.layout, slot as usize)
        };
        if rid == 0 {
            return Err(Error::with_message(
                ErrorCode::IntegrityViolated,
                format!("node {:#x} has a null child pointer", p.address()),
            ));
        }
        Ok((rid, slot))
    }

    /// Walk from the root to the leaf responsible for `key`, recording the
    /// descent path as `(page, child_slot)` pairs.
    pub fn descend_to_leaf(&mut self, key: &[u8]) -> Result<(PageRef, Vec<(PageRef, isize)>)> {
        let mut path = Vec::new();
        let mut page = self.fetch_node(self.index.root)?;
        loop {
            let is_leaf = {
                let p = page.borrow();
                node::node_is_leaf(p.payload())
            };
            if is_leaf {
                return Ok((page, path));
            }
            let (child, slot) = self.descend_child(&page, key)?;
            path.push((page, slot));
            page = self.fetch_node(child)?;
        }
    }

    /// Leftmost or rightmost leaf of the tree.
    pub fn edge_leaf(&mut self, rightmost: bool) -> Result<PageRef> {
        let mut page = self.fetch_node(self.index.root)?;
        loop {
            let (is_leaf, next) = {
                let p = page.borrow();
                let payload = p.payload();
                if node::node_is_leaf(payload) {
                    (true, 0)
                } else if rightmost {
                    let count = node::node_count(payload);
                    (false, node::key_rid_value(payload, &self.index.layout, count - 1))
                } else {
                    (false, node::node_ptr_left(payload))
                }
            };
            if is_leaf {
                return Ok(page);
            }
            page = self.fetch_node(next)?;
        }
    }

    /// Uncouple every cursor coupled to `page_rid`, storing a private copy
    /// of its current key. Called before a node is split, merged or freed.
    pub fn uncouple_cursors(&mut self, page_rid: Rid) -> Result<()> {
        // Collect first: materializing a key needs `self` mutably.
        let mut coupled: Vec<(std::rc::Rc<RefCell<CursorState>>, usize)> = Vec::new();
        for weak in self.cursors {
            if let Some(state) = weak.upgrade() {
                let slot = match state.borrow().pos {
                    cursor::CursorPos::Coupled { page, slot } if page == page_rid => Some(slot),
                    _ => None,
                };
                if let Some(slot) = slot {
                    coupled.push((state, slot));
                }
            }
        }
        if coupled.is_empty() {
            return Ok(());
        }
        let page = self.fetch_node(page_rid)?;
        for (state, slot) in coupled {
            let key = self.full_key(&page, slot)?;
            state.borrow_mut().pos = cursor::CursorPos::Uncoupled { key };
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_for_rejects_oversized_keys() {
        let err = BtreeIndex::layout_for(512, 400, false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidKeysize);

        let layout = BtreeIndex::layout_for(4096, 21, false).unwrap();
        assert!(layout.max_keys > 100);
    }
}
