//! Erase: descent, underflow repair by redistribution or merge, root
//! shrink.
//!
//! A non-root node dropping below half fill first tries to borrow a key
//! from a sibling under the same parent; when both siblings sit at the
//! minimum it merges with one of them instead. Merges remove a separator
//! from the parent, which may underflow in turn; the repair propagates up
//! as the recursion unwinds, and a root left with zero keys hands its only
//! child the root role.

use crate::error::{Error, ErrorCode, Result};
use crate::storage::page::{PageRef, PageType};
use crate::types::{EraseFlags, Rid};

use super::cursor::CursorPos;
use super::node;
use super::TreeOp;

impl TreeOp<'_> {
    /// Erase a key, or one duplicate of it when `dup_id` is given.
    pub fn erase(&mut self, key: &[u8], dup_id: Option<u32>, flags: EraseFlags) -> Result<()> {
        let root_rid = self.index.root;
        self.erase_recursive(root_rid, key, dup_id, flags)?;

        // A rootless-looking root (internal, zero keys) shrinks the tree.
        let root = self.fetch_node(root_rid)?;
        let (is_leaf, count, ptr_left) = {
            let p = root.borrow();
            (
                node::node_is_leaf(p.payload()),
                node::node_count(p.payload()),
                node::node_ptr_left(p.payload()),
            )
        };
        if !is_leaf && count == 0 {
            let child = self.fetch_node(ptr_left)?;
            child.borrow_mut().set_type(PageType::BtreeRoot);
            self.io.make_dirty(&child)?;
            self.free_node(&root)?;
            drop(root);
            self.index.root = ptr_left;
            self.index.invalidate_edge_cache();
            tracing::debug!(root = ptr_left, "btree shrank a level");
        }
        Ok(())
    }

    fn erase_recursive(
        &mut self,
        page_rid: Rid,
        key: &[u8],
        dup_id: Option<u32>,
        flags: EraseFlags,
    ) -> Result<()> {
        let page = self.fetch_node(page_rid)?;
        let is_leaf = {
            let p = page.borrow();
            node::node_is_leaf(p.payload())
        };

        if is_leaf {
            let (slot, ord) = self.node_search(&page, key)?;
            if ord != std::cmp::Ordering::Equal || slot < 0 {
                return Err(Error::new(ErrorCode::KeyNotFound));
            }
            let slot = slot as usize;

            let key_gone = match dup_id {
                // Erasing by key removes the key with everything on it.
                None => self.erase_record_at(&page, slot, 0, EraseFlags::ERASE_ALL_DUPLICATES)?,
                Some(dup) => {
                    let gone = self.erase_record_at(&page, slot, dup, flags)?;
                    if !gone {
                        self.adjust_cursors_after_dupe_erase(page_rid, slot, dup);
                    }
                    gone
                }
            };
            if key_gone {
                self.nil_cursors_at(page_rid, slot);
                self.uncouple_cursors(page_rid)?;
                self.free_key_extkey(&page, slot)?;
                self.io.make_dirty(&page)?;
                let layout = self.index.layout;
                let mut p = page.borrow_mut();
                node::remove_slot(p.payload_mut(), &layout, slot);
                let count = node::node_count(p.payload());
                p.stats.record(slot, count.max(1));
            }
            return Ok(());
        }

        let (child_rid, child_slot) = self.descend_child(&page, key)?;
        self.erase_recursive(child_rid, key, dup_id, flags)?;

        let child = self.fetch_node(child_rid)?;
        let child_count = {
            let p = child.borrow();
            node::node_count(p.payload())
        };
        if child_count >= self.index.layout.min_keys() {
            return Ok(());
        }
        self.rebalance_child(&page, child_slot, &child)
    }

    // ------------------------------------------------------------------
    // Rebalancing
    // ------------------------------------------------------------------

    /// Repair an underflowing child of `parent`. `child_idx` is the parent
    /// slot pointing at the child, -1 for `ptr_left`.
    fn rebalance_child(
        &mut self,
        parent: &PageRef,
        child_idx: isize,
        child: &PageRef,
    ) -> Result<()> {
        let layout = self.index.layout;
        let parent_count = {
            let p = parent.borrow();
            node::node_count(p.payload())
        };
        let min = layout.min_keys();

        // Right sibling under the same parent.
        let right_idx = child_idx + 1;
        if (right_idx as usize) < parent_count {
            let right_rid = {
                let p = parent.borrow();
                node::key_rid_value(p.payload(), &layout, right_idx as usize)
            };
            let right = self.fetch_node(right_rid)?;
            let right_count = {
                let p = right.borrow();
                node::node_count(p.payload())
            };
            if right_count > min {
                return self.rotate_from_right(parent, right_idx as usize, child, &right);
            }
            return self.merge_nodes(parent, right_idx as usize, child, &right);
        }

        // Left sibling under the same parent.
        if child_idx >= 0 {
            let left_rid = {
                let p = parent.borrow();
                if child_idx == 0 {
                    node::node_ptr_left(p.payload())
                } else {
                    node::key_rid_value(p.payload(), &layout, child_idx as usize - 1)
                }
            };
            let left = self.fetch_node(left_rid)?;
            let left_count = {
                let p = left.borrow();
                node::node_count(p.payload())
            };
            if left_count > min {
                return self.rotate_from_left(parent, child_idx as usize, &left, child);
            }
            return self.merge_nodes(parent, child_idx as usize, &left, child);
        }

        // ptr_left child with no right sibling: the parent has no keys at
        // all, which only happens at the root and is handled by the root
        // shrink in `erase`.
        Ok(())
    }

    /// Move the right sibling's first key into `child`. `sep_slot` is the
    /// parent slot separating the two.
    fn rotate_from_right(
        &mut self,
        parent: &PageRef,
        sep_slot: usize,
        child: &PageRef,
        right: &PageRef,
    ) -> Result<()> {
        self.uncouple_cursors(child.borrow().address())?;
        self.uncouple_cursors(right.borrow().address())?;
        self.io.make_dirty(parent)?;
        self.io.make_dirty(child)?;
        self.io.make_dirty(right)?;

        let layout = self.index.layout;
        let is_leaf = {
            let p = child.borrow();
            node::node_is_leaf(p.payload())
        };

        if is_leaf {
            {
                let mut c = child.borrow_mut();
                let ccount = node::node_count(c.payload());
                node::insert_slot(c.payload_mut(), &layout, ccount);
                let mut r = right.borrow_mut();
                node::copy_key_record(r.payload(), &layout, 0, c.payload_mut(), &layout, ccount);
                node::remove_slot(r.payload_mut(), &layout, 0);
            }
            // The separator becomes the right node's new first key.
            let new_sep = self.full_key(right, 0)?;
            self.free_key_extkey(parent, sep_slot)?;
            self.write_key_bytes(parent, sep_slot, &new_sep)?;
        } else {
            // Rotate left through the separator.
            let sep_bytes = self.full_key(parent, sep_slot)?;
            let (right_ptr_left, right_first_child) = {
                let r = right.borrow();
                (
                    node::node_ptr_left(r.payload()),
                    node::key_rid_value(r.payload(), &layout, 0),
                )
            };
            {
                let mut c = child.borrow_mut();
                let ccount = node::node_count(c.payload());
                node::insert_slot(c.payload_mut(), &layout, ccount);
                node::set_key_rid_value(c.payload_mut(), &layout, ccount, right_ptr_left);
            }
            let ccount = {
                let c = child.borrow();
                node::node_count(c.payload()) - 1
            };
            self.write_key_bytes(child, ccount, &sep_bytes)?;

            let up_bytes = self.full_key(right, 0)?;
            self.free_key_extkey(parent, sep_slot)?;
            self.write_key_bytes(parent, sep_slot, &up_bytes)?;
            self.free_key_extkey(right, 0)?;
            {
                let mut r = right.borrow_mut();
                node::set_node_ptr_left(r.payload_mut(), right_first_child);
                node::remove_slot(r.payload_mut(), &layout, 0);
            }
        }
        Ok(())
    }

    /// Move the left sibling's last key into `child`. `sep_slot` is the
    /// parent slot separating the two.
    fn rotate_from_left(
        &mut self,
        parent: &PageRef,
        sep_slot: usize,
        left: &PageRef,
        child: &PageRef,
    ) -> Result<()> {
        self.uncouple_cursors(child.borrow().address())?;
        self.uncouple_cursors(left.borrow().address())?;
        self.io.make_dirty(parent)?;
        self.io.make_dirty(child)?;
        self.io.make_dirty(left)?;

        let layout = self.index.layout;
        let is_leaf = {
            let p = child.borrow();
            node::node_is_leaf(p.payload())
        };
        let last = {
            let l = left.borrow();
            node::node_count(l.payload()) - 1
        };

        if is_leaf {
            {
                let mut c = child.borrow_mut();
                node::insert_slot(c.payload_mut(), &layout, 0);
                let mut l = left.borrow_mut();
                node::copy_key_record(l.payload(), &layout, last, c.payload_mut(), &layout, 0);
                node::remove_slot(l.payload_mut(), &layout, last);
            }
            let new_sep = self.full_key(child, 0)?;
            self.free_key_extkey(parent, sep_slot)?;
            self.write_key_bytes(parent, sep_slot, &new_sep)?;
        } else {
            // Rotate right through the separator.
            let sep_bytes = self.full_key(parent, sep_slot)?;
            let (left_last_child, child_ptr_left) = {
                let l = left.borrow();
                let c = child.borrow();
                (
                    node::key_rid_value(l.payload(), &layout, last),
                    node::node_ptr_left(c.payload()),
                )
            };
            {
                let mut c = child.borrow_mut();
                node::insert_slot(c.payload_mut(), &layout, 0);
                node::set_key_rid_value(c.payload_mut(), &layout, 0, child_ptr_left);
                node::set_node_ptr_left(c.payload_mut(), left_last_child);
            }
            self.write_key_bytes(child, 0, &sep_bytes)?;

            let up_bytes = self.full_key(left, last)?;
            self.free_key_extkey(parent, sep_slot)?;
            self.write_key_bytes(parent, sep_slot, &up_bytes)?;
            self.free_key_extkey(left, last)?;
            {
                let mut l = left.borrow_mut();
                node::remove_slot(l.payload_mut(), &layout, last);
            }
        }
        Ok(())
    }

    /// Merge `right` into `left`, dropping the separator at `sep_slot`
    /// from the parent and freeing the right node.
    fn merge_nodes(
        &mut self,
        parent: &PageRef,
        sep_slot: usize,
        left: &PageRef,
        right: &PageRef,
    ) -> Result<()> {
        let left_rid = left.borrow().address();
        let right_rid = right.borrow().address();
        self.uncouple_cursors(left_rid)?;
        self.uncouple_cursors(right_rid)?;
        self.io.make_dirty(parent)?;
        self.io.make_dirty(left)?;
        self.io.make_dirty(right)?;

        let layout = self.index.layout;
        let is_leaf = {
            let l = left.borrow();
            node::node_is_leaf(l.payload())
        };

        if !is_leaf {
            // Pull the separator down between the merged key sets.
            let sep_bytes = self.full_key(parent, sep_slot)?;
            let right_ptr_left = {
                let r = right.borrow();
                node::node_ptr_left(r.payload())
            };
            {
                let mut l = left.borrow_mut();
                let lcount = node::node_count(l.payload());
                node::insert_slot(l.payload_mut(), &layout, lcount);
                node::set_key_rid_value(l.payload_mut(), &layout, lcount, right_ptr_left);
            }
            let at = {
                let l = left.borrow();
                node::node_count(l.payload()) - 1
            };
            self.write_key_bytes(left, at, &sep_bytes)?;
        }

        // Append the right node's records.
        {
            let mut l = left.borrow_mut();
            let mut r = right.borrow_mut();
            let lcount = node::node_count(l.payload());
            let rcount = node::node_count(r.payload());
            for i in 0..rcount {
                node::insert_slot(l.payload_mut(), &layout, lcount + i);
                node::copy_key_record(r.payload(), &layout, i, l.payload_mut(), &layout, lcount + i);
            }
            node::truncate_count(r.payload_mut(), 0);
        }

        // Unlink the right node from the sibling chain.
        let right_right = {
            let r = right.borrow();
            node::node_right_sibling(r.payload())
        };
        {
            let mut l = left.borrow_mut();
            node::set_node_right_sibling(l.payload_mut(), right_right);
        }
        if right_right != 0 {
            let neighbor = self.fetch_node(right_right)?;
            self.io.make_dirty(&neighbor)?;
            let mut n = neighbor.borrow_mut();
            node::set_node_left_sibling(n.payload_mut(), left_rid);
        }

        // Drop the separator and the right child pointer from the parent.
        self.free_key_extkey(parent, sep_slot)?;
        {
            let mut p = parent.borrow_mut();
            node::remove_slot(p.payload_mut(), &layout, sep_slot);
        }

        self.free_node(right)?;
        self.index.invalidate_edge_cache();
        tracing::trace!(left = left_rid, right = right_rid, "nodes merged");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Whole-tree teardown
    // ------------------------------------------------------------------

    /// Free every page, record, duplicate table and extended key of the
    /// tree. Used when a database is deleted from its environment.
    pub fn drop_tree(&mut self) -> Result<()> {
        let root = self.index.root;
        self.drop_subtree(root)?;
        self.index.root = 0;
        self.index.invalidate_edge_cache();
        Ok(())
    }

    fn drop_subtree(&mut self, page_rid: Rid) -> Result<()> {
        let page = self.fetch_node(page_rid)?;
        let layout = self.index.layout;
        let (is_leaf, count) = {
            let p = page.borrow();
            (node::node_is_leaf(p.payload()), node::node_count(p.payload()))
        };

        if is_leaf {
            for slot in 0..count {
                self.erase_record_at(&page, slot, 0, EraseFlags::ERASE_ALL_DUPLICATES)?;
                self.free_key_extkey(&page, slot)?;
            }
        } else {
            let mut children = Vec::with_capacity(count + 1);
            {
                let p = page.borrow();
                children.push(node::node_ptr_left(p.payload()));
                for slot in 0..count {
                    children.push(node::key_rid_value(p.payload(), &layout, slot));
                }
            }
            for child in children {
                self.drop_subtree(child)?;
            }
            for slot in 0..count {
                self.free_key_extkey(&page, slot)?;
            }
        }
        self.free_node(&page)
    }

    // ------------------------------------------------------------------
    // Cursor adjustment
    // ------------------------------------------------------------------

    /// Cursors standing exactly on an erased key turn nil.
    fn nil_cursors_at(&mut self, page_rid: Rid, slot: usize) {
        for weak in self.cursors {
            if let Some(state) = weak.upgrade() {
                let mut s = state.borrow_mut();
                if let CursorPos::Coupled { page, slot: cslot } = s.pos {
                    if page == page_rid && cslot == slot {
                        s.pos = CursorPos::Nil;
                        s.dup_id = 0;
                    }
                }
            }
        }
    }

    /// Keep cursor duplicate ids consistent after one duplicate vanished.
    fn adjust_cursors_after_dupe_erase(&mut self, page_rid: Rid, slot: usize, dup: u32) {
        for weak in self.cursors {
            if let Some(state) = weak.upgrade() {
                let mut s = state.borrow_mut();
                if let CursorPos::Coupled { page, slot: cslot } = s.pos {
                    if page == page_rid && cslot == slot {
                        if s.dup_id == dup {
                            s.pos = CursorPos::Nil;
                            s.dup_id = 0;
                        } else if s.dup_id > dup {
                            s.dup_id -= 1;
                        }
                    }
                }
            }
        }
    }
}
