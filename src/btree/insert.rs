//! Insert: descent, hinted node splits, append/prepend fast paths.
//!
//! A full node splits before the new key goes in. The split point comes
//! from the node's insert-position statistics: midpoint for scattered
//! workloads, pulled toward the recent insert cluster for skewed ones, so
//! ascending inserts leave densely packed left halves behind.

use crate::error::{Error, ErrorCode, Result};
use crate::storage::page::{PageRef, PageType};
use crate::types::{InsertFlags, Record, Rid};

use super::node;
use super::TreeOp;

/// A node split to be folded into the parent.
struct SplitResult {
    /// Key bytes separating the halves.
    pivot_key: Vec<u8>,
    /// Address of the new right node.
    right_rid: Rid,
}

impl TreeOp<'_> {
    /// Create the initial (empty leaf) root of a fresh database.
    pub fn create_root(&mut self) -> Result<()> {
        let page = self.alloc_node(true)?;
        page.borrow_mut().set_type(PageType::BtreeRoot);
        self.index.root = page.borrow().address();
        Ok(())
    }

    /// Insert or update a key. Returns the duplicate position of the
    /// written record.
    pub fn insert(&mut self, key: &[u8], record: &Record, flags: InsertFlags) -> Result<u32> {
        if flags.contains(InsertFlags::HINT_APPEND) || flags.contains(InsertFlags::HINT_PREPEND) {
            if let Some(pos) = self.try_edge_insert(key, record, flags)? {
                return Ok(pos);
            }
        }

        let root_rid = self.index.root;
        let (pos, split) = self.insert_recursive(root_rid, key, record, flags)?;
        if let Some(split) = split {
            // The root split: grow the tree by one level.
            let new_root = self.alloc_node(false)?;
            new_root.borrow_mut().set_type(PageType::BtreeRoot);
            let new_root_rid = new_root.borrow().address();
            {
                let layout = self.index.layout;
                let mut p = new_root.borrow_mut();
                node::set_node_ptr_left(p.payload_mut(), root_rid);
                node::insert_slot(p.payload_mut(), &layout, 0);
                node::set_key_rid_value(p.payload_mut(), &layout, 0, split.right_rid);
            }
            self.write_key_bytes(&new_root, 0, &split.pivot_key)?;

            let old_root = self.fetch_node(root_rid)?;
            old_root.borrow_mut().set_type(PageType::BtreeIndex);
            self.io.make_dirty(&old_root)?;

            self.index.root = new_root_rid;
            self.index.invalidate_edge_cache();
            tracing::debug!(root = new_root_rid, "btree grew a level");
        }
        Ok(pos)
    }

    fn insert_recursive(
        &mut self,
        page_rid: Rid,
        key: &[u8],
        record: &Record,
        flags: InsertFlags,
    ) -> Result<(u32, Option<SplitResult>)> {
        let page = self.fetch_node(page_rid)?;
        let (is_leaf, count) = {
            let p = page.borrow();
            (node::node_is_leaf(p.payload()), node::node_count(p.payload()))
        };

        if is_leaf {
            let (slot, ord) = self.node_search(&page, key)?;
            if ord == std::cmp::Ordering::Equal && slot >= 0 {
                // The key exists; only overwrite or duplicate-insert may
                // proceed.
                if !flags.intersects(InsertFlags::OVERWRITE | InsertFlags::DUPLICATE) {
                    return Err(Error::new(ErrorCode::DuplicateKey));
                }
                let pos = self.set_record_at(&page, slot as usize, record, 0, flags)?;
                return Ok((pos, None));
            }

            if count == self.index.layout.max_keys as usize {
                let split = self.split_node(&page)?;
                let right = self.fetch_node(split.right_rid)?;
                let target =
                    if self.cmp.compare(key, &split.pivot_key) == std::cmp::Ordering::Less {
                        page
                    } else {
                        right
                    };
                let pos = self.leaf_insert_new(&target, key, record, flags)?;
                return Ok((pos, Some(split)));
            }

            let pos = self.leaf_insert_new(&page, key, record, flags)?;
            return Ok((pos, None));
        }

        let (child_rid, child_slot) = self.descend_child(&page, key)?;
        let (pos, child_split) = self.insert_recursive(child_rid, key, record, flags)?;
        let Some(child_split) = child_split else {
            return Ok((pos, None));
        };

        // Fold the child's pivot into this node, one slot past the child.
        let pivot_slot = (child_slot + 1) as usize;
        if count < self.index.layout.max_keys as usize {
            self.io.make_dirty(&page)?;
            {
                let layout = self.index.layout;
                let mut p = page.borrow_mut();
                node::insert_slot(p.payload_mut(), &layout, pivot_slot);
                node::set_key_rid_value(p.payload_mut(), &layout, pivot_slot, child_split.right_rid);
            }
            self.write_key_bytes(&page, pivot_slot, &child_split.pivot_key)?;
            return Ok((pos, None));
        }

        // This node is full too: split it, then insert the child's pivot
        // into whichever half owns it.
        let split = self.split_node(&page)?;
        let right = self.fetch_node(split.right_rid)?;
        let target = if self.cmp.compare(&child_split.pivot_key, &split.pivot_key)
            == std::cmp::Ordering::Less
        {
            page
        } else {
            right
        };
        let (slot, _) = self.node_search(&target, &child_split.pivot_key)?;
        let insert_at = (slot + 1) as usize;
        self.io.make_dirty(&target)?;
        {
            let layout = self.index.layout;
            let mut p = target.borrow_mut();
            node::insert_slot(p.payload_mut(), &layout, insert_at);
            node::set_key_rid_value(p.payload_mut(), &layout, insert_at, child_split.right_rid);
        }
        self.write_key_bytes(&target, insert_at, &child_split.pivot_key)?;
        Ok((pos, Some(split)))
    }

    /// Put a new key into a leaf with room. Returns the duplicate position
    /// (always 0 for a fresh key).
    fn leaf_insert_new(
        &mut self,
        page: &PageRef,
        key: &[u8],
        record: &Record,
        flags: InsertFlags,
    ) -> Result<u32> {
        let (slot, _) = self.node_search(page, key)?;
        let ip = (slot + 1) as usize;

        // Cursors standing at or past the insert point shift right.
        let page_rid = page.borrow().address();
        for weak in self.cursors {
            if let Some(state) = weak.upgrade() {
                let mut s = state.borrow_mut();
                if let super::cursor::CursorPos::Coupled { page, slot } = &mut s.pos {
                    if *page == page_rid && *slot >= ip {
                        *slot += 1;
                    }
                }
            }
        }

        self.io.make_dirty(page)?;
        {
            let layout = self.index.layout;
            let mut p = page.borrow_mut();
            let count = node::node_count(p.payload());
            node::insert_slot(p.payload_mut(), &layout, ip);
            p.stats.record(ip, count + 1);
        }
        self.write_key_bytes(page, ip, key)?;
        // A fresh key stores one plain record; placement flags only apply
        // once a duplicate table exists.
        let store_flags = flags
            & !(InsertFlags::OVERWRITE
                | InsertFlags::DUPLICATE
                | InsertFlags::DUPLICATE_INSERT_BEFORE
                | InsertFlags::DUPLICATE_INSERT_AFTER
                | InsertFlags::DUPLICATE_INSERT_FIRST
                | InsertFlags::DUPLICATE_INSERT_LAST);
        self.set_record_at(page, ip, record, 0, store_flags)?;
        Ok(0)
    }

    /// Split a full node at its hinted split point. The left node keeps
    /// slots below the pivot; the caller re-fetches the right node by rid.
    fn split_node(&mut self, page: &PageRef) -> Result<SplitResult> {
        let page_rid = page.borrow().address();
        self.uncouple_cursors(page_rid)?;

        let layout = self.index.layout;
        let (is_leaf, count, pivot) = {
            let p = page.borrow();
            let count = node::node_count(p.payload());
            let pivot = p.stats.hinted_split_slot(count).clamp(1, count - 1);
            (node::node_is_leaf(p.payload()), count, pivot)
        };

        let right = self.alloc_node(is_leaf)?;
        let right_rid = right.borrow().address();

        if is_leaf {
            // Leaf split copies the pivot key up; the right half keeps it.
            let pivot_key = self.full_key(page, pivot)?;
            self.move_key_range(page, &right, pivot, count)?;
            self.link_new_right_sibling(page, &right)?;
            tracing::trace!(page = page_rid, right = right_rid, pivot, "leaf split");
            Ok(SplitResult {
                pivot_key,
                right_rid,
            })
        } else {
            // Internal split moves the pivot key up and its child pointer
            // into the right node's ptr_left.
            let pivot_key = self.full_key(page, pivot)?;
            let pivot_child = {
                let p = page.borrow();
                node::key_rid_value(p.payload(), &layout, pivot)
            };
            self.free_key_extkey(page, pivot)?;
            {
                let mut p = right.borrow_mut();
                node::set_node_ptr_left(p.payload_mut(), pivot_child);
            }
            self.move_key_range(page, &right, pivot + 1, count)?;
            // Drop the promoted pivot from the left half.
            self.io.make_dirty(page)?;
            {
                let mut p = page.borrow_mut();
                node::truncate_count(p.payload_mut(), pivot);
                node::compact(p.payload_mut(), &layout);
            }
            self.link_new_right_sibling(page, &right)?;
            tracing::trace!(page = page_rid, right = right_rid, pivot, "internal split");
            Ok(SplitResult {
                pivot_key,
                right_rid,
            })
        }
    }

    /// Move logical slots `[from, to)` into the (empty) right node and
    /// shrink the source to `from` keys.
    fn move_key_range(
        &mut self,
        src: &PageRef,
        dst: &PageRef,
        from: usize,
        to: usize,
    ) -> Result<()> {
        self.io.make_dirty(src)?;
        self.io.make_dirty(dst)?;
        let layout = self.index.layout;
        let mut s = src.borrow_mut();
        let mut d = dst.borrow_mut();
        for (i, slot) in (from..to).enumerate() {
            node::insert_slot(d.payload_mut(), &layout, i);
            node::copy_key_record(s.payload(), &layout, slot, d.payload_mut(), &layout, i);
        }
        node::truncate_count(s.payload_mut(), from);
        node::compact(s.payload_mut(), &layout);
        Ok(())
    }

    /// Wire `right` in as the new right sibling of `page`.
    fn link_new_right_sibling(&mut self, page: &PageRef, right: &PageRef) -> Result<()> {
        let old_right = {
            let p = page.borrow();
            node::node_right_sibling(p.payload())
        };
        let page_rid = page.borrow().address();
        let right_rid = right.borrow().address();

        {
            let mut r = right.borrow_mut();
            node::set_node_left_sibling(r.payload_mut(), page_rid);
            node::set_node_right_sibling(r.payload_mut(), old_right);
        }
        {
            let mut p = page.borrow_mut();
            node::set_node_right_sibling(p.payload_mut(), right_rid);
        }
        if old_right != 0 {
            let neighbor = self.fetch_node(old_right)?;
            self.io.make_dirty(&neighbor)?;
            let mut n = neighbor.borrow_mut();
            node::set_node_left_sibling(n.payload_mut(), right_rid);
        }
        self.index.invalidate_edge_cache();
        Ok(())
    }

    /// Append/prepend fast path: verify the hint against the cached edge
    /// leaf with one comparison and insert without a descent. `None` falls
    /// back to the full path.
    fn try_edge_insert(
        &mut self,
        key: &[u8],
        record: &Record,
        flags: InsertFlags,
    ) -> Result<Option<u32>> {
        let append = flags.contains(InsertFlags::HINT_APPEND);

        let leaf_rid = if append {
            self.index.rightmost_leaf
        } else {
            self.index.leftmost_leaf
        };
        let leaf = match leaf_rid {
            Some(rid) => self.fetch_node(rid)?,
            None => {
                let leaf = self.edge_leaf(append)?;
                let rid = leaf.borrow().address();
                if append {
                    self.index.rightmost_leaf = Some(rid);
                } else {
                    self.index.leftmost_leaf = Some(rid);
                }
                leaf
            }
        };

        let (is_leaf, count, at_edge) = {
            let p = leaf.borrow();
            let payload = p.payload();
            let edge = if append {
                node::node_right_sibling(payload) == 0
            } else {
                node::node_left_sibling(payload) == 0
            };
            (node::node_is_leaf(payload), node::node_count(payload), edge)
        };
        // A split would need the full descent path; bail out when full.
        if !is_leaf || !at_edge || count == 0 || count >= self.index.layout.max_keys as usize {
            return Ok(None);
        }

        let probe_slot = if append { count - 1 } else { 0 };
        let ord = self.compare_to_slot(key, &leaf, probe_slot)?;
        let hint_holds = if append {
            ord == std::cmp::Ordering::Greater
        } else {
            ord == std::cmp::Ordering::Less
        };
        if !hint_holds {
            return Ok(None);
        }

        let pos = self.leaf_insert_new(&leaf, key, record, flags)?;
        Ok(Some(pos))
    }
}
