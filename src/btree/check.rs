//! Tree enumeration and integrity checking.

use crate::error::{Error, ErrorCode, Result};
use crate::storage::blob;
use crate::storage::page::{PageRef, PageType};
use crate::types::Rid;

use super::node;
use super::TreeOp;

// ============================================================================
// Enumeration
// ============================================================================

/// Visitor for the pre-order tree walk.
pub trait EnumVisitor {
    /// Entering the next level down.
    fn descend(&mut self, _level: u32) {}
    /// A node is about to be visited.
    fn page_start(&mut self, _page: Rid, _level: u32, _count: usize, _is_leaf: bool) {}
    /// A node was fully visited.
    fn page_stop(&mut self, _page: Rid) {}
    /// One key of a leaf node.
    fn item(&mut self, _key: &[u8], _key_flags: u8, _record_count: u32) {}
}

impl TreeOp<'_> {
    /// Pre-order walk over the whole tree.
    pub fn enumerate(&mut self, visitor: &mut dyn EnumVisitor) -> Result<()> {
        let root = self.index.root;
        self.enumerate_node(root, 0, visitor)
    }

    fn enumerate_node(
        &mut self,
        page_rid: Rid,
        level: u32,
        visitor: &mut dyn EnumVisitor,
    ) -> Result<()> {
        let page = self.fetch_node(page_rid)?;
        let (is_leaf, count) = {
            let p = page.borrow();
            (node::node_is_leaf(p.payload()), node::node_count(p.payload()))
        };
        visitor.page_start(page_rid, level, count, is_leaf);

        if is_leaf {
            let layout = self.index.layout;
            for slot in 0..count {
                let key = self.full_key(&page, slot)?;
                let flags = {
                    let p = page.borrow();
                    node::key_flags(p.payload(), &layout, slot)
                };
                let records = self.record_count_at(&page, slot)?;
                visitor.item(&key, flags, records);
            }
        } else {
            visitor.descend(level + 1);
            let layout = self.index.layout;
            let mut children = Vec::with_capacity(count + 1);
            {
                let p = page.borrow();
                children.push(node::node_ptr_left(p.payload()));
                for slot in 0..count {
                    children.push(node::key_rid_value(p.payload(), &layout, slot));
                }
            }
            for child in children {
                self.enumerate_node(child, level + 1, visitor)?;
            }
        }
        visitor.page_stop(page_rid);
        Ok(())
    }
}

// ============================================================================
// Integrity
// ============================================================================

fn violated(msg: String) -> Error {
    Error::with_message(ErrorCode::IntegrityViolated, msg)
}

impl TreeOp<'_> {
    /// Verify every structural invariant of the tree: node typing and fill
    /// levels, key ordering within and across nodes, separator bounds,
    /// sibling links, uniform leaf depth, and that extended keys and
    /// duplicate tables resolve.
    pub fn check_integrity(&mut self) -> Result<()> {
        let root_rid = self.index.root;
        let root = self.fetch_node(root_rid)?;
        if root.borrow().ptype() != Some(PageType::BtreeRoot) {
            return Err(violated(format!("root page {:#x} lacks the root type", root_rid)));
        }

        let mut leaf_depth: Option<u32> = None;
        self.check_node(root_rid, 0, true, None, None, &mut leaf_depth)?;
        self.check_leaf_chain()?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn check_node(
        &mut self,
        page_rid: Rid,
        depth: u32,
        is_root: bool,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        leaf_depth: &mut Option<u32>,
    ) -> Result<()> {
        let page = self.fetch_node(page_rid)?;
        let layout = self.index.layout;
        let (is_leaf, count) = {
            let p = page.borrow();
            (node::node_is_leaf(p.payload()), node::node_count(p.payload()))
        };

        // No node may claim more keys than fit; only the root may hold
        // fewer than the minimum.
        if count > layout.max_keys as usize {
            return Err(violated(format!(
                "node {:#x} claims {} keys, capacity is {}",
                page_rid, count, layout.max_keys
            )));
        }
        if !is_root {
            if page.borrow().ptype() != Some(PageType::BtreeIndex) {
                return Err(violated(format!("interior page {:#x} mistyped", page_rid)));
            }
            if count < layout.min_keys() {
                return Err(violated(format!(
                    "node {:#x} holds {} keys, below the minimum of {}",
                    page_rid,
                    count,
                    layout.min_keys()
                )));
            }
        }

        if is_leaf {
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(d) if d != depth => {
                    return Err(violated(format!(
                        "leaf {:#x} at depth {}, expected {}",
                        page_rid, depth, d
                    )))
                }
                _ => {}
            }
        }

        // Key ordering and bounds. Separator semantics: a child reached
        // through separator S holds keys >= S; ptr_left holds keys < S0.
        let mut prev: Option<Vec<u8>> = None;
        for slot in 0..count {
            let key = self.full_key(&page, slot)?;
            if let Some(prev) = &prev {
                if self.cmp.compare(prev, &key) != std::cmp::Ordering::Less {
                    return Err(violated(format!(
                        "node {:#x}: keys out of order at slot {}",
                        page_rid, slot
                    )));
                }
            }
            if let Some(lower) = lower {
                if self.cmp.compare(&key, lower) == std::cmp::Ordering::Less {
                    return Err(violated(format!(
                        "node {:#x}: slot {} below its separator",
                        page_rid, slot
                    )));
                }
            }
            if let Some(upper) = upper {
                if self.cmp.compare(&key, upper) != std::cmp::Ordering::Less {
                    return Err(violated(format!(
                        "node {:#x}: slot {} at or above the next separator",
                        page_rid, slot
                    )));
                }
            }

            if is_leaf {
                let flags = {
                    let p = page.borrow();
                    node::key_flags(p.payload(), &layout, slot)
                };
                if flags & node::KEY_FLAG_HAS_DUPLICATES != 0 {
                    let rid = {
                        let p = page.borrow();
                        node::key_rid(p.payload(), &layout, slot)
                    };
                    let n = blob::dupe_count(&mut self.io, blob::rid_value(&rid))?;
                    if n == 0 {
                        return Err(violated(format!(
                            "node {:#x}: slot {} has an empty duplicate table",
                            page_rid, slot
                        )));
                    }
                }
            }
            prev = Some(key);
        }

        if is_leaf {
            return Ok(());
        }

        // Recurse with tightened bounds.
        let mut children = Vec::with_capacity(count + 1);
        {
            let p = page.borrow();
            children.push(node::node_ptr_left(p.payload()));
            for slot in 0..count {
                children.push(node::key_rid_value(p.payload(), &layout, slot));
            }
        }
        let mut separators = Vec::with_capacity(count);
        for slot in 0..count {
            separators.push(self.full_key(&page, slot)?);
        }

        for (i, child) in children.iter().enumerate() {
            if *child == 0 {
                return Err(violated(format!("node {:#x}: null child {}", page_rid, i)));
            }
            let child_lower = if i == 0 {
                lower
            } else {
                Some(separators[i - 1].as_slice())
            };
            let child_upper = if i < count {
                Some(separators[i].as_slice())
            } else {
                upper
            };
            self.check_node(*child, depth + 1, false, child_lower, child_upper, leaf_depth)?;
        }

        // Children at one level must chain through their sibling links.
        for pair in children.windows(2) {
            let left = self.fetch_node(pair[0])?;
            let right = self.fetch_node(pair[1])?;
            let l_next = node::node_right_sibling(left.borrow().payload());
            let r_prev = node::node_left_sibling(right.borrow().payload());
            if l_next != pair[1] || r_prev != pair[0] {
                return Err(violated(format!(
                    "sibling links broken between {:#x} and {:#x}",
                    pair[0], pair[1]
                )));
            }
        }
        Ok(())
    }

    /// Walk the leaf chain end to end and verify global key ordering.
    fn check_leaf_chain(&mut self) -> Result<()> {
        let mut page = self.edge_leaf(false)?;
        if node::node_left_sibling(page.borrow().payload()) != 0 {
            return Err(violated("leftmost leaf has a left sibling".into()));
        }

        let mut prev_key: Option<Vec<u8>> = None;
        loop {
            let (count, next) = {
                let p = page.borrow();
                (
                    node::node_count(p.payload()),
                    node::node_right_sibling(p.payload()),
                )
            };
            for slot in 0..count {
                let key = self.full_key(&page, slot)?;
                if let Some(prev) = &prev_key {
                    if self.cmp.compare(prev, &key) != std::cmp::Ordering::Less {
                        return Err(violated(format!(
                            "leaf chain: key order broken in {:#x}",
                            page.borrow().address()
                        )));
                    }
                }
                prev_key = Some(key);
            }
            if next == 0 {
                return Ok(());
            }
            page = self.fetch_node(next)?;
        }
    }
}
