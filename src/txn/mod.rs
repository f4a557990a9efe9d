//! Transactions and the per-transaction operation tree.
//!
//! A transaction buffers its writes as *ops* in a balanced tree keyed by
//! user key (ordered by the database's own comparator); each key holds its
//! ops in issue order. Nothing touches the B+tree until commit, which
//! applies the ops key by key; abort simply discards the tree.
//!
//! Reads under a transaction consult the op tree first: a pending insert
//! serves its record, a pending erase hides the key, anything else falls
//! through to the B+tree.

use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::btree::keys::KeyCompare;
use crate::types::{DbName, EraseFlags, InsertFlags, Record, TxnFlags, TxnId};

// ============================================================================
// Ops
// ============================================================================

/// What a buffered operation does when applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Plain insert; fails on an existing key.
    Insert,
    /// Insert with overwrite.
    InsertOverwrite,
    /// Insert as an additional duplicate.
    InsertDuplicate,
    /// Erase the key or one duplicate of it.
    Erase,
}

/// One buffered operation.
#[derive(Debug, Clone)]
pub struct TxnOp {
    /// Operation kind.
    pub kind: OpKind,
    /// Original insert flags (placement bits matter for duplicates).
    pub insert_flags: InsertFlags,
    /// Original erase flags.
    pub erase_flags: EraseFlags,
    /// The record for insert kinds.
    pub record: Option<Record>,
    /// Duplicate id for targeted erases; `None` erases the whole key.
    pub dup_id: Option<u32>,
    /// Issue sequence number within the transaction.
    pub seq: u64,
}

/// All ops buffered for one key, in issue order.
#[derive(Debug, Clone, Default)]
pub struct OpNode {
    /// The ops, oldest first.
    pub ops: Vec<TxnOp>,
}

/// What the op tree says about a key.
pub enum Visibility {
    /// No pending op decides; ask the B+tree.
    Unknown,
    /// A pending erase hides the key.
    Erased,
    /// A pending insert provides this record.
    Record(Record),
}

impl OpNode {
    /// Resolve the key's visibility from the newest deciding op.
    pub fn visibility(&self) -> Visibility {
        for op in self.ops.iter().rev() {
            match op.kind {
                OpKind::Insert | OpKind::InsertOverwrite | OpKind::InsertDuplicate => {
                    if let Some(record) = &op.record {
                        return Visibility::Record(record.clone());
                    }
                }
                OpKind::Erase => {
                    if op.dup_id.is_none() {
                        return Visibility::Erased;
                    }
                    // A single-duplicate erase leaves earlier records
                    // visible; keep scanning.
                }
            }
        }
        Visibility::Unknown
    }
}

// ============================================================================
// Op Tree
// ============================================================================

/// Key wrapper whose ordering delegates to the database comparator, so a
/// standard balanced map keeps op nodes in comparator order.
#[derive(Clone)]
pub struct OpKey {
    /// The user key bytes.
    pub bytes: Vec<u8>,
    cmp: Rc<dyn KeyCompare>,
}

impl PartialEq for OpKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp.compare(&self.bytes, &other.bytes) == Ordering::Equal
    }
}

impl Eq for OpKey {}

impl PartialOrd for OpKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp.compare(&self.bytes, &other.bytes)
    }
}

/// Pending operations of one transaction against one database.
pub struct OpTree {
    map: BTreeMap<OpKey, OpNode>,
    cmp: Rc<dyn KeyCompare>,
    next_seq: u64,
}

impl OpTree {
    /// Empty tree ordered by the database comparator.
    pub fn new(cmp: Rc<dyn KeyCompare>) -> Self {
        Self {
            map: BTreeMap::new(),
            cmp,
            next_seq: 0,
        }
    }

    fn node_entry(&mut self, key: &[u8]) -> &mut OpNode {
        let op_key = OpKey {
            bytes: key.to_vec(),
            cmp: self.cmp.clone(),
        };
        match self.map.entry(op_key) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(OpNode::default()),
        }
    }

    /// Buffer an insert-kind op.
    pub fn record_insert(
        &mut self,
        key: &[u8],
        record: Record,
        kind: OpKind,
        flags: InsertFlags,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.node_entry(key).ops.push(TxnOp {
            kind,
            insert_flags: flags,
            erase_flags: EraseFlags::empty(),
            record: Some(record),
            dup_id: None,
            seq,
        });
    }

    /// Buffer an erase op.
    pub fn record_erase(&mut self, key: &[u8], dup_id: Option<u32>, flags: EraseFlags) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.node_entry(key).ops.push(TxnOp {
            kind: OpKind::Erase,
            insert_flags: InsertFlags::empty(),
            erase_flags: flags,
            record: None,
            dup_id,
            seq,
        });
    }

    /// Pending ops for a key, if any.
    pub fn lookup(&self, key: &[u8]) -> Option<&OpNode> {
        let op_key = OpKey {
            bytes: key.to_vec(),
            cmp: self.cmp.clone(),
        };
        self.map.get(&op_key)
    }

    /// Iterate nodes in comparator key order.
    pub fn iter(&self) -> impl Iterator<Item = (&OpKey, &OpNode)> {
        self.map.iter()
    }

    /// True when nothing was buffered.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// An open transaction.
///
/// At most one transaction is open per environment; the environment hands
/// them out and consumes them again on commit or abort.
pub struct Transaction {
    id: TxnId,
    name: Option<String>,
    flags: TxnFlags,
    trees: Vec<(DbName, OpTree)>,
    /// Cursors created under this transaction and not yet closed; commit
    /// refuses while any remain.
    open_cursors: Rc<Cell<usize>>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    /// Package a freshly begun transaction.
    pub(crate) fn new(id: TxnId, name: Option<String>, flags: TxnFlags) -> Self {
        Self {
            id,
            name,
            flags,
            trees: Vec::new(),
            open_cursors: Rc::new(Cell::new(0)),
        }
    }

    /// Transaction id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Optional transaction name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Flags the transaction was begun with.
    pub fn flags(&self) -> TxnFlags {
        self.flags
    }

    /// Shared counter of cursors attached to this transaction.
    pub(crate) fn cursor_counter(&self) -> Rc<Cell<usize>> {
        self.open_cursors.clone()
    }

    /// Number of cursors still attached.
    pub fn open_cursor_count(&self) -> usize {
        self.open_cursors.get()
    }

    /// The op tree for a database, creating it on first use.
    pub(crate) fn tree_for(&mut self, db: DbName, cmp: Rc<dyn KeyCompare>) -> &mut OpTree {
        if let Some(idx) = self.trees.iter().position(|(name, _)| *name == db) {
            return &mut self.trees[idx].1;
        }
        self.trees.push((db, OpTree::new(cmp)));
        let idx = self.trees.len() - 1;
        &mut self.trees[idx].1
    }

    /// The op tree for a database, if one exists.
    pub(crate) fn tree(&self, db: DbName) -> Option<&OpTree> {
        self.trees
            .iter()
            .find(|(name, _)| *name == db)
            .map(|(_, tree)| tree)
    }

    /// Drain all op trees for commit.
    pub(crate) fn take_trees(&mut self) -> Vec<(DbName, OpTree)> {
        std::mem::take(&mut self.trees)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::keys::LexicalCompare;

    fn tree() -> OpTree {
        OpTree::new(Rc::new(LexicalCompare))
    }

    #[test]
    fn test_ops_keep_issue_order() {
        let mut t = tree();
        t.record_insert(b"k", Record::new(b"r1"), OpKind::Insert, InsertFlags::empty());
        t.record_erase(b"k", None, EraseFlags::empty());
        t.record_insert(b"k", Record::new(b"r2"), OpKind::Insert, InsertFlags::empty());

        let node = t.lookup(b"k").unwrap();
        assert_eq!(node.ops.len(), 3);
        assert!(node.ops.windows(2).all(|w| w[0].seq < w[1].seq));
        match node.visibility() {
            Visibility::Record(r) => assert_eq!(r.data, b"r2"),
            _ => panic!("latest insert should win"),
        }
    }

    #[test]
    fn test_erase_hides_key() {
        let mut t = tree();
        t.record_insert(b"k", Record::new(b"r"), OpKind::Insert, InsertFlags::empty());
        t.record_erase(b"k", None, EraseFlags::empty());
        assert!(matches!(t.lookup(b"k").unwrap().visibility(), Visibility::Erased));
    }

    #[test]
    fn test_nodes_iterate_in_comparator_order() {
        let mut t = tree();
        for key in [b"m".as_slice(), b"a", b"z", b"c"] {
            t.record_insert(key, Record::new(b"r"), OpKind::Insert, InsertFlags::empty());
        }
        let keys: Vec<&[u8]> = t.iter().map(|(k, _)| k.bytes.as_slice()).collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"c", b"m", b"z"]);
    }

    #[test]
    fn test_single_dupe_erase_keeps_key_visible() {
        let mut t = tree();
        t.record_insert(b"k", Record::new(b"r1"), OpKind::InsertDuplicate, InsertFlags::DUPLICATE);
        t.record_erase(b"k", Some(0), EraseFlags::empty());
        match t.lookup(b"k").unwrap().visibility() {
            Visibility::Record(r) => assert_eq!(r.data, b"r1"),
            _ => panic!("dupe erase must not hide the key"),
        }
    }
}
