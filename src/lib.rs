//! hamdb - embedded ordered key/value storage engine.
//!
//! A hamdb *environment* is a single file (or pure in-memory image)
//! holding up to a configured number of independent *databases*, each an
//! ordered map from byte-string keys to byte-string records backed by a
//! B+tree. Operations are point lookups, inserts with overwrite or
//! duplicate modes, deletes, ordered iteration via cursors, and
//! approximate-match queries. Transactions group operations atomically
//! and recover against a write-ahead log after a crash.

pub mod btree;
pub mod device;
pub mod env;
pub mod error;
pub mod filter;
pub mod log;
pub mod random;
pub mod storage;
pub mod txn;
pub mod types;

// Re-export the public surface.
pub use btree::check::EnumVisitor;
pub use btree::keys::{KeyCompare, LexicalCompare, PrefixCompare, RecnoCompare};
pub use env::db::{Cursor, Database};
pub use env::Environment;
pub use error::{Error, ErrorCode, Result};
pub use filter::{FilterChain, PageFilter};
pub use txn::Transaction;
pub use types::{
    ApproxFlags, CursorFlags, Dam, DbFlags, DbName, DbParams, EnvFlags, EnvParams, EraseFlags,
    FindFlags, InsertFlags, Key, Record, TxnFlags,
};
