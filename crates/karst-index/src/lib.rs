//! B+ tree index for karst.
//!
//! An ordered map from fixed-width binary keys to row ids, stored one node
//! per page on top of the buffer pool:
//! - Leaf and internal node formats with packed key/value pairs
//! - Unique-key insert, remove with redistribute/coalesce rebalancing
//! - Forward iteration over the linked leaf chain
//! - Per-index root tracking through the shared index roots page

mod iterator;
mod key;
mod node;
mod roots;
mod tree;

pub use iterator::IndexIterator;
pub use key::KeyManager;
pub use node::{BTreeNode, BTreeNodeMut, InternalNode, LeafNode, NodeType, RawNode};
pub use roots::{ensure_index_roots, IndexRootsView, INDEX_ROOTS_PAGE_ID, MAX_INDEX_ROOTS};
pub use tree::BPlusTree;
