//! # blocktree
//!
//! A disk-oriented B-tree index: a persistent ordered mapping from
//! fixed-width byte keys to fixed-width byte values, stored as a tree of
//! fixed-size blocks over a block-addressable cache.
//!
//! The index supports point lookup, insertion (with splits propagating up
//! to a newly allocated root), in-place update, ordered traversal, and a
//! structural sanity check. Free blocks are kept on a singly linked chain
//! threaded through the blocks themselves and anchored in the superblock at
//! block 0. Any [`BlockCache`] implementation can back the index; the crate
//! ships an in-memory one and a file-backed one.
//!
//! ## Example
//!
//! ```rust
//! use blocktree::{BTreeIndex, DisplayMode, InMemory, Result, SUPERBLOCK};
//!
//! fn main() -> Result<()> {
//!     // 4-byte keys, 4-byte values, 64-byte blocks.
//!     let cache = InMemory::new(64, 32);
//!     let mut index = BTreeIndex::new(4, 4, cache, true);
//!     index.attach(SUPERBLOCK, true)?;
//!
//!     index.insert(b"key1", b"val1")?;
//!     index.insert(b"key0", b"val0")?;
//!     assert_eq!(index.lookup(b"key1")?, b"val1");
//!
//!     // Keys come back in lexicographic order.
//!     let mut listing = Vec::new();
//!     index.display(&mut listing, DisplayMode::SortedKeyVal)?;
//!     assert_eq!(listing, b"(key0,val0)\n(key1,val1)\n");
//!
//!     index.detach()?;
//!     Ok(())
//! }
//! ```
mod api;
mod core;

pub use api::*;
