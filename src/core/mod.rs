//! The `core` module contains the data types and functions used for
//! manipulating the B-tree index stored in fixed-size blocks.
//!
//! [`cache`] defines the block cache contract the tree is layered on,
//! [`node`] is the on-block codec, [`free_list`] manages the chain of
//! unallocated blocks, and [`tree`] implements the index operations.
pub(crate) mod cache;
pub(crate) mod consts;
pub(crate) mod error;
pub(crate) mod free_list;
pub(crate) mod node;
pub(crate) mod tree;
