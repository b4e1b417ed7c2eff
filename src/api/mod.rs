//! The public face of the crate: [`BTreeIndex`] plus re-exports of the
//! cache contract and error types.

use std::io;

use crate::core::tree::Tree;

pub use crate::core::cache::{BlockCache, InMemory, MmapFile};
pub use crate::core::consts::SUPERBLOCK;
pub use crate::core::error::{CacheError, NodeError, TreeError};
pub use crate::core::tree::DisplayMode;

pub type Result<T> = std::result::Result<T, TreeError>;

/// A disk-oriented B-tree index: an ordered mapping from fixed-width byte
/// keys to fixed-width byte values, stored in fixed-size blocks through a
/// [`BlockCache`].
///
/// Keys order lexicographically over their raw bytes and are unique across
/// the index. All operations take `&mut self`: the index owns its cache and
/// is mutated by a single logical owner.
pub struct BTreeIndex<C: BlockCache> {
    tree: Tree<C>,
    // Accepted for interface compatibility; keys are always unique.
    #[allow(dead_code)]
    unique: bool,
}

impl<C: BlockCache> BTreeIndex<C> {
    /// Creates an unattached index for `key_size`-byte keys and
    /// `value_size`-byte values over `cache`.
    ///
    /// Panics if the cache block size cannot hold a node header. Call
    /// [`attach`](Self::attach) before any other operation.
    pub fn new(key_size: u16, value_size: u16, cache: C, unique: bool) -> Self {
        BTreeIndex {
            tree: Tree::new(key_size, value_size, cache),
            unique,
        }
    }

    /// Mounts the index whose superblock lives at `init_block` (must be
    /// [`SUPERBLOCK`], i.e. block 0). With `create`, formats the device
    /// first: superblock, an empty root at block 1, and all remaining
    /// blocks chained onto the free list.
    ///
    /// When attaching an existing device the on-disk geometry is
    /// authoritative; the key and value widths given to
    /// [`new`](Self::new) are only used for `create`.
    pub fn attach(&mut self, init_block: u32, create: bool) -> Result<()> {
        self.tree.attach(init_block, create)
    }

    /// Persists the superblock and returns its block number. The cache can
    /// be taken back with [`into_cache`](Self::into_cache) afterwards.
    pub fn detach(&mut self) -> Result<u32> {
        self.tree.detach()
    }

    /// Returns the value stored under `key`, or
    /// [`TreeError::KeyNotFound`].
    pub fn lookup(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        self.tree.lookup(key)
    }

    /// Inserts a record. Returns [`TreeError::AlreadyExists`] if the key is
    /// present and [`TreeError::NoSpace`] if the free list runs out while a
    /// split needs a block.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree.insert(key, value)
    }

    /// Overwrites the value stored under an existing `key` in place.
    pub fn update(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree.update(key, value)
    }

    /// Not supported; always returns [`TreeError::Unimplemented`].
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.tree.delete(key)
    }

    /// Writes a depth-first rendition of the tree to `w` in the requested
    /// format.
    pub fn display<W: io::Write>(&mut self, w: &mut W, mode: DisplayMode) -> Result<()> {
        self.tree.display(w, mode)
    }

    /// Verifies the structural invariants of the whole tree: strictly
    /// increasing keys inside every node and separator bounds across every
    /// parent/child edge.
    pub fn sanity_check(&mut self) -> Result<()> {
        self.tree.sanity_check()
    }

    pub fn cache(&self) -> &C {
        self.tree.cache()
    }

    pub fn cache_mut(&mut self) -> &mut C {
        self.tree.cache_mut()
    }

    pub fn into_cache(self) -> C {
        self.tree.into_cache()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_to_end_through_the_public_surface() {
        let cache = InMemory::new(64, 32);
        let mut index = BTreeIndex::new(4, 4, cache, true);
        index.attach(SUPERBLOCK, true).unwrap();

        index.insert(b"key1", b"val1").unwrap();
        index.insert(b"key2", b"val2").unwrap();
        assert_eq!(index.lookup(b"key1").unwrap(), b"val1");

        index.update(b"key1", b"VAL1").unwrap();
        assert_eq!(index.lookup(b"key1").unwrap(), b"VAL1");

        assert!(matches!(
            index.insert(b"key2", b"dupe"),
            Err(TreeError::AlreadyExists)
        ));
        assert!(matches!(index.delete(b"key1"), Err(TreeError::Unimplemented)));

        index.sanity_check().unwrap();
        let block = index.detach().unwrap();
        assert_eq!(block, SUPERBLOCK);
    }

    #[test]
    fn unique_flag_is_accepted_and_ignored() {
        let cache = InMemory::new(64, 16);
        let mut index = BTreeIndex::new(4, 4, cache, false);
        index.attach(SUPERBLOCK, true).unwrap();
        index.insert(b"aaaa", b"0001").unwrap();
        // Duplicates are rejected regardless of the flag.
        assert!(matches!(
            index.insert(b"aaaa", b"0002"),
            Err(TreeError::AlreadyExists)
        ));
    }
}
