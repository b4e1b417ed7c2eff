//! The block cache contract the index is layered on, plus the two provided
//! implementations: [`InMemory`] and [`MmapFile`].
//!
//! The index never touches a device directly. It sees an array of
//! fixed-size blocks addressed by `u32` block number, reads and writes
//! whole blocks, and tells the cache when it allocates or frees one. Block 0
//! is reserved for the superblock by the layer above; the cache itself does
//! not care.

mod memory;
mod mmap_file;

pub use memory::InMemory;
pub use mmap_file::MmapFile;

use crate::core::error::CacheError;

type Result<T> = std::result::Result<T, CacheError>;

/// A cache of fixed-size blocks backing a B-tree index.
///
/// A conforming implementation must guarantee that a `write_block` followed
/// by a `read_block` of the same block by the same owner observes the
/// written bytes, and that each block write is atomic.
pub trait BlockCache {
    /// The size in bytes of every block.
    fn block_size(&self) -> usize;

    /// The total number of blocks on the device, including block 0.
    fn num_blocks(&self) -> u32;

    /// Reads block `block` into `buf`. `buf` must be exactly
    /// [`block_size`](Self::block_size) bytes.
    fn read_block(&mut self, block: u32, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` to block `block`. `buf` must be exactly
    /// [`block_size`](Self::block_size) bytes.
    fn write_block(&mut self, block: u32, buf: &[u8]) -> Result<()>;

    /// Advisory: `block` has been taken off the free list.
    fn notify_allocate(&mut self, _block: u32) {}

    /// Advisory: `block` has been returned to the free list.
    fn notify_deallocate(&mut self, _block: u32) {}
}
