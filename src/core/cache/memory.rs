use std::collections::HashSet;

use crate::core::cache::BlockCache;
use crate::core::error::CacheError;

type Result<T> = std::result::Result<T, CacheError>;

/// An in-memory block cache. Backed by a vector of boxed blocks.
///
/// Allocation notifications are tracked so tests can assert on which blocks
/// the index considers live.
pub struct InMemory {
    block_size: usize,
    blocks: Vec<Box<[u8]>>,
    allocated: HashSet<u32>,
}

impl InMemory {
    /// Creates a device of `num_blocks` zero-filled blocks of `block_size`
    /// bytes each.
    pub fn new(block_size: usize, num_blocks: u32) -> Self {
        InMemory {
            block_size,
            blocks: (0..num_blocks)
                .map(|_| vec![0u8; block_size].into_boxed_slice())
                .collect(),
            allocated: HashSet::new(),
        }
    }

    /// Whether `block` is currently marked allocated per the advisory
    /// notifications.
    pub fn is_allocated(&self, block: u32) -> bool {
        self.allocated.contains(&block)
    }

    /// How many blocks are currently marked allocated.
    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    fn check(&self, block: u32) -> Result<()> {
        if (block as usize) < self.blocks.len() {
            Ok(())
        } else {
            Err(CacheError::BlockOutOfRange {
                block,
                total: self.blocks.len() as u32,
            })
        }
    }
}

impl BlockCache for InMemory {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn num_blocks(&self) -> u32 {
        self.blocks.len() as u32
    }

    fn read_block(&mut self, block: u32, buf: &mut [u8]) -> Result<()> {
        self.check(block)?;
        assert_eq!(buf.len(), self.block_size);
        buf.copy_from_slice(&self.blocks[block as usize]);
        Ok(())
    }

    fn write_block(&mut self, block: u32, buf: &[u8]) -> Result<()> {
        self.check(block)?;
        assert_eq!(buf.len(), self.block_size);
        self.blocks[block as usize].copy_from_slice(buf);
        Ok(())
    }

    fn notify_allocate(&mut self, block: u32) {
        self.allocated.insert(block);
    }

    fn notify_deallocate(&mut self, block: u32) {
        self.allocated.remove(&block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_what_was_written() {
        let mut cache = InMemory::new(64, 4);
        let mut block = vec![0u8; 64];
        block[10..14].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        cache.write_block(2, &block).unwrap();

        let mut out = vec![0u8; 64];
        cache.read_block(2, &mut out).unwrap();
        assert_eq!(out, block);

        cache.read_block(0, &mut out).unwrap();
        assert_eq!(out, vec![0u8; 64], "untouched blocks stay zeroed");
    }

    #[test]
    fn out_of_range_block_is_rejected() {
        let mut cache = InMemory::new(64, 4);
        let mut buf = vec![0u8; 64];
        assert!(matches!(
            cache.read_block(4, &mut buf),
            Err(CacheError::BlockOutOfRange { block: 4, total: 4 })
        ));
        assert!(matches!(
            cache.write_block(9, &buf),
            Err(CacheError::BlockOutOfRange { block: 9, .. })
        ));
    }

    #[test]
    fn notifications_are_tracked() {
        let mut cache = InMemory::new(64, 4);
        cache.notify_allocate(1);
        cache.notify_allocate(2);
        assert!(cache.is_allocated(1));
        assert_eq!(cache.allocated_count(), 2);
        cache.notify_deallocate(1);
        assert!(!cache.is_allocated(1));
        assert_eq!(cache.allocated_count(), 1);
    }
}
