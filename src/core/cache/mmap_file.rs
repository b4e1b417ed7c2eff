use std::{
    fs::{File, OpenOptions},
    path::Path,
};

use memmap2::{MmapMut, MmapOptions};

use crate::core::cache::BlockCache;
use crate::core::error::CacheError;

type Result<T> = std::result::Result<T, CacheError>;

/// A file-backed block cache over a mutable memory map.
///
/// The file is an array of fixed-size blocks and nothing else; all index
/// metadata lives inside the blocks themselves. Every block write is flushed
/// to the file so that each write is atomic on its own.
pub struct MmapFile {
    block_size: usize,
    _file: File,
    map: MmapMut,
}

impl MmapFile {
    /// Creates (or truncates) a device of `num_blocks` blocks of
    /// `block_size` bytes at `path`.
    pub fn create<P: AsRef<Path>>(path: P, block_size: usize, num_blocks: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len((block_size as u64) * u64::from(num_blocks))?;
        // Safety: it is assumed that no other process has a mutable mapping
        // to the same file.
        let map = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(MmapFile {
            block_size,
            _file: file,
            map,
        })
    }

    /// Opens an existing device at `path`, deriving the block count from the
    /// file length.
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len() as usize;
        if file_len < 2 * block_size {
            return Err(CacheError::InvalidDevice(
                "file must hold at least a superblock and a root block".into(),
            ));
        }
        if file_len % block_size != 0 {
            return Err(CacheError::InvalidDevice(
                format!("file length {file_len} is not a multiple of the block size {block_size}")
                    .into(),
            ));
        }
        // Safety: it is assumed that no other process has a mutable mapping
        // to the same file.
        let map = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(MmapFile {
            block_size,
            _file: file,
            map,
        })
    }

    fn check(&self, block: u32) -> Result<usize> {
        let total = self.num_blocks();
        if block < total {
            Ok(block as usize * self.block_size)
        } else {
            Err(CacheError::BlockOutOfRange { block, total })
        }
    }
}

impl BlockCache for MmapFile {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn num_blocks(&self) -> u32 {
        (self.map.len() / self.block_size) as u32
    }

    fn read_block(&mut self, block: u32, buf: &mut [u8]) -> Result<()> {
        let offset = self.check(block)?;
        assert_eq!(buf.len(), self.block_size);
        buf.copy_from_slice(&self.map[offset..offset + self.block_size]);
        Ok(())
    }

    fn write_block(&mut self, block: u32, buf: &[u8]) -> Result<()> {
        let offset = self.check(block)?;
        assert_eq!(buf.len(), self.block_size);
        self.map[offset..offset + self.block_size].copy_from_slice(buf);
        self.map.flush_range(offset, self.block_size)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn create_write_reopen_read() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();
        let pattern = [0xFA, 0xCE, 0xB0, 0x0C];

        {
            let mut cache = MmapFile::create(path, 128, 8).unwrap();
            assert_eq!(cache.num_blocks(), 8);
            let mut block = vec![0u8; 128];
            block[40..44].copy_from_slice(&pattern);
            cache.write_block(3, &block).unwrap();
        }

        let mut cache = MmapFile::open(path, 128).unwrap();
        assert_eq!(cache.num_blocks(), 8);
        let mut block = vec![0u8; 128];
        cache.read_block(3, &mut block).unwrap();
        assert_eq!(&block[40..44], &pattern);
    }

    #[test]
    fn open_rejects_short_file() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), vec![0u8; 100]).unwrap();
        let result = MmapFile::open(temp_file.path(), 128);
        assert!(matches!(result, Err(CacheError::InvalidDevice(_))));
    }

    #[test]
    fn open_rejects_ragged_file() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), vec![0u8; 128 * 4 + 1]).unwrap();
        let result = MmapFile::open(temp_file.path(), 128);
        assert!(matches!(result, Err(CacheError::InvalidDevice(_))));
    }

    #[test]
    fn out_of_range_block_is_rejected() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut cache = MmapFile::create(temp_file.path(), 128, 4).unwrap();
        let mut buf = vec![0u8; 128];
        assert!(matches!(
            cache.read_block(4, &mut buf),
            Err(CacheError::BlockOutOfRange { block: 4, total: 4 })
        ));
    }
}
