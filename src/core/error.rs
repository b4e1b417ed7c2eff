//! Errors returned by functions in the [`crate::core`] module.

use std::{io, rc::Rc};

/// An error type for `mod node`: slot-level codec failures.
#[derive(thiserror::Error, Debug)]
pub enum NodeError {
    #[error("slot index {index} out of range (limit {limit})")]
    SlotOutOfRange { index: usize, limit: usize },
    #[error("unexpected node type tag: {0}")]
    UnexpectedNodeType(u8),
    #[error("key length {got} does not match index key size {want}")]
    KeyLength { got: usize, want: usize },
    #[error("value length {got} does not match index value size {want}")]
    ValueLength { got: usize, want: usize },
    #[error("superblock signature or checksum mismatch")]
    CorruptSuperblock,
}

/// An error type for `mod cache`.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("block {block} out of range (device has {total} blocks)")]
    BlockOutOfRange { block: u32, total: u32 },
    #[error("invalid device: {0}")]
    InvalidDevice(Rc<str>),
}

/// An error type for `mod tree` and the public index API.
#[derive(thiserror::Error, Debug)]
pub enum TreeError {
    #[error("node error: {0}")]
    Node(#[from] NodeError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("key not found")]
    KeyNotFound,
    #[error("key already exists")]
    AlreadyExists,
    #[error("free list exhausted")]
    NoSpace,
    #[error("structural invariant violated: {0}")]
    Insane(&'static str),
    #[error("operation not implemented")]
    Unimplemented,
}
