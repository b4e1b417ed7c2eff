//! The on-block node codec.
//!
//! A [`Node`] owns the full byte buffer of one block: the fixed header
//! described in [`crate::core::consts`] followed by the payload. The payload
//! layout depends on the node type.
//!
//! Leaf payload: a reserved leading pointer slot, then `numkeys`
//! contiguous fixed-width records.
//!
//! ```ignore
//! | ptr0 | key val | key val | ... | unused |
//! |  4B  | ks + vs | ks + vs |     |        |
//! ```
//!
//! Interior (and root) payload: `numkeys + 1` child pointers interleaved
//! with `numkeys` separator keys.
//!
//! ```ignore
//! | ptr0 | key0 | ptr1 | key1 | ... | ptrN | unused |
//! |  4B  |  ks  |  4B  |  ks  |     |  4B  |        |
//! ```
//!
//! The superblock is a node like any other; its payload starts with a seal
//! (a 16-byte format signature and a CRC-32 checksum of the header and
//! signature) that is stamped on serialize and verified on attach.
//!
//! Every accessor bounds-checks its slot index against `numkeys` and its
//! byte range against the payload, so no slot operation can overflow the
//! block. The `resolve_*` functions expose the raw payload offsets for the
//! bulk range moves used by insertion and splitting.

use std::ops::Range;
use std::sync::OnceLock;

use crc::Crc;

use crate::core::cache::BlockCache;
use crate::core::consts;
use crate::core::error::{CacheError, NodeError};

type Result<T> = std::result::Result<T, NodeError>;

/// Identifies the on-device format; bumped if the layout ever changes.
pub(crate) const SIGNATURE: [u8; 16] = *b"blocktree-index1";

// A Crc singleton to avoid rebuilding the lookup table for every checksum.
static CRC_32_CKSUM: OnceLock<Crc<u32>> = OnceLock::new();

fn crc32(bytes: &[u8]) -> u32 {
    CRC_32_CKSUM
        .get_or_init(|| Crc::<u32, crc::Table<1>>::new(&crc::CRC_32_CKSUM))
        .checksum(bytes)
}

/// An enum representing a block's node type tag.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeType {
    Superblock = 1,
    Root = 2,
    Interior = 3,
    Leaf = 4,
    Unallocated = 5,
}

impl TryFrom<u8> for NodeType {
    type Error = NodeError;
    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(NodeType::Superblock),
            2 => Ok(NodeType::Root),
            3 => Ok(NodeType::Interior),
            4 => Ok(NodeType::Leaf),
            5 => Ok(NodeType::Unallocated),
            _ => Err(NodeError::UnexpectedNodeType(value)),
        }
    }
}

/// One block, decoded far enough to be addressed slot by slot.
#[derive(Clone)]
pub(crate) struct Node {
    buf: Box<[u8]>,
}

impl Node {
    /// Creates a zero-filled node of `block_size` bytes with the header
    /// fields set.
    ///
    /// Panics if `block_size` cannot hold the header and the superblock
    /// seal; callers validate device geometry before building nodes.
    pub(crate) fn new(node_type: NodeType, key_size: u16, value_size: u16, block_size: u32) -> Node {
        assert!(
            block_size as usize >= consts::MIN_BLOCK_SIZE,
            "block size {block_size} below minimum {}",
            consts::MIN_BLOCK_SIZE
        );
        let mut node = Node {
            buf: vec![0u8; block_size as usize].into_boxed_slice(),
        };
        node.set_node_type(node_type);
        node.buf[consts::KEY_SIZE_OFFSET..consts::KEY_SIZE_OFFSET + 2]
            .copy_from_slice(&key_size.to_le_bytes());
        node.buf[consts::VALUE_SIZE_OFFSET..consts::VALUE_SIZE_OFFSET + 2]
            .copy_from_slice(&value_size.to_le_bytes());
        node.buf[consts::BLOCK_SIZE_OFFSET..consts::BLOCK_SIZE_OFFSET + 4]
            .copy_from_slice(&block_size.to_le_bytes());
        node
    }

    /// Reads block `block` from the cache.
    pub(crate) fn unserialize<C: BlockCache>(
        cache: &mut C,
        block: u32,
    ) -> std::result::Result<Node, CacheError> {
        let mut buf = vec![0u8; cache.block_size()].into_boxed_slice();
        cache.read_block(block, &mut buf)?;
        Ok(Node { buf })
    }

    /// Writes the node to block `block` through the cache. Superblocks get
    /// their seal stamped first, so the in-memory copy always matches the
    /// bytes on the device afterwards.
    pub(crate) fn serialize<C: BlockCache>(
        &mut self,
        cache: &mut C,
        block: u32,
    ) -> std::result::Result<(), CacheError> {
        if self.buf[consts::NODE_TYPE_OFFSET] == NodeType::Superblock as u8 {
            self.stamp_seal();
        }
        cache.write_block(block, &self.buf)
    }

    #[cfg(test)]
    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    // Header accessors.

    pub(crate) fn get_node_type(&self) -> Result<NodeType> {
        NodeType::try_from(self.buf[consts::NODE_TYPE_OFFSET])
    }

    pub(crate) fn set_node_type(&mut self, node_type: NodeType) {
        self.buf[consts::NODE_TYPE_OFFSET] = node_type as u8;
    }

    pub(crate) fn get_key_size(&self) -> usize {
        u16::from_le_bytes([
            self.buf[consts::KEY_SIZE_OFFSET],
            self.buf[consts::KEY_SIZE_OFFSET + 1],
        ]) as usize
    }

    pub(crate) fn get_value_size(&self) -> usize {
        u16::from_le_bytes([
            self.buf[consts::VALUE_SIZE_OFFSET],
            self.buf[consts::VALUE_SIZE_OFFSET + 1],
        ]) as usize
    }

    pub(crate) fn get_block_size(&self) -> usize {
        u32::from_le_bytes([
            self.buf[consts::BLOCK_SIZE_OFFSET],
            self.buf[consts::BLOCK_SIZE_OFFSET + 1],
            self.buf[consts::BLOCK_SIZE_OFFSET + 2],
            self.buf[consts::BLOCK_SIZE_OFFSET + 3],
        ]) as usize
    }

    pub(crate) fn get_root_block(&self) -> u32 {
        u32::from_le_bytes([
            self.buf[consts::ROOT_BLOCK_OFFSET],
            self.buf[consts::ROOT_BLOCK_OFFSET + 1],
            self.buf[consts::ROOT_BLOCK_OFFSET + 2],
            self.buf[consts::ROOT_BLOCK_OFFSET + 3],
        ])
    }

    pub(crate) fn set_root_block(&mut self, block: u32) {
        self.buf[consts::ROOT_BLOCK_OFFSET..consts::ROOT_BLOCK_OFFSET + 4]
            .copy_from_slice(&block.to_le_bytes());
    }

    pub(crate) fn get_free_list(&self) -> u32 {
        u32::from_le_bytes([
            self.buf[consts::FREE_LIST_OFFSET],
            self.buf[consts::FREE_LIST_OFFSET + 1],
            self.buf[consts::FREE_LIST_OFFSET + 2],
            self.buf[consts::FREE_LIST_OFFSET + 3],
        ])
    }

    pub(crate) fn set_free_list(&mut self, block: u32) {
        self.buf[consts::FREE_LIST_OFFSET..consts::FREE_LIST_OFFSET + 4]
            .copy_from_slice(&block.to_le_bytes());
    }

    pub(crate) fn get_num_keys(&self) -> usize {
        u16::from_le_bytes([
            self.buf[consts::NUM_KEYS_OFFSET],
            self.buf[consts::NUM_KEYS_OFFSET + 1],
        ]) as usize
    }

    pub(crate) fn set_num_keys(&mut self, n: usize) {
        self.buf[consts::NUM_KEYS_OFFSET..consts::NUM_KEYS_OFFSET + 2]
            .copy_from_slice(&(n as u16).to_le_bytes());
    }

    // Payload geometry.

    fn payload(&self) -> &[u8] {
        &self.buf[consts::HEADER_SIZE..]
    }

    fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[consts::HEADER_SIZE..]
    }

    /// How many `(key, value)` records fit in this block as a leaf.
    pub(crate) fn get_num_slots_as_leaf(&self) -> usize {
        (self.payload().len() - consts::PTR_SIZE) / (self.get_key_size() + self.get_value_size())
    }

    /// How many separator keys fit in this block as an interior node.
    pub(crate) fn get_num_slots_as_interior(&self) -> usize {
        (self.payload().len() - consts::PTR_SIZE) / (self.get_key_size() + consts::PTR_SIZE)
    }

    /// Payload offset of the `i`th key.
    pub(crate) fn resolve_key(&self, i: usize) -> Result<usize> {
        match self.get_node_type()? {
            NodeType::Leaf => {
                Ok(consts::PTR_SIZE + i * (self.get_key_size() + self.get_value_size()))
            }
            NodeType::Root | NodeType::Interior => {
                Ok(i * (self.get_key_size() + consts::PTR_SIZE) + consts::PTR_SIZE)
            }
            t => Err(NodeError::UnexpectedNodeType(t as u8)),
        }
    }

    /// Payload offset of the `i`th value (leaf only).
    pub(crate) fn resolve_val(&self, i: usize) -> Result<usize> {
        match self.get_node_type()? {
            NodeType::Leaf => Ok(consts::PTR_SIZE
                + i * (self.get_key_size() + self.get_value_size())
                + self.get_key_size()),
            t => Err(NodeError::UnexpectedNodeType(t as u8)),
        }
    }

    /// Payload offset of the `i`th `(key, value)` record (leaf only).
    pub(crate) fn resolve_keyval(&self, i: usize) -> Result<usize> {
        match self.get_node_type()? {
            NodeType::Leaf => {
                Ok(consts::PTR_SIZE + i * (self.get_key_size() + self.get_value_size()))
            }
            t => Err(NodeError::UnexpectedNodeType(t as u8)),
        }
    }

    /// Payload offset of the `i`th child pointer. For a leaf only the
    /// reserved slot 0 exists.
    pub(crate) fn resolve_ptr(&self, i: usize) -> Result<usize> {
        match self.get_node_type()? {
            NodeType::Leaf => {
                if i != 0 {
                    return Err(NodeError::SlotOutOfRange { index: i, limit: 0 });
                }
                Ok(0)
            }
            NodeType::Root | NodeType::Interior => {
                Ok(i * (self.get_key_size() + consts::PTR_SIZE))
            }
            t => Err(NodeError::UnexpectedNodeType(t as u8)),
        }
    }

    // Slot accessors.

    pub(crate) fn get_key(&self, i: usize) -> Result<&[u8]> {
        self.check_key_slot(i, self.get_num_keys())?;
        let offset = self.resolve_key(i)?;
        let end = self.checked_end(i, offset, self.get_key_size())?;
        Ok(&self.payload()[offset..end])
    }

    pub(crate) fn set_key(&mut self, i: usize, key: &[u8]) -> Result<()> {
        if key.len() != self.get_key_size() {
            return Err(NodeError::KeyLength {
                got: key.len(),
                want: self.get_key_size(),
            });
        }
        self.check_key_slot(i, self.get_num_keys())?;
        let offset = self.resolve_key(i)?;
        let end = self.checked_end(i, offset, key.len())?;
        self.payload_mut()[offset..end].copy_from_slice(key);
        Ok(())
    }

    pub(crate) fn get_val(&self, i: usize) -> Result<&[u8]> {
        self.check_key_slot(i, self.get_num_keys())?;
        let offset = self.resolve_val(i)?;
        let end = self.checked_end(i, offset, self.get_value_size())?;
        Ok(&self.payload()[offset..end])
    }

    pub(crate) fn set_val(&mut self, i: usize, val: &[u8]) -> Result<()> {
        if val.len() != self.get_value_size() {
            return Err(NodeError::ValueLength {
                got: val.len(),
                want: self.get_value_size(),
            });
        }
        self.check_key_slot(i, self.get_num_keys())?;
        let offset = self.resolve_val(i)?;
        let end = self.checked_end(i, offset, val.len())?;
        self.payload_mut()[offset..end].copy_from_slice(val);
        Ok(())
    }

    pub(crate) fn get_ptr(&self, i: usize) -> Result<u32> {
        self.check_ptr_slot(i)?;
        let offset = self.resolve_ptr(i)?;
        let end = self.checked_end(i, offset, consts::PTR_SIZE)?;
        let p = &self.payload()[offset..end];
        Ok(u32::from_le_bytes([p[0], p[1], p[2], p[3]]))
    }

    pub(crate) fn set_ptr(&mut self, i: usize, ptr: u32) -> Result<()> {
        self.check_ptr_slot(i)?;
        let offset = self.resolve_ptr(i)?;
        let end = self.checked_end(i, offset, consts::PTR_SIZE)?;
        self.payload_mut()[offset..end].copy_from_slice(&ptr.to_le_bytes());
        Ok(())
    }

    /// Moves the payload byte range `src` to start at `dst`, memmove style.
    /// Ranges come from the `resolve_*` offsets.
    pub(crate) fn move_slots(&mut self, src: Range<usize>, dst: usize) {
        self.payload_mut().copy_within(src, dst);
    }

    // The superblock seal.

    fn seal_checksum(&self) -> u32 {
        crc32(&self.buf[..consts::HEADER_SIZE + SIGNATURE.len()])
    }

    fn stamp_seal(&mut self) {
        let sig_end = SIGNATURE.len();
        self.payload_mut()[..sig_end].copy_from_slice(&SIGNATURE);
        let checksum = self.seal_checksum();
        self.payload_mut()[sig_end..consts::SEAL_SIZE].copy_from_slice(&checksum.to_le_bytes());
    }

    /// Checks that this node is a sealed superblock: right type tag, known
    /// signature, and a checksum matching the header.
    pub(crate) fn verify_superblock(&self) -> Result<()> {
        match self.get_node_type()? {
            NodeType::Superblock => {}
            t => return Err(NodeError::UnexpectedNodeType(t as u8)),
        }
        let sig_end = SIGNATURE.len();
        if self.payload()[..sig_end] != SIGNATURE {
            return Err(NodeError::CorruptSuperblock);
        }
        let p = &self.payload()[sig_end..consts::SEAL_SIZE];
        let stored = u32::from_le_bytes([p[0], p[1], p[2], p[3]]);
        if stored != self.seal_checksum() {
            return Err(NodeError::CorruptSuperblock);
        }
        Ok(())
    }

    fn check_key_slot(&self, i: usize, limit: usize) -> Result<()> {
        if i < limit {
            Ok(())
        } else {
            Err(NodeError::SlotOutOfRange { index: i, limit })
        }
    }

    fn check_ptr_slot(&self, i: usize) -> Result<()> {
        match self.get_node_type()? {
            // The reserved leaf slot; resolve_ptr enforces i == 0.
            NodeType::Leaf => Ok(()),
            NodeType::Root | NodeType::Interior => {
                let limit = self.get_num_keys() + 1;
                if i < limit {
                    Ok(())
                } else {
                    Err(NodeError::SlotOutOfRange { index: i, limit })
                }
            }
            t => Err(NodeError::UnexpectedNodeType(t as u8)),
        }
    }

    fn checked_end(&self, i: usize, offset: usize, len: usize) -> Result<usize> {
        let end = offset + len;
        if end <= self.payload().len() {
            Ok(end)
        } else {
            Err(NodeError::SlotOutOfRange {
                index: i,
                limit: self.get_num_keys(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::InMemory;

    // 48-byte blocks with 4-byte keys and values: 29 payload bytes, so
    // 3 leaf records and 3 interior separators per node.
    const BLOCK_SIZE: u32 = 48;

    fn leaf() -> Node {
        Node::new(NodeType::Leaf, 4, 4, BLOCK_SIZE)
    }

    fn interior() -> Node {
        Node::new(NodeType::Interior, 4, 4, BLOCK_SIZE)
    }

    #[test]
    fn header_fields_round_trip() {
        let mut node = Node::new(NodeType::Root, 4, 8, 64);
        node.set_root_block(7);
        node.set_free_list(9);
        node.set_num_keys(3);
        assert_eq!(node.get_node_type().unwrap(), NodeType::Root);
        assert_eq!(node.get_key_size(), 4);
        assert_eq!(node.get_value_size(), 8);
        assert_eq!(node.get_block_size(), 64);
        assert_eq!(node.get_root_block(), 7);
        assert_eq!(node.get_free_list(), 9);
        assert_eq!(node.get_num_keys(), 3);
    }

    #[test]
    fn capacity_from_geometry() {
        let node = leaf();
        assert_eq!(node.get_num_slots_as_leaf(), 3);
        assert_eq!(node.get_num_slots_as_interior(), 3);
    }

    #[test]
    fn serialize_round_trips_byte_exact() {
        let mut cache = InMemory::new(BLOCK_SIZE as usize, 4);
        let mut node = leaf();
        node.set_num_keys(2);
        node.set_key(0, b"aaaa").unwrap();
        node.set_val(0, b"0001").unwrap();
        node.set_key(1, b"bbbb").unwrap();
        node.set_val(1, b"0002").unwrap();
        node.serialize(&mut cache, 3).unwrap();

        let back = Node::unserialize(&mut cache, 3).unwrap();
        assert_eq!(back.as_bytes(), node.as_bytes());
        assert_eq!(back.get_key(1).unwrap(), b"bbbb");
        assert_eq!(back.get_val(0).unwrap(), b"0001");
    }

    #[test]
    fn leaf_slot_accessors_bounds() {
        let mut node = leaf();
        node.set_num_keys(1);
        node.set_key(0, b"aaaa").unwrap();
        assert!(matches!(
            node.get_key(1),
            Err(NodeError::SlotOutOfRange { index: 1, limit: 1 })
        ));
        assert!(matches!(
            node.set_val(2, b"zzzz"),
            Err(NodeError::SlotOutOfRange { index: 2, limit: 1 })
        ));
        // The reserved leaf pointer slot is index 0 only.
        node.set_ptr(0, 11).unwrap();
        assert_eq!(node.get_ptr(0).unwrap(), 11);
        assert!(matches!(
            node.get_ptr(1),
            Err(NodeError::SlotOutOfRange { index: 1, limit: 0 })
        ));
    }

    #[test]
    fn interior_ptr_slots_allow_num_keys_plus_one() {
        let mut node = interior();
        node.set_num_keys(2);
        node.set_key(0, b"gggg").unwrap();
        node.set_key(1, b"nnnn").unwrap();
        for i in 0..=2 {
            node.set_ptr(i, 10 + i as u32).unwrap();
        }
        assert_eq!(node.get_ptr(2).unwrap(), 12);
        assert!(matches!(
            node.get_ptr(3),
            Err(NodeError::SlotOutOfRange { index: 3, limit: 3 })
        ));
        // Values are a leaf concept.
        assert!(matches!(
            node.get_val(0),
            Err(NodeError::UnexpectedNodeType(_))
        ));
    }

    #[test]
    fn wrong_width_arguments_are_rejected() {
        let mut node = leaf();
        node.set_num_keys(1);
        assert!(matches!(
            node.set_key(0, b"toolong!"),
            Err(NodeError::KeyLength { got: 8, want: 4 })
        ));
        assert!(matches!(
            node.set_val(0, b"xy"),
            Err(NodeError::ValueLength { got: 2, want: 4 })
        ));
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        let mut cache = InMemory::new(BLOCK_SIZE as usize, 2);
        let mut node = leaf();
        node.serialize(&mut cache, 1).unwrap();
        let mut raw = vec![0u8; BLOCK_SIZE as usize];
        cache.read_block(1, &mut raw).unwrap();
        raw[0] = 0xAB;
        cache.write_block(1, &raw).unwrap();
        let node = Node::unserialize(&mut cache, 1).unwrap();
        assert!(matches!(
            node.get_node_type(),
            Err(NodeError::UnexpectedNodeType(0xAB))
        ));
    }

    #[test]
    fn superblock_seal_round_trip_and_corruption() {
        let mut cache = InMemory::new(BLOCK_SIZE as usize, 2);
        let mut superblock = Node::new(NodeType::Superblock, 4, 4, BLOCK_SIZE);
        superblock.set_root_block(1);
        superblock.set_free_list(2);
        superblock.serialize(&mut cache, 0).unwrap();

        let back = Node::unserialize(&mut cache, 0).unwrap();
        back.verify_superblock().unwrap();

        // Flip a header bit on the device; the checksum no longer matches.
        let mut raw = vec![0u8; BLOCK_SIZE as usize];
        cache.read_block(0, &mut raw).unwrap();
        raw[consts::ROOT_BLOCK_OFFSET] ^= 0xFF;
        cache.write_block(0, &raw).unwrap();
        let tampered = Node::unserialize(&mut cache, 0).unwrap();
        assert!(matches!(
            tampered.verify_superblock(),
            Err(NodeError::CorruptSuperblock)
        ));
    }

    #[test]
    fn move_slots_shifts_records() {
        let mut node = leaf();
        node.set_num_keys(2);
        node.set_key(0, b"aaaa").unwrap();
        node.set_val(0, b"0001").unwrap();
        node.set_key(1, b"cccc").unwrap();
        node.set_val(1, b"0003").unwrap();

        // Open slot 0 by shifting both records one slot right.
        let src = node.resolve_keyval(0).unwrap()..node.resolve_keyval(2).unwrap();
        let dst = node.resolve_keyval(1).unwrap();
        node.set_num_keys(3);
        node.move_slots(src, dst);
        node.set_key(0, b"0000").unwrap();
        node.set_val(0, b"zero").unwrap();

        assert_eq!(node.get_key(0).unwrap(), b"0000");
        assert_eq!(node.get_key(1).unwrap(), b"aaaa");
        assert_eq!(node.get_val(2).unwrap(), b"0003");
    }
}
