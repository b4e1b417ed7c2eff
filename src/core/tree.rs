//! The index manager: superblock lifecycle, recursive descent for lookup
//! and update, split-on-full insertion with median promotion, traversal,
//! and the structural sanity check.
//!
//! The tree is mutated in place by a single logical owner. Nodes are never
//! held across calls; every operation re-reads each block it touches
//! through the cache, so the cost of an operation is bounded by the tree
//! height. The superblock is the single point of truth for the root block
//! and the free-list head and is rewritten after any mutation that changes
//! either.
//!
//! Ordering of writes: insertion serializes child blocks before touching
//! parent pointers, the allocator persists the superblock as part of every
//! chain mutation, and a root split writes the new root before repointing
//! the superblock at it, so a failure partway through leaves a tree that is
//! still readable from the old root.

use std::io;

use crate::core::cache::BlockCache;
use crate::core::consts;
use crate::core::error::{NodeError, TreeError};
use crate::core::free_list;
use crate::core::node::{Node, NodeType};

type Result<T> = std::result::Result<T, TreeError>;

/// Output formats for the display operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayMode {
    /// One node per line, pre-order, prefixed by block number.
    Depth,
    /// Graphviz DOT: per-node labels plus `parent -> child` edges.
    DepthDot,
    /// One `(key,value)` pair per line, in key order.
    SortedKeyVal,
}

/// A B-tree index over a block cache. See the crate docs for the format.
pub(crate) struct Tree<C: BlockCache> {
    cache: C,
    superblock: Node,
    superblock_index: u32,
}

impl<C: BlockCache> Tree<C> {
    /// Creates an unattached index manager for `key_size`-byte keys and
    /// `value_size`-byte values over `cache`.
    ///
    /// Panics if the cache block size cannot hold a node header; anything
    /// subtler is reported by [`Tree::attach`].
    pub(crate) fn new(key_size: u16, value_size: u16, cache: C) -> Self {
        let block_size = cache.block_size() as u32;
        Tree {
            superblock: Node::new(NodeType::Superblock, key_size, value_size, block_size),
            superblock_index: consts::SUPERBLOCK,
            cache,
        }
    }

    pub(crate) fn cache(&self) -> &C {
        &self.cache
    }

    pub(crate) fn cache_mut(&mut self) -> &mut C {
        &mut self.cache
    }

    pub(crate) fn into_cache(self) -> C {
        self.cache
    }

    #[cfg(test)]
    pub(crate) fn superblock(&self) -> &Node {
        &self.superblock
    }

    /// Mounts the index. With `create`, first formats the device: a sealed
    /// superblock at block 0, an empty root at block 1, and every remaining
    /// block chained onto the free list.
    pub(crate) fn attach(&mut self, init_block: u32, create: bool) -> Result<()> {
        if init_block != consts::SUPERBLOCK {
            return Err(TreeError::Insane("superblock must live at block 0"));
        }
        self.superblock_index = init_block;

        if create {
            self.create_device()?;
        }

        // Mounting is then just a matter of reading the superblock back.
        let superblock = self.read_node(init_block)?;
        superblock.verify_superblock()?;
        if superblock.get_block_size() != self.cache.block_size() {
            return Err(TreeError::Insane(
                "superblock block size does not match the cache",
            ));
        }
        self.superblock = superblock;
        Ok(())
    }

    fn create_device(&mut self) -> Result<()> {
        let num_blocks = self.cache.num_blocks();
        if num_blocks < 2 {
            return Err(TreeError::Insane(
                "device too small for a superblock and a root",
            ));
        }
        // With fewer than 3 slots a split could promote a node's largest
        // key, colliding with the separator already in the parent.
        if self.superblock.get_num_slots_as_leaf() < 3
            || self.superblock.get_num_slots_as_interior() < 3
        {
            return Err(TreeError::Insane(
                "block size too small for the key and value widths",
            ));
        }
        let key_size = self.superblock.get_key_size() as u16;
        let value_size = self.superblock.get_value_size() as u16;
        let block_size = self.cache.block_size() as u32;
        let root_block = 1u32;
        let free_head = if num_blocks > 2 { 2 } else { 0 };

        let mut superblock = Node::new(NodeType::Superblock, key_size, value_size, block_size);
        superblock.set_root_block(root_block);
        superblock.set_free_list(free_head);
        self.cache.notify_allocate(consts::SUPERBLOCK);
        superblock.serialize(&mut self.cache, consts::SUPERBLOCK)?;

        let mut root = Node::new(NodeType::Root, key_size, value_size, block_size);
        root.set_root_block(root_block);
        root.set_free_list(free_head);
        self.cache.notify_allocate(root_block);
        root.serialize(&mut self.cache, root_block)?;

        for i in 2..num_blocks {
            let mut free = Node::new(NodeType::Unallocated, key_size, value_size, block_size);
            free.set_root_block(root_block);
            free.set_free_list(if i + 1 == num_blocks { 0 } else { i + 1 });
            free.serialize(&mut self.cache, i)?;
        }
        Ok(())
    }

    /// Persists the superblock and reports which block it lives at.
    pub(crate) fn detach(&mut self) -> Result<u32> {
        self.superblock
            .serialize(&mut self.cache, self.superblock_index)?;
        Ok(self.superblock_index)
    }

    /// Returns the value stored under `key`.
    pub(crate) fn lookup(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        self.check_key(key)?;
        let root = self.superblock.get_root_block();
        let found = self.lookup_or_update(root, key, None)?;
        Ok(found.expect("lookup descent returns a value on success"))
    }

    /// Overwrites the value stored under `key` in place.
    pub(crate) fn update(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_key(key)?;
        self.check_val(value)?;
        let root = self.superblock.get_root_block();
        self.lookup_or_update(root, key, Some(value))?;
        Ok(())
    }

    /// The shared descent for lookup and update. With `update = None` the
    /// matched value is returned; otherwise it is overwritten and the leaf
    /// rewritten.
    fn lookup_or_update(
        &mut self,
        block: u32,
        key: &[u8],
        update: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>> {
        let mut node = self.read_node(block)?;
        match node.get_node_type()? {
            NodeType::Root | NodeType::Interior => match child_for(&node, key)? {
                Some(child) => self.lookup_or_update(child, key, update),
                None => Err(TreeError::KeyNotFound),
            },
            NodeType::Leaf => {
                for i in 0..node.get_num_keys() {
                    if node.get_key(i)? != key {
                        continue;
                    }
                    return match update {
                        None => Ok(Some(node.get_val(i)?.to_vec())),
                        Some(value) => {
                            node.set_val(i, value)?;
                            node.serialize(&mut self.cache, block)?;
                            Ok(None)
                        }
                    };
                }
                Err(TreeError::KeyNotFound)
            }
            _ => Err(TreeError::Insane("descended into a non-tree block")),
        }
    }

    /// Inserts a new `(key, value)` record. Present keys are a conflict;
    /// splits propagate upward and may grow the tree through the root.
    pub(crate) fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_key(key)?;
        self.check_val(value)?;
        match self.lookup(key) {
            Ok(_) => return Err(TreeError::AlreadyExists),
            Err(TreeError::KeyNotFound) => {}
            Err(e) => return Err(e),
        }

        let root_block = self.superblock.get_root_block();
        let mut root = self.read_node(root_block)?;
        if root.get_num_keys() == 0 {
            // First ever insert: seed the root with this key as its only
            // separator and two fresh empty leaves. The record itself is
            // placed by the descent below.
            let left = free_list::allocate(&mut self.cache, &mut self.superblock)?;
            let right = free_list::allocate(&mut self.cache, &mut self.superblock)?;
            let mut leaf = Node::new(
                NodeType::Leaf,
                self.superblock.get_key_size() as u16,
                self.superblock.get_value_size() as u16,
                self.cache.block_size() as u32,
            );
            leaf.set_root_block(root_block);
            leaf.serialize(&mut self.cache, left)?;
            leaf.serialize(&mut self.cache, right)?;
            root.set_num_keys(1);
            root.set_key(0, key)?;
            root.set_ptr(0, left)?;
            root.set_ptr(1, right)?;
            root.serialize(&mut self.cache, root_block)?;
        }

        self.split_insert(root_block, key, value)?;

        let root = self.read_node(root_block)?;
        if is_full(&root)? {
            self.grow_root(root_block)?;
        }
        Ok(())
    }

    /// Recursive descent for insertion. After the recursion returns, the
    /// parent re-reads the child and splits it if the insertion filled it.
    fn split_insert(&mut self, block: u32, key: &[u8], value: &[u8]) -> Result<()> {
        let node = self.read_node(block)?;
        match node.get_node_type()? {
            NodeType::Root | NodeType::Interior => {
                let child = match child_for(&node, key)? {
                    Some(child) => child,
                    None => return Err(TreeError::Insane("interior node with no keys")),
                };
                self.split_insert(child, key, value)?;
                let child_node = self.read_node(child)?;
                if is_full(&child_node)? {
                    let (sibling, median) = self.split_node(child)?;
                    self.insert_separator(block, &median, sibling)?;
                }
                Ok(())
            }
            NodeType::Leaf => self.insert_record(block, key, value),
            _ => Err(TreeError::Insane("descended into a non-tree block")),
        }
    }

    /// Splits a full node, promoting a median key. The left half stays at
    /// `block`; the right half goes to a freshly allocated sibling.
    ///
    /// For a leaf the median is a copy of the last left-half key (the key
    /// itself stays in the left leaf, matching the `≤`-goes-left descent);
    /// for an interior node the median is lifted out entirely.
    fn split_node(&mut self, block: u32) -> Result<(u32, Vec<u8>)> {
        let mut left = self.read_node(block)?;
        let new_block = free_list::allocate(&mut self.cache, &mut self.superblock)?;
        let mut right = left.clone();
        let n = left.get_num_keys();
        let median = match left.get_node_type()? {
            NodeType::Leaf => {
                let left_n = n / 2 + 1;
                let right_n = n - left_n;
                let median = left.get_key(left_n - 1)?.to_vec();
                let src = right.resolve_keyval(left_n)?..right.resolve_keyval(n)?;
                let dst = right.resolve_keyval(0)?;
                right.move_slots(src, dst);
                left.set_num_keys(left_n);
                right.set_num_keys(right_n);
                median
            }
            NodeType::Root | NodeType::Interior => {
                if n < 2 {
                    return Err(TreeError::Insane("splitting an interior node with one key"));
                }
                let left_n = n / 2;
                let right_n = n - left_n - 1;
                let median = left.get_key(left_n)?.to_vec();
                // Keys and pointers from slot left_n + 1 onward, including
                // the trailing child pointer.
                let src = right.resolve_ptr(left_n + 1)?..right.resolve_ptr(n)? + consts::PTR_SIZE;
                let dst = right.resolve_ptr(0)?;
                right.move_slots(src, dst);
                left.set_num_keys(left_n);
                right.set_num_keys(right_n);
                median
            }
            _ => return Err(TreeError::Insane("splitting a non-tree block")),
        };
        left.serialize(&mut self.cache, block)?;
        right.serialize(&mut self.cache, new_block)?;
        Ok((new_block, median))
    }

    /// Splits a full root and writes a fresh one-key root above the halves,
    /// growing the tree by one level. The new root is written before the
    /// superblock is repointed at it.
    fn grow_root(&mut self, old_root: u32) -> Result<()> {
        let (sibling, median) = self.split_node(old_root)?;
        // The halves are ordinary interior nodes now.
        self.retype_block(old_root, NodeType::Interior)?;
        self.retype_block(sibling, NodeType::Interior)?;

        let new_root = free_list::allocate(&mut self.cache, &mut self.superblock)?;
        let mut root = Node::new(
            NodeType::Root,
            self.superblock.get_key_size() as u16,
            self.superblock.get_value_size() as u16,
            self.cache.block_size() as u32,
        );
        root.set_root_block(new_root);
        root.set_free_list(self.superblock.get_free_list());
        root.set_num_keys(1);
        root.set_key(0, &median)?;
        root.set_ptr(0, old_root)?;
        root.set_ptr(1, sibling)?;
        root.serialize(&mut self.cache, new_root)?;

        self.superblock.set_root_block(new_root);
        self.superblock
            .serialize(&mut self.cache, self.superblock_index)?;
        Ok(())
    }

    /// Inserts a record into a leaf at its sorted position, shifting the
    /// suffix one slot right.
    fn insert_record(&mut self, block: u32, key: &[u8], value: &[u8]) -> Result<()> {
        let mut node = self.read_node(block)?;
        let n = node.get_num_keys();
        if n == node.get_num_slots_as_leaf() {
            // Reachable only if an earlier exhausted allocation left this
            // leaf full and unsplit.
            return Err(TreeError::NoSpace);
        }
        let pos = insert_position(&node, key)?;
        let src = node.resolve_keyval(pos)?..node.resolve_keyval(n)?;
        let dst = node.resolve_keyval(pos + 1)?;
        node.move_slots(src, dst);
        node.set_num_keys(n + 1);
        node.set_key(pos, key)?;
        node.set_val(pos, value)?;
        node.serialize(&mut self.cache, block)
            .map_err(TreeError::from)
    }

    /// Inserts a promoted separator and the pointer to the new right
    /// sibling into an interior node. The pointer paired with the key at
    /// slot `i` is `ptr` slot `i + 1`, so the shifted region starts at the
    /// key and the new child lands one pointer slot later.
    fn insert_separator(&mut self, block: u32, key: &[u8], new_child: u32) -> Result<()> {
        let mut node = self.read_node(block)?;
        let n = node.get_num_keys();
        if n == node.get_num_slots_as_interior() {
            return Err(TreeError::NoSpace);
        }
        let pos = insert_position(&node, key)?;
        let src = node.resolve_key(pos)?..node.resolve_ptr(n)? + consts::PTR_SIZE;
        let dst = node.resolve_key(pos + 1)?;
        node.move_slots(src, dst);
        node.set_num_keys(n + 1);
        node.set_key(pos, key)?;
        node.set_ptr(pos + 1, new_child)?;
        node.serialize(&mut self.cache, block)
            .map_err(TreeError::from)
    }

    /// Deletion is not supported.
    pub(crate) fn delete(&mut self, _key: &[u8]) -> Result<()> {
        Err(TreeError::Unimplemented)
    }

    /// Writes a depth-first rendition of the tree to `w`.
    pub(crate) fn display<W: io::Write>(&mut self, w: &mut W, mode: DisplayMode) -> Result<()> {
        if mode == DisplayMode::DepthDot {
            writeln!(w, "digraph tree {{")?;
        }
        let root = self.superblock.get_root_block();
        self.display_block(root, w, mode)?;
        if mode == DisplayMode::DepthDot {
            writeln!(w, "}}")?;
        }
        Ok(())
    }

    fn display_block<W: io::Write>(&mut self, block: u32, w: &mut W, mode: DisplayMode) -> Result<()> {
        let node = self.read_node(block)?;
        write_node(w, block, &node, mode)?;
        if mode == DisplayMode::DepthDot {
            write!(w, ";")?;
        }
        if mode != DisplayMode::SortedKeyVal {
            writeln!(w)?;
        }
        match node.get_node_type() {
            Ok(NodeType::Root) | Ok(NodeType::Interior) => {
                if node.get_num_keys() > 0 {
                    for i in 0..=node.get_num_keys() {
                        let child = node.get_ptr(i)?;
                        if mode == DisplayMode::DepthDot {
                            writeln!(w, "{block} -> {child};")?;
                        }
                        self.display_block(child, w, mode)?;
                    }
                }
                Ok(())
            }
            Ok(NodeType::Leaf) => Ok(()),
            _ => Err(TreeError::Insane("non-tree block in traversal")),
        }
    }

    /// Verifies key ordering within every node and separator bounds across
    /// every parent/child edge.
    pub(crate) fn sanity_check(&mut self) -> Result<()> {
        let root_block = self.superblock.get_root_block();
        let root = self.read_node(root_block)?;
        let mut prev: Option<Vec<u8>> = None;
        for i in 0..root.get_num_keys() {
            let cur = root.get_key(i)?.to_vec();
            if let Some(prev) = &prev {
                if cur <= *prev {
                    return Err(TreeError::Insane("keys out of order in the root"));
                }
            }
            self.check_subtree(root.get_ptr(i)?, &cur, true)?;
            self.check_subtree(root.get_ptr(i + 1)?, &cur, false)?;
            prev = Some(cur);
        }
        Ok(())
    }

    /// Checks one subtree against the separator that encloses it: every key
    /// under a left edge must order at or below the separator, every key
    /// under a right edge strictly above it.
    fn check_subtree(&mut self, block: u32, bound: &[u8], is_left: bool) -> Result<()> {
        let node = self.read_node(block)?;
        let node_type = node.get_node_type()?;
        match node_type {
            NodeType::Root | NodeType::Interior | NodeType::Leaf => {}
            _ => return Err(TreeError::Insane("non-tree block in a subtree")),
        }
        let mut prev: Option<Vec<u8>> = None;
        for i in 0..node.get_num_keys() {
            let cur = node.get_key(i)?.to_vec();
            if let Some(prev) = &prev {
                if cur <= *prev {
                    return Err(TreeError::Insane("keys out of order in a node"));
                }
            }
            if is_left {
                if bound < cur.as_slice() {
                    return Err(TreeError::Insane("left subtree key above its separator"));
                }
            } else if cur.as_slice() <= bound {
                return Err(TreeError::Insane(
                    "right subtree key at or below its separator",
                ));
            }
            if node_type != NodeType::Leaf {
                self.check_subtree(node.get_ptr(i)?, &cur, true)?;
                self.check_subtree(node.get_ptr(i + 1)?, &cur, false)?;
            }
            prev = Some(cur);
        }
        Ok(())
    }

    fn read_node(&mut self, block: u32) -> Result<Node> {
        Ok(Node::unserialize(&mut self.cache, block)?)
    }

    fn retype_block(&mut self, block: u32, node_type: NodeType) -> Result<()> {
        let mut node = self.read_node(block)?;
        node.set_node_type(node_type);
        node.serialize(&mut self.cache, block)?;
        Ok(())
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        let want = self.superblock.get_key_size();
        if key.len() != want {
            return Err(NodeError::KeyLength {
                got: key.len(),
                want,
            }
            .into());
        }
        Ok(())
    }

    fn check_val(&self, value: &[u8]) -> Result<()> {
        let want = self.superblock.get_value_size();
        if value.len() != want {
            return Err(NodeError::ValueLength {
                got: value.len(),
                want,
            }
            .into());
        }
        Ok(())
    }
}

/// The child to descend into for `key`: the first slot whose key orders at
/// or above it, else the last pointer. `None` on a node with no keys.
fn child_for(node: &Node, key: &[u8]) -> std::result::Result<Option<u32>, NodeError> {
    let n = node.get_num_keys();
    for i in 0..n {
        if key <= node.get_key(i)? {
            return Ok(Some(node.get_ptr(i)?));
        }
    }
    if n > 0 { Ok(Some(node.get_ptr(n)?)) } else { Ok(None) }
}

/// The first slot whose key orders after `key`, or `numkeys` to append.
fn insert_position(node: &Node, key: &[u8]) -> std::result::Result<usize, NodeError> {
    let n = node.get_num_keys();
    for i in 0..n {
        if key < node.get_key(i)? {
            return Ok(i);
        }
    }
    Ok(n)
}

/// Whether the node is at capacity for its kind.
fn is_full(node: &Node) -> std::result::Result<bool, NodeError> {
    Ok(match node.get_node_type()? {
        NodeType::Leaf => node.get_num_keys() == node.get_num_slots_as_leaf(),
        NodeType::Root | NodeType::Interior => {
            node.get_num_keys() == node.get_num_slots_as_interior()
        }
        _ => false,
    })
}

/// Renders one node. The depth modes print the node inline; the sorted mode
/// prints leaf records only, one per line.
fn write_node<W: io::Write>(w: &mut W, block: u32, node: &Node, mode: DisplayMode) -> Result<()> {
    match mode {
        DisplayMode::DepthDot => write!(w, "{block} [ label=\"{block}: ")?,
        DisplayMode::Depth => write!(w, "{block}: ")?,
        DisplayMode::SortedKeyVal => {}
    }
    match node.get_node_type() {
        Ok(NodeType::Root) | Ok(NodeType::Interior) => {
            if mode != DisplayMode::SortedKeyVal {
                if mode == DisplayMode::Depth {
                    write!(w, "Interior: ")?;
                }
                for i in 0..=node.get_num_keys() {
                    write!(w, "*{} ", node.get_ptr(i)?)?;
                    if i == node.get_num_keys() {
                        break;
                    }
                    write!(w, "{} ", String::from_utf8_lossy(node.get_key(i)?))?;
                }
            }
        }
        Ok(NodeType::Leaf) => {
            if mode == DisplayMode::Depth {
                write!(w, "Leaf: ")?;
            }
            for i in 0..node.get_num_keys() {
                if i == 0 && mode != DisplayMode::SortedKeyVal {
                    write!(w, "*{} ", node.get_ptr(0)?)?;
                }
                let key = String::from_utf8_lossy(node.get_key(i)?).into_owned();
                let val = String::from_utf8_lossy(node.get_val(i)?).into_owned();
                if mode == DisplayMode::SortedKeyVal {
                    writeln!(w, "({key},{val})")?;
                } else {
                    write!(w, "{key} {val} ")?;
                }
            }
        }
        other => {
            let tag = match other {
                Ok(t) => t as u8,
                Err(NodeError::UnexpectedNodeType(tag)) => tag,
                Err(e) => return Err(e.into()),
            };
            if mode == DisplayMode::DepthDot {
                write!(w, "Unknown({tag})")?;
            } else {
                write!(w, "Unsupported Node Type {tag}")?;
            }
        }
    }
    if mode == DisplayMode::DepthDot {
        write!(w, "\" ]")?;
    }
    Ok(())
}
