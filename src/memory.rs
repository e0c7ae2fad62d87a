//! Caller-owned closure memory.
//!
//! Shader execution never allocates closure records on its own: every node of
//! the output closure tree is carved out of a [`ClosureAllocator`] supplied by
//! the host for the invocation. Nodes are stored with a small header so the tree
//! can be walked back without any side tables:
//!
//! | node | layout (u32 words unless noted) |
//! |---|---|
//! | leaf | `TAG_LEAF`, closure id, record size, record bytes |
//! | add  | `TAG_ADD`, lhs block, rhs block |
//! | mul  | `TAG_MUL`, weight (f32), child block |

use std::collections::HashSet;
use std::sync::Arc;

use bytemuck::{bytes_of, pod_read_unaligned};

use crate::closure::{ClosureId, ClosureRegistry, ClosureTypeDescriptor};
use crate::error::ShadingError;
use crate::types::Value;

const TAG_LEAF: u32 = 1;
const TAG_ADD: u32 = 2;
const TAG_MUL: u32 = 3;

const LEAF_HEADER: usize = 12;
const PAIR_NODE_SIZE: usize = 12;

/// Byte offset of an allocation inside the allocator's memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    pub(crate) const NONE_RAW: u32 = u32::MAX;

    pub fn new(offset: u32) -> Self {
        Self(offset)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn offset(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        (raw != Self::NONE_RAW).then_some(Self(raw))
    }
}

/// Allocation callback used for everything an invocation produces.
pub trait ClosureAllocator {
    /// Reserves `size` zeroed bytes at a 4-byte aligned offset.
    /// Returns `None` when the host is out of memory.
    fn allocate(&mut self, size: usize) -> Option<BlockId>;

    fn memory(&self) -> &[u8];

    fn memory_mut(&mut self) -> &mut [u8];
}

/// Bump allocator over a reusable buffer. Call [`ClosureArena::reset`] between
/// shading points; the buffer keeps its capacity.
#[derive(Debug, Default, Clone)]
pub struct ClosureArena {
    bytes: Vec<u8>,
    limit: Option<usize>,
}

impl ClosureArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arena that refuses to grow beyond `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(limit),
            limit: Some(limit),
        }
    }

    pub fn reset(&mut self) {
        self.bytes.clear();
    }

    pub fn used(&self) -> usize {
        self.bytes.len()
    }
}

impl ClosureAllocator for ClosureArena {
    fn allocate(&mut self, size: usize) -> Option<BlockId> {
        let start = self.bytes.len().next_multiple_of(4);
        let end = start.checked_add(size)?;
        if self.limit.is_some_and(|limit| end > limit) {
            return None;
        }
        let offset = u32::try_from(start).ok()?;
        if offset == BlockId::NONE_RAW {
            return None;
        }
        self.bytes.resize(end, 0);
        Some(BlockId(offset))
    }

    fn memory(&self) -> &[u8] {
        &self.bytes
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// A decoded leaf: the closure id plus its raw record bytes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClosureLeaf<'m> {
    pub id: ClosureId,
    pub params: &'m [u8],
}

impl<'m> ClosureLeaf<'m> {
    /// Pairs the record with its registered descriptor for typed field access.
    pub fn record(&self, registry: &ClosureRegistry) -> Result<ClosureRecord<'m>, ShadingError> {
        let descriptor = registry
            .descriptor(self.id)
            .ok_or_else(|| ShadingError::UnknownClosureType(format!("#{}", self.id)))?;
        ClosureRecord::new(descriptor, self.params)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClosureNode<'m> {
    Leaf(ClosureLeaf<'m>),
    Add { lhs: BlockId, rhs: BlockId },
    Mul { weight: f32, child: BlockId },
}

/// A closure record validated against its descriptor.
#[derive(Clone, Debug)]
pub struct ClosureRecord<'m> {
    descriptor: Arc<ClosureTypeDescriptor>,
    params: &'m [u8],
}

impl<'m> ClosureRecord<'m> {
    pub fn new(descriptor: Arc<ClosureTypeDescriptor>, params: &'m [u8]) -> Result<Self, ShadingError> {
        if params.len() != descriptor.size {
            return Err(ShadingError::InvalidClosureLayout {
                name: descriptor.name.clone(),
                reason: format!(
                    "record is {} bytes, expected {}",
                    params.len(),
                    descriptor.size
                ),
            });
        }
        Ok(Self { descriptor, params })
    }

    pub fn id(&self) -> ClosureId {
        self.descriptor.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn get(&self, field: &str) -> Result<Value, ShadingError> {
        self.descriptor.read_field(self.params, field)
    }
}

fn read_u32(mem: &[u8], at: usize) -> Option<u32> {
    mem.get(at..at + 4).map(pod_read_unaligned::<u32>)
}

fn decode(mem: &[u8], block: BlockId) -> Option<ClosureNode<'_>> {
    let base = block.offset();
    match read_u32(mem, base)? {
        TAG_LEAF => {
            let id = read_u32(mem, base + 4)?;
            let size = read_u32(mem, base + 8)? as usize;
            let start = base + LEAF_HEADER;
            let params = mem.get(start..start.checked_add(size)?)?;
            Some(ClosureNode::Leaf(ClosureLeaf { id, params }))
        }
        TAG_ADD => Some(ClosureNode::Add {
            lhs: BlockId(read_u32(mem, base + 4)?),
            rhs: BlockId(read_u32(mem, base + 8)?),
        }),
        TAG_MUL => Some(ClosureNode::Mul {
            weight: f32::from_bits(read_u32(mem, base + 4)?),
            child: BlockId(read_u32(mem, base + 8)?),
        }),
        _ => None,
    }
}

/// The output slot an entry point populates: the caller's allocator plus the
/// root of the closure tree written during the invocation.
pub struct ClosureSlot<'a> {
    allocator: &'a mut dyn ClosureAllocator,
    root: Option<BlockId>,
}

impl<'a> ClosureSlot<'a> {
    pub fn new(allocator: &'a mut dyn ClosureAllocator) -> Self {
        Self {
            allocator,
            root: None,
        }
    }

    pub fn root(&self) -> Option<BlockId> {
        self.root
    }

    pub(crate) fn set_root(&mut self, root: Option<BlockId>) {
        self.root = root;
    }

    pub fn node(&self, block: BlockId) -> Option<ClosureNode<'_>> {
        decode(self.allocator.memory(), block)
    }

    pub fn root_node(&self) -> Option<ClosureNode<'_>> {
        self.root.and_then(|r| self.node(r))
    }

    /// Flattens the tree into leaves with their accumulated weights, left to
    /// right. Shared subtrees are visited once per reference. A node that
    /// refers back to one of its own ancestors is skipped, so corrupted host
    /// memory cannot loop forever.
    pub fn weighted_leaves(&self) -> Vec<(f32, ClosureLeaf<'_>)> {
        enum Visit {
            Enter(BlockId, f32),
            Exit(BlockId),
        }

        let mut out = Vec::new();
        let Some(root) = self.root else {
            return out;
        };
        let mut path = HashSet::new();
        let mut stack = vec![Visit::Enter(root, 1.0)];
        while let Some(visit) = stack.pop() {
            let (block, weight) = match visit {
                Visit::Exit(block) => {
                    path.remove(&block);
                    continue;
                }
                Visit::Enter(block, weight) => (block, weight),
            };
            if !path.insert(block) {
                continue;
            }
            stack.push(Visit::Exit(block));
            match self.node(block) {
                Some(ClosureNode::Leaf(leaf)) => out.push((weight, leaf)),
                Some(ClosureNode::Add { lhs, rhs }) => {
                    stack.push(Visit::Enter(rhs, weight));
                    stack.push(Visit::Enter(lhs, weight));
                }
                Some(ClosureNode::Mul { weight: w, child }) => {
                    stack.push(Visit::Enter(child, weight * w));
                }
                None => {}
            }
        }
        out
    }

    pub(crate) fn write_leaf(
        &mut self,
        descriptor: &ClosureTypeDescriptor,
        args: &[Value],
    ) -> Option<BlockId> {
        let size = u32::try_from(descriptor.size).ok()?;
        let total = LEAF_HEADER.checked_add(descriptor.size)?;
        let block = self.allocator.allocate(total)?;
        let base = block.offset();
        let mem = self.allocator.memory_mut();
        let header = mem.get_mut(base..base.checked_add(total)?)?;
        header[0..4].copy_from_slice(bytes_of(&TAG_LEAF));
        header[4..8].copy_from_slice(bytes_of(&descriptor.id));
        header[8..12].copy_from_slice(bytes_of(&size));
        let record = &mut header[LEAF_HEADER..];
        for (index, value) in args.iter().enumerate() {
            descriptor.write_field(record, index, value);
        }
        Some(block)
    }

    pub(crate) fn write_add(&mut self, lhs: BlockId, rhs: BlockId) -> Option<BlockId> {
        self.write_pair(TAG_ADD, lhs.raw(), rhs.raw())
    }

    pub(crate) fn write_mul(&mut self, weight: f32, child: BlockId) -> Option<BlockId> {
        self.write_pair(TAG_MUL, weight.to_bits(), child.raw())
    }

    fn write_pair(&mut self, tag: u32, a: u32, b: u32) -> Option<BlockId> {
        let block = self.allocator.allocate(PAIR_NODE_SIZE)?;
        let base = block.offset();
        let node = self
            .allocator
            .memory_mut()
            .get_mut(base..base + PAIR_NODE_SIZE)?;
        node[0..4].copy_from_slice(bytes_of(&tag));
        node[4..8].copy_from_slice(bytes_of(&a));
        node[8..12].copy_from_slice(bytes_of(&b));
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closure::{ClosureLayout, FieldType};
    use crate::types::Float3;

    fn registry() -> (ClosureRegistry, ClosureId) {
        let reg = ClosureRegistry::new(4096);
        let id = reg
            .register_layout(
                "lambert",
                ClosureLayout::new()
                    .field("base_color", FieldType::Float3)
                    .field("flip_normal", FieldType::Bool),
            )
            .unwrap();
        (reg, id)
    }

    #[test]
    fn arena_allocations_are_aligned_and_zeroed() {
        let mut arena = ClosureArena::new();
        let a = arena.allocate(5).unwrap();
        let b = arena.allocate(4).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 8);
        assert!(arena.memory().iter().all(|&x| x == 0));
        arena.reset();
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn limited_arena_reports_exhaustion() {
        let mut arena = ClosureArena::with_limit(16);
        assert!(arena.allocate(12).is_some());
        assert!(arena.allocate(8).is_none());
    }

    #[test]
    fn tree_nodes_decode_with_weights() {
        let (reg, id) = registry();
        let desc = reg.descriptor(id).unwrap();
        let mut arena = ClosureArena::new();
        let mut slot = ClosureSlot::new(&mut arena);

        let red = slot
            .write_leaf(&desc, &[Value::Float3(Float3::new(1.0, 0.0, 0.0)), Value::Bool(false)])
            .unwrap();
        let blue = slot
            .write_leaf(&desc, &[Value::Float3(Float3::new(0.0, 0.0, 1.0)), Value::Bool(true)])
            .unwrap();
        let half = slot.write_mul(0.5, blue).unwrap();
        let sum = slot.write_add(red, half).unwrap();
        slot.set_root(Some(sum));

        assert!(matches!(slot.root_node(), Some(ClosureNode::Add { .. })));
        let leaves = slot.weighted_leaves();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].0, 1.0);
        assert_eq!(leaves[1].0, 0.5);

        let record = leaves[1].1.record(&reg).unwrap();
        assert_eq!(record.name(), "lambert");
        assert_eq!(record.get("flip_normal").unwrap(), Value::Bool(true));
    }

    #[test]
    fn long_add_chains_keep_every_leaf() {
        let (reg, id) = registry();
        let desc = reg.descriptor(id).unwrap();
        let mut arena = ClosureArena::new();
        let mut slot = ClosureSlot::new(&mut arena);

        let mut root = slot.write_leaf(&desc, &[]).unwrap();
        for _ in 1..200 {
            let leaf = slot.write_leaf(&desc, &[]).unwrap();
            root = slot.write_add(root, leaf).unwrap();
        }
        slot.set_root(Some(root));
        assert_eq!(slot.weighted_leaves().len(), 200);
    }

    #[test]
    fn shared_subtrees_are_counted_per_reference() {
        let (reg, id) = registry();
        let desc = reg.descriptor(id).unwrap();
        let mut arena = ClosureArena::new();
        let mut slot = ClosureSlot::new(&mut arena);

        let leaf = slot.write_leaf(&desc, &[]).unwrap();
        let full = slot.write_mul(1.0, leaf).unwrap();
        let half = slot.write_mul(0.5, leaf).unwrap();
        let sum = slot.write_add(full, half).unwrap();
        slot.set_root(Some(sum));

        let weights: Vec<f32> = slot.weighted_leaves().iter().map(|(w, _)| *w).collect();
        assert_eq!(weights, vec![1.0, 0.5]);
    }

    #[test]
    fn self_referencing_nodes_terminate() {
        let (reg, id) = registry();
        let desc = reg.descriptor(id).unwrap();
        let mut arena = ClosureArena::new();
        let mut slot = ClosureSlot::new(&mut arena);

        let red = slot.write_leaf(&desc, &[]).unwrap();
        // The next block starts right after the leaf header and its record.
        let next = BlockId::new((LEAF_HEADER + desc.size) as u32);
        let looped = slot.write_add(red, next).unwrap();
        assert_eq!(looped, next);
        slot.set_root(Some(looped));

        let leaves = slot.weighted_leaves();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].1.id, id);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn oversized_records_fail_before_allocating() {
        let desc = ClosureTypeDescriptor {
            id: 1,
            name: "huge".to_string(),
            fields: Vec::new(),
            size: u32::MAX as usize + 4,
        };
        let mut arena = ClosureArena::new();
        let mut slot = ClosureSlot::new(&mut arena);
        assert!(slot.write_leaf(&desc, &[]).is_none());
        drop(slot);
        assert_eq!(arena.used(), 0);
    }
}
