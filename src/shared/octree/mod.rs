use crate::shared::spatial::Cube;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable handle into the tree's node arena. Handles stay valid until the
/// addressed node is deleted; slots are recycled through a free list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

/// Content payload of a node: an RGB color sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VoxelColor(pub [u8; 3]);

/// One cell of the octree.
#[derive(Clone, Debug)]
pub struct OctreeNode {
    pub(crate) children: [Option<NodeId>; 8],
    pub(crate) content: Option<VoxelColor>,
    pub(crate) cube: Cube,
    pub(crate) depth: u8,
    /// Set when the node's content changed since it was last encoded for
    /// sending; cleared by the bitstream encoder.
    pub(crate) pending_send: bool,
}

impl OctreeNode {
    pub(crate) fn new(cube: Cube, depth: u8) -> Self {
        Self {
            children: [None; 8],
            content: None,
            cube,
            depth,
            pending_send: false,
        }
    }

    /// Levels below the root; the root itself is depth 0.
    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn has_content(&self) -> bool {
        self.content.is_some()
    }

    pub fn content(&self) -> Option<VoxelColor> {
        self.content
    }

    pub fn cube(&self) -> &Cube {
        &self.cube
    }

    pub fn child(&self, octant: u8) -> Option<NodeId> {
        self.children.get(octant as usize).copied().flatten()
    }

    pub fn child_count(&self) -> usize {
        self.children.iter().filter(|c| c.is_some()).count()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.iter().all(|c| c.is_none())
    }

    /// Whether this node's content is waiting to be encoded for sending.
    pub fn pending_send(&self) -> bool {
        self.pending_send
    }

    pub(crate) fn clear_pending_send(&mut self) {
        self.pending_send = false;
    }

    /// Bitmask of populated octants, bit `k` for child `k`.
    pub fn child_mask(&self) -> u8 {
        let mut mask = 0u8;
        for (octant, child) in self.children.iter().enumerate() {
            if child.is_some() {
                mask |= 1 << octant;
            }
        }
        mask
    }
}

/// Per-tree mutation counters. A value copy is handed out on request so
/// instrumentation never needs process-wide state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub nodes_created: u64,
    pub nodes_deleted: u64,
    pub content_updates: u64,
}

/// Visitor verdict for recursive traversal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VisitDecision {
    /// Keep descending into this node's children.
    Continue,
    /// Skip this node's subtree but keep traversing siblings.
    SkipChildren,
    /// Stop the whole traversal.
    Abort,
}

/// Classification of an observed per-source packet sequence number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceOutcome {
    FirstSeen,
    InOrder,
    Duplicate,
    Regressed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OctreeError {
    /// Octal code or child index out of range for this tree.
    InvalidAddress,
}

impl fmt::Display for OctreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAddress => write!(f, "invalid octree address"),
        }
    }
}

impl std::error::Error for OctreeError {}

mod tree;
pub use tree::{Octree, RayHit};
