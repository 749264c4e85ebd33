use super::{NodeId, OctreeError, OctreeNode, SequenceOutcome, TreeStats, VisitDecision, VoxelColor};
use crate::shared::octal::{OctalCode, MAX_OCTAL_DEPTH};
use crate::shared::spatial::{ray_cube_intersection, Aabb3, Cube};
use std::collections::HashMap;

/// Sources that stay silent this long are dropped from the sequence table
/// by the periodic `update()` sweep.
const SOURCE_SEQUENCE_EXPIRY_MS: u64 = 30_000;

#[derive(Clone, Copy, Debug)]
struct SourceSequence {
    last_sequence: u32,
    last_heard_ms: u64,
}

/// A content node found by a ray query.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RayHit {
    pub distance: f32,
    pub cube: Cube,
    pub color: VoxelColor,
}

/// The spatial index: a root cell recursively subdivided into octants.
///
/// Nodes live in an arena; parent/child links are arena handles, so
/// deleting a subtree can never leave a dangling pointer — the handles are
/// simply unlinked and their slots recycled. All nodes are reachable from
/// the root and every node has exactly one parent.
///
/// The tree does not lock itself. Callers hold the read or write side of
/// the owning [`SyncedOctree`](crate::shared::sync::SyncedOctree) for the
/// duration of each top-level operation.
#[derive(Clone, Debug)]
pub struct Octree {
    slots: Vec<Option<OctreeNode>>,
    free: Vec<u32>,
    root: NodeId,
    dirty: bool,
    protocol_version: u8,
    being_viewed: bool,
    stats: TreeStats,
    source_sequences: HashMap<u16, SourceSequence>,
}

impl Octree {
    pub fn new(protocol_version: u8) -> Self {
        Self {
            slots: vec![Some(OctreeNode::new(Cube::ROOT, 0))],
            free: Vec::new(),
            root: NodeId(0),
            dirty: false,
            protocol_version,
            being_viewed: false,
            stats: TreeStats::default(),
            source_sequences: HashMap::new(),
        }
    }

    pub fn root_id(&self) -> NodeId {
        self.root
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    pub fn is_being_viewed(&self) -> bool {
        self.being_viewed
    }

    pub fn set_being_viewed(&mut self, viewed: bool) {
        self.being_viewed = viewed;
    }

    pub fn stats(&self) -> TreeStats {
        self.stats
    }

    pub fn node(&self, id: NodeId) -> Option<&OctreeNode> {
        self.slots.get(id.0 as usize).and_then(|slot| slot.as_ref())
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut OctreeNode> {
        self.slots
            .get_mut(id.0 as usize)
            .and_then(|slot| slot.as_mut())
    }

    /// Live nodes in the arena, root included.
    pub fn node_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    // --- dirty bit -------------------------------------------------------

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty_bit(&mut self) {
        self.dirty = false;
    }

    // --- structure mutation ----------------------------------------------

    /// Return the child of `parent` at `octant`, creating it if absent.
    /// Idempotent: calling again with the same arguments returns the same
    /// handle without side effects.
    pub fn possibly_create_child_at(
        &mut self,
        parent: NodeId,
        octant: u8,
    ) -> Result<NodeId, OctreeError> {
        if octant >= 8 {
            return Err(OctreeError::InvalidAddress);
        }
        let (parent_cube, parent_depth) = match self.node(parent) {
            Some(node) => {
                if let Some(existing) = node.children[octant as usize] {
                    return Ok(existing);
                }
                (node.cube, node.depth)
            }
            None => return Err(OctreeError::InvalidAddress),
        };
        if parent_depth as usize >= MAX_OCTAL_DEPTH {
            return Err(OctreeError::InvalidAddress);
        }
        let child = self.alloc(OctreeNode::new(parent_cube.child(octant), parent_depth + 1));
        if let Some(node) = self.node_mut(parent) {
            node.children[octant as usize] = Some(child);
        }
        self.stats.nodes_created += 1;
        self.dirty = true;
        Ok(child)
    }

    /// Locate the node addressed by `code`, creating it and any missing
    /// ancestors along the way.
    pub fn touch_descendant(&mut self, code: &OctalCode) -> Result<NodeId, OctreeError> {
        let mut current = self.root;
        for &octant in code.octants() {
            current = self.possibly_create_child_at(current, octant)?;
        }
        Ok(current)
    }

    /// The existing node addressed by `code`, without creating anything.
    pub fn node_at(&self, code: &OctalCode) -> Option<NodeId> {
        let mut current = self.root;
        for &octant in code.octants() {
            current = self.node(current)?.children[octant as usize]?;
        }
        Some(current)
    }

    pub fn content_at(&self, code: &OctalCode) -> Option<VoxelColor> {
        self.node_at(code).and_then(|id| self.node(id)?.content())
    }

    /// Set the content of the node at `code`, creating the path as needed.
    pub fn set_content(&mut self, code: &OctalCode, color: VoxelColor) -> Result<NodeId, OctreeError> {
        let id = self.touch_descendant(code)?;
        let node = self.node_mut(id).ok_or(OctreeError::InvalidAddress)?;
        node.content = Some(color);
        node.pending_send = true;
        self.stats.content_updates += 1;
        self.dirty = true;
        Ok(id)
    }

    /// Delete the subtree addressed by `code`, then prune any ancestor left
    /// with no content and no children. Returns whether anything changed.
    /// Deleting at the root clears the whole tree.
    pub fn delete_at(&mut self, code: &OctalCode) -> Result<bool, OctreeError> {
        if code.is_root() {
            let root = self.node(self.root).ok_or(OctreeError::InvalidAddress)?;
            if !root.has_content() && root.is_leaf() {
                return Ok(false);
            }
            self.erase_all();
            return Ok(true);
        }

        // Record the path so ancestors can be pruned afterwards.
        let mut path = Vec::with_capacity(code.depth());
        let mut current = self.root;
        for &octant in code.octants() {
            let Some(next) = self.node(current).and_then(|n| n.children[octant as usize]) else {
                return Ok(false);
            };
            path.push((current, octant));
            current = next;
        }

        let (parent, octant) = *path.last().expect("non-root code has a parent");
        if let Some(node) = self.node_mut(parent) {
            node.children[octant as usize] = None;
        }
        self.free_subtree(current);

        // Walk back up deleting now-empty interior nodes. The root survives
        // even when emptied. path[i] pairs the ancestor at depth i with the
        // octant taken from it, so the link into path[i].0 lives at
        // path[i - 1].
        for index in (1..path.len()).rev() {
            let id = path[index].0;
            let prunable = self
                .node(id)
                .map(|n| !n.has_content() && n.is_leaf())
                .unwrap_or(false);
            if !prunable {
                break;
            }
            let (parent, octant) = path[index - 1];
            if let Some(parent) = self.node_mut(parent) {
                parent.children[octant as usize] = None;
            }
            self.free_subtree(id);
        }

        self.dirty = true;
        Ok(true)
    }

    /// Drop the entire tree structure below the root and clear the root's
    /// content, resetting to an empty tree.
    pub fn erase_all(&mut self) {
        let children = self
            .node(self.root)
            .map(|n| n.children)
            .unwrap_or([None; 8]);
        for child in children.into_iter().flatten() {
            self.free_subtree(child);
        }
        if let Some(root) = self.node_mut(self.root) {
            root.children = [None; 8];
            root.content = None;
            root.pending_send = false;
        }
        self.dirty = true;
    }

    fn alloc(&mut self, node: OctreeNode) -> NodeId {
        if let Some(slot) = self.free.pop() {
            self.slots[slot as usize] = Some(node);
            NodeId(slot)
        } else {
            self.slots.push(Some(node));
            NodeId((self.slots.len() - 1) as u32)
        }
    }

    fn free_subtree(&mut self, id: NodeId) {
        let children = match self.node(id) {
            Some(node) => node.children,
            None => return,
        };
        for child in children.into_iter().flatten() {
            self.free_subtree(child);
        }
        self.slots[id.0 as usize] = None;
        self.free.push(id.0);
        self.stats.nodes_deleted += 1;
    }

    // --- traversal and queries -------------------------------------------

    /// Depth-first pre-order traversal. The visitor's verdict controls
    /// descent; returns `false` when the traversal was aborted.
    pub fn recurse_with_operation<F>(&self, mut operation: F) -> bool
    where
        F: FnMut(NodeId, &OctreeNode) -> VisitDecision,
    {
        self.recurse_node(self.root, &mut operation)
    }

    fn recurse_node<F>(&self, id: NodeId, operation: &mut F) -> bool
    where
        F: FnMut(NodeId, &OctreeNode) -> VisitDecision,
    {
        let Some(node) = self.node(id) else {
            return true;
        };
        match operation(id, node) {
            VisitDecision::Abort => false,
            VisitDecision::SkipChildren => true,
            VisitDecision::Continue => {
                for child in node.children.into_iter().flatten() {
                    if !self.recurse_node(child, operation) {
                        return false;
                    }
                }
                true
            }
        }
    }

    /// Every content-bearing node with its path, in pre-order.
    pub fn collect_content(&self) -> Vec<(OctalCode, VoxelColor)> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        self.collect_content_inner(self.root, &mut path, &mut out);
        out
    }

    fn collect_content_inner(
        &self,
        id: NodeId,
        path: &mut Vec<u8>,
        out: &mut Vec<(OctalCode, VoxelColor)>,
    ) {
        let Some(node) = self.node(id) else {
            return;
        };
        if let Some(color) = node.content() {
            let code = OctalCode::from_octants(path).expect("tree paths stay within depth limit");
            out.push((code, color));
        }
        for (octant, child) in node.children.iter().enumerate() {
            if let Some(child) = child {
                path.push(octant as u8);
                self.collect_content_inner(*child, path, out);
                path.pop();
            }
        }
    }

    /// Deepest node whose cube contains `point`, or `None` when the point
    /// lies outside the tree volume.
    pub fn node_containing_point(&self, point: [f32; 3]) -> Option<NodeId> {
        let root = self.node(self.root)?;
        if !root.cube.contains_point(point) {
            return None;
        }
        let mut current = self.root;
        'descend: loop {
            let node = self.node(current)?;
            for child in node.children.into_iter().flatten() {
                if self
                    .node(child)
                    .map(|n| n.cube.contains_point(point))
                    .unwrap_or(false)
                {
                    current = child;
                    continue 'descend;
                }
            }
            return Some(current);
        }
    }

    /// Content nodes whose cubes overlap `bounds`, with their paths.
    /// An empty tree — or bounds missing everything — yields no entries.
    pub fn collect_content_in_bounds(&self, bounds: &Aabb3) -> Vec<(OctalCode, VoxelColor)> {
        self.collect_content()
            .into_iter()
            .filter(|(code, _)| bounds.intersects_cube(&code.cube()))
            .collect()
    }

    /// Nearest content node hit by the ray, or `None` — including on an
    /// empty tree, which is a miss, not an error.
    pub fn ray_intersection(&self, origin: [f32; 3], direction: [f32; 3]) -> Option<RayHit> {
        let mut best: Option<RayHit> = None;
        self.recurse_with_operation(|_, node| {
            let Some(distance) = ray_cube_intersection(origin, direction, node.cube()) else {
                return VisitDecision::SkipChildren;
            };
            if let Some(color) = node.content() {
                let closer = best.map(|hit| distance < hit.distance).unwrap_or(true);
                if closer {
                    best = Some(RayHit {
                        distance,
                        cube: *node.cube(),
                        color,
                    });
                }
            }
            VisitDecision::Continue
        });
        best
    }

    // --- per-source sequence bookkeeping ---------------------------------

    /// Record a packet sequence number seen from `source_id` and classify
    /// it against the last one observed.
    pub fn observe_sequence(
        &mut self,
        source_id: u16,
        sequence: u32,
        now_ms: u64,
    ) -> SequenceOutcome {
        match self.source_sequences.get_mut(&source_id) {
            None => {
                self.source_sequences.insert(
                    source_id,
                    SourceSequence {
                        last_sequence: sequence,
                        last_heard_ms: now_ms,
                    },
                );
                SequenceOutcome::FirstSeen
            }
            Some(entry) => {
                let outcome = if sequence == entry.last_sequence {
                    SequenceOutcome::Duplicate
                } else if sequence < entry.last_sequence {
                    SequenceOutcome::Regressed
                } else {
                    SequenceOutcome::InOrder
                };
                entry.last_sequence = entry.last_sequence.max(sequence);
                entry.last_heard_ms = now_ms;
                outcome
            }
        }
    }

    /// Periodic bookkeeping: expire sequence entries for sources that have
    /// gone silent.
    pub fn update(&mut self, now_ms: u64) {
        self.source_sequences
            .retain(|_, entry| now_ms.saturating_sub(entry.last_heard_ms) < SOURCE_SEQUENCE_EXPIRY_MS);
    }

    pub fn tracked_source_count(&self) -> usize {
        self.source_sequences.len()
    }
}
