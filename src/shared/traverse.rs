use crate::shared::octree::{Octree, VisitDecision, VoxelColor};
use crate::shared::spatial::{Aabb3, Cube};
use serde::{Deserialize, Serialize};

/// What a consumer can currently see: a world-space volume plus the eye
/// position the size heuristic measures distance from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewVolume {
    pub bounds: Aabb3,
    pub eye: [f32; 3],
}

impl ViewVolume {
    /// A view covering the whole tree, for unculled passes.
    pub fn everything(eye: [f32; 3]) -> Self {
        Self {
            bounds: Aabb3::everything(),
            eye,
        }
    }
}

/// Level-of-detail tuning knobs, passed in by the consumer.
///
/// `size_scale` sets how far away a cell of a given size stays visible;
/// `boundary_level_adjust` shifts the cutover by whole tree levels
/// (positive = coarser, dropping detail sooner).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LodParams {
    pub size_scale: f32,
    pub boundary_level_adjust: i32,
}

pub const DEFAULT_SIZE_SCALE: f32 = 512.0;

impl Default for LodParams {
    fn default() -> Self {
        Self {
            size_scale: DEFAULT_SIZE_SCALE,
            boundary_level_adjust: 0,
        }
    }
}

/// Counters accumulated over one traversal pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraversalStats {
    pub visited: u64,
    pub rendered: u64,
    pub culled_by_view: u64,
    pub culled_by_size: u64,
}

/// A content node the pass judged worth handing to the consumer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderItem {
    pub cube: Cube,
    pub color: VoxelColor,
}

/// Farthest distance at which a cell of `scale` still matters, per the LOD
/// parameters.
pub fn boundary_distance_for_scale(scale: f32, lod: &LodParams) -> f32 {
    let level_factor = 2.0f32.powi(-lod.boundary_level_adjust);
    lod.size_scale * scale * level_factor
}

/// Size-vs-distance heuristic: is the cell big enough, seen from `eye`, to
/// be worth processing?
pub fn calculate_should_render(cube: &Cube, eye: [f32; 3], lod: &LodParams) -> bool {
    let center = cube.center();
    let dx = center[0] - eye[0];
    let dy = center[1] - eye[1];
    let dz = center[2] - eye[2];
    let distance = (dx * dx + dy * dy + dz * dz).sqrt();
    distance <= boundary_distance_for_scale(cube.scale, lod)
}

/// One bounded traversal over the tree: visit every node inside the view
/// volume, collect the content nodes that pass the size heuristic, and
/// count the rest.
///
/// A node outside the view halts recursion into its subtree, as does a node
/// judged too small. The latter is an accepted approximation, not just an
/// optimization: children are half the size of their parent, so a cell too
/// small to matter is assumed to have children that are also too small.
/// Content nodes skipped for size are counted separately from view culls.
///
/// The caller holds the read lock only for the duration of this call; the
/// returned items carry everything a renderer needs, so draw calls happen
/// after the lock is released.
pub fn render_pass(tree: &Octree, view: &ViewVolume, lod: &LodParams) -> (Vec<RenderItem>, TraversalStats) {
    let mut items = Vec::new();
    let mut stats = TraversalStats::default();
    tree.recurse_with_operation(|_, node| {
        stats.visited += 1;
        if !view.bounds.intersects_cube(node.cube()) {
            stats.culled_by_view += 1;
            return VisitDecision::SkipChildren;
        }
        if let Some(color) = node.content() {
            if !calculate_should_render(node.cube(), view.eye, lod) {
                stats.culled_by_size += 1;
                return VisitDecision::SkipChildren;
            }
            stats.rendered += 1;
            items.push(RenderItem {
                cube: *node.cube(),
                color,
            });
        }
        VisitDecision::Continue
    });
    (items, stats)
}
