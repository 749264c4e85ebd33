use serde::{Deserialize, Serialize};

/// The world is the unit cube `[0, 1)^3`; every octree cell is an
/// axis-aligned sub-cube of it.
pub const TREE_SCALE: f32 = 1.0;

/// Axis-aligned cube: minimum corner plus edge length.
///
/// Octant numbering packs one bit per axis: bit 0 = +x half, bit 1 = +y
/// half, bit 2 = +z half. Child `k` of a cube therefore occupies a fixed
/// one of the 8 half-edge sub-cubes, and a child's volume is always exactly
/// one-eighth of its parent's.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cube {
    pub corner: [f32; 3],
    pub scale: f32,
}

impl Cube {
    pub const ROOT: Self = Self {
        corner: [0.0, 0.0, 0.0],
        scale: TREE_SCALE,
    };

    pub fn new(corner: [f32; 3], scale: f32) -> Self {
        Self { corner, scale }
    }

    /// The sub-cube for octant `k` (0..8). Half the edge length, offset by
    /// the octant's axis bits.
    pub fn child(&self, octant: u8) -> Self {
        let half = self.scale * 0.5;
        Self {
            corner: [
                self.corner[0] + if octant & 1 != 0 { half } else { 0.0 },
                self.corner[1] + if octant & 2 != 0 { half } else { 0.0 },
                self.corner[2] + if octant & 4 != 0 { half } else { 0.0 },
            ],
            scale: half,
        }
    }

    pub fn center(&self) -> [f32; 3] {
        let half = self.scale * 0.5;
        [
            self.corner[0] + half,
            self.corner[1] + half,
            self.corner[2] + half,
        ]
    }

    /// Half-open point containment: is `point` in `[corner, corner + scale)`
    /// on every axis?
    pub fn contains_point(&self, point: [f32; 3]) -> bool {
        (0..3).all(|axis| {
            point[axis] >= self.corner[axis] && point[axis] < self.corner[axis] + self.scale
        })
    }

    /// Does this cube fully contain `other` (half-open on both)?
    pub fn contains_cube(&self, other: &Cube) -> bool {
        (0..3).all(|axis| {
            other.corner[axis] >= self.corner[axis]
                && other.corner[axis] + other.scale <= self.corner[axis] + self.scale
        })
    }
}

/// Half-open 3D axis-aligned bounding box: the region `[min, max)`.
/// Adjacent bounds tile perfectly: `[a, b)` and `[b, c)` share the boundary
/// `b` with no gap and no overlap.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aabb3 {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Aabb3 {
    pub fn new(min: [f32; 3], max: [f32; 3]) -> Self {
        Self { min, max }
    }

    /// Bounds covering the whole tree volume.
    pub fn everything() -> Self {
        Self {
            min: [0.0, 0.0, 0.0],
            max: [TREE_SCALE, TREE_SCALE, TREE_SCALE],
        }
    }

    /// Each axis must have `min < max`.
    pub fn is_valid(&self) -> bool {
        (0..3).all(|axis| self.min[axis] < self.max[axis])
    }

    pub fn contains_point(&self, point: [f32; 3]) -> bool {
        self.is_valid()
            && (0..3).all(|axis| point[axis] >= self.min[axis] && point[axis] < self.max[axis])
    }

    /// Half-open overlap test against a cube.
    pub fn intersects_cube(&self, cube: &Cube) -> bool {
        self.is_valid()
            && (0..3).all(|axis| {
                self.min[axis] < cube.corner[axis] + cube.scale
                    && self.max[axis] > cube.corner[axis]
            })
    }
}

/// Slab-test ray/cube intersection. Returns the entry distance along the
/// (not necessarily normalized) direction, or `None` when the ray misses.
/// A ray starting inside the cube reports distance 0.
pub fn ray_cube_intersection(origin: [f32; 3], direction: [f32; 3], cube: &Cube) -> Option<f32> {
    let mut t_near = f32::NEG_INFINITY;
    let mut t_far = f32::INFINITY;
    for axis in 0..3 {
        let lo = cube.corner[axis];
        let hi = cube.corner[axis] + cube.scale;
        if direction[axis].abs() < f32::EPSILON {
            if origin[axis] < lo || origin[axis] >= hi {
                return None;
            }
            continue;
        }
        let inv = 1.0 / direction[axis];
        let mut t0 = (lo - origin[axis]) * inv;
        let mut t1 = (hi - origin[axis]) * inv;
        if t0 > t1 {
            std::mem::swap(&mut t0, &mut t1);
        }
        t_near = t_near.max(t0);
        t_far = t_far.min(t1);
        if t_near > t_far {
            return None;
        }
    }
    if t_far < 0.0 {
        return None;
    }
    Some(t_near.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_cubes_tile_the_parent() {
        let parent = Cube::ROOT;
        for octant in 0..8u8 {
            let child = parent.child(octant);
            assert_eq!(child.scale, parent.scale * 0.5);
            assert!(parent.contains_cube(&child));
        }
        // All 8 children are distinct.
        for a in 0..8u8 {
            for b in (a + 1)..8u8 {
                assert_ne!(parent.child(a).corner, parent.child(b).corner);
            }
        }
    }

    #[test]
    fn half_open_containment_excludes_far_faces() {
        let cube = Cube::new([0.0, 0.0, 0.0], 0.5);
        assert!(cube.contains_point([0.0, 0.0, 0.0]));
        assert!(cube.contains_point([0.25, 0.25, 0.25]));
        assert!(!cube.contains_point([0.5, 0.25, 0.25]));
    }

    #[test]
    fn aabb_cube_overlap_is_half_open() {
        let bounds = Aabb3::new([0.0, 0.0, 0.0], [0.5, 0.5, 0.5]);
        let touching = Cube::new([0.5, 0.0, 0.0], 0.25);
        assert!(!bounds.intersects_cube(&touching));
        let overlapping = Cube::new([0.25, 0.25, 0.25], 0.5);
        assert!(bounds.intersects_cube(&overlapping));
    }

    #[test]
    fn ray_hits_cube_from_outside_and_inside() {
        let cube = Cube::new([0.25, 0.25, 0.25], 0.25);
        let hit = ray_cube_intersection([0.0, 0.3, 0.3], [1.0, 0.0, 0.0], &cube);
        assert!(hit.is_some());
        assert!((hit.unwrap() - 0.25).abs() < 1e-6);
        let inside = ray_cube_intersection([0.3, 0.3, 0.3], [1.0, 0.0, 0.0], &cube);
        assert_eq!(inside, Some(0.0));
        let miss = ray_cube_intersection([0.0, 0.9, 0.9], [1.0, 0.0, 0.0], &cube);
        assert!(miss.is_none());
    }
}
