use crate::shared::spatial::Cube;
use serde::{Deserialize, Serialize};

/// Deepest addressable level. At depth 24 a cell's edge is `2^-24` of the
/// tree scale, far below anything the LOD heuristics will ever ask for.
pub const MAX_OCTAL_DEPTH: usize = 24;

/// Path from the root to a cell: one octant index (0..8) per level.
///
/// Wire encoding packs the path as `[depth: 1 byte]` followed by
/// `ceil(3 * depth / 8)` bytes of octant triplets, most significant bits
/// first. Depth 0 is the root itself and encodes as the single byte `0`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OctalCode {
    octants: Vec<u8>,
}

impl OctalCode {
    /// The root path (depth 0).
    pub fn root() -> Self {
        Self::default()
    }

    /// Build from explicit octant indices. Returns `None` when any index is
    /// out of range or the path is deeper than `MAX_OCTAL_DEPTH`.
    pub fn from_octants(octants: &[u8]) -> Option<Self> {
        if octants.len() > MAX_OCTAL_DEPTH || octants.iter().any(|&o| o >= 8) {
            return None;
        }
        Some(Self {
            octants: octants.to_vec(),
        })
    }

    pub fn depth(&self) -> usize {
        self.octants.len()
    }

    pub fn octants(&self) -> &[u8] {
        &self.octants
    }

    pub fn is_root(&self) -> bool {
        self.octants.is_empty()
    }

    /// The path one level deeper through `octant`.
    pub fn child(&self, octant: u8) -> Option<Self> {
        if octant >= 8 || self.octants.len() >= MAX_OCTAL_DEPTH {
            return None;
        }
        let mut octants = self.octants.clone();
        octants.push(octant);
        Some(Self { octants })
    }

    /// The cube this path addresses, derived by descending from the root.
    pub fn cube(&self) -> Cube {
        let mut cube = Cube::ROOT;
        for &octant in &self.octants {
            cube = cube.child(octant);
        }
        cube
    }

    /// Number of bytes this path occupies on the wire.
    pub fn packed_len(&self) -> usize {
        1 + (self.octants.len() * 3).div_ceil(8)
    }

    /// Append the packed wire form to `out`.
    pub fn write_packed(&self, out: &mut Vec<u8>) {
        out.push(self.octants.len() as u8);
        let mut acc = 0u16;
        let mut bits = 0u32;
        for &octant in &self.octants {
            acc = (acc << 3) | octant as u16;
            bits += 3;
            if bits >= 8 {
                bits -= 8;
                out.push((acc >> bits) as u8);
                acc &= (1u16 << bits) - 1;
            }
        }
        if bits > 0 {
            out.push((acc << (8 - bits)) as u8);
        }
    }

    /// Read a packed path from the front of `bytes`. Returns the path and
    /// the number of bytes consumed, or `None` when the bytes are truncated
    /// or the depth byte is out of range.
    pub fn read_packed(bytes: &[u8]) -> Option<(Self, usize)> {
        let (&depth_byte, rest) = bytes.split_first()?;
        let depth = depth_byte as usize;
        if depth > MAX_OCTAL_DEPTH {
            return None;
        }
        let packed_bytes = (depth * 3).div_ceil(8);
        if rest.len() < packed_bytes {
            return None;
        }
        let mut octants = Vec::with_capacity(depth);
        let mut acc = 0u16;
        let mut bits = 0u32;
        let mut next = 0usize;
        for _ in 0..depth {
            while bits < 3 {
                acc = (acc << 8) | rest[next] as u16;
                next += 1;
                bits += 8;
            }
            bits -= 3;
            octants.push(((acc >> bits) & 0x7) as u8);
            acc &= (1u16 << bits) - 1;
        }
        Some((Self { octants }, 1 + packed_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_round_trip_at_varied_depths() {
        let cases: &[&[u8]] = &[
            &[],
            &[0],
            &[7],
            &[1, 2, 3],
            &[7, 7, 7, 7, 7, 7, 7, 7],
            &[0, 1, 2, 3, 4, 5, 6, 7, 0, 1, 2],
        ];
        for octants in cases {
            let code = OctalCode::from_octants(octants).expect("valid octants");
            let mut buf = Vec::new();
            code.write_packed(&mut buf);
            assert_eq!(buf.len(), code.packed_len());
            let (decoded, consumed) = OctalCode::read_packed(&buf).expect("decode");
            assert_eq!(decoded, code);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn read_packed_rejects_truncation() {
        let code = OctalCode::from_octants(&[1, 2, 3, 4, 5]).unwrap();
        let mut buf = Vec::new();
        code.write_packed(&mut buf);
        for cut in 0..buf.len() {
            assert!(OctalCode::read_packed(&buf[..cut]).is_none());
        }
    }

    #[test]
    fn from_octants_rejects_bad_input() {
        assert!(OctalCode::from_octants(&[8]).is_none());
        assert!(OctalCode::from_octants(&[0; MAX_OCTAL_DEPTH + 1]).is_none());
    }

    #[test]
    fn cube_matches_manual_descent() {
        let code = OctalCode::from_octants(&[1, 4]).unwrap();
        let expected = Cube::ROOT.child(1).child(4);
        assert_eq!(code.cube(), expected);
    }

    #[test]
    fn read_packed_leaves_trailing_bytes() {
        let code = OctalCode::from_octants(&[3, 3]).unwrap();
        let mut buf = Vec::new();
        code.write_packed(&mut buf);
        buf.extend_from_slice(&[0xAA, 0xBB]);
        let (decoded, consumed) = OctalCode::read_packed(&buf).unwrap();
        assert_eq!(decoded, code);
        assert_eq!(consumed, buf.len() - 2);
    }
}
