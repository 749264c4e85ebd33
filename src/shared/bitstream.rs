use crate::shared::octal::OctalCode;
use crate::shared::octree::{Octree, OctreeError, VoxelColor};
use crate::shared::packet::PROTOCOL_VERSION;
use crate::shared::traverse::{calculate_should_render, LodParams, ViewVolume};
use std::fmt;

/// Per-record flag bits inside a section.
const RECORD_HAS_CONTENT: u8 = 0x01;
const RECORD_DELETE: u8 = 0x02;

/// A section is a flat run of records, each
/// `[packed octal code][flags: 1]` plus 3 RGB bytes when the content flag
/// is set. A delete-flagged record marks the addressed subtree absent
/// instead of carrying content.
#[derive(Clone, Debug, PartialEq, Eq)]
enum RecordAction {
    SetContent(VoxelColor),
    Delete,
    /// Parsed but carrying neither flag; never emitted by the encoder and
    /// ignored on apply.
    Nothing,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Record {
    code: OctalCode,
    action: RecordAction,
}

/// How an incoming section should be applied to the local tree.
#[derive(Clone, Copy, Debug)]
pub struct ReadBitstreamParams {
    /// Apply color-bearing records. When false they are counted skipped.
    pub want_color: bool,
    /// Apply delete records (existence information). When false they are
    /// counted skipped.
    pub want_existence_bits: bool,
    /// Sections stamped with any other protocol version are rejected whole.
    pub expected_version: u8,
    /// Peer the section came from, for diagnostics.
    pub source_id: u16,
    /// When false, records never replace content the local tree already
    /// has — the local data wins.
    pub overwrite_local: bool,
}

impl ReadBitstreamParams {
    pub fn for_version(expected_version: u8) -> Self {
        Self {
            want_color: true,
            want_existence_bits: true,
            expected_version,
            source_id: 0,
            overwrite_local: true,
        }
    }
}

impl Default for ReadBitstreamParams {
    fn default() -> Self {
        Self::for_version(PROTOCOL_VERSION)
    }
}

/// Counters from applying one section.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecodeOutcome {
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitstreamError {
    /// A record's bytes ran out mid-parse. Nothing from the section is
    /// applied.
    TruncatedRecord { offset: usize },
    VersionMismatch { expected: u8, actual: u8 },
}

impl fmt::Display for BitstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedRecord { offset } => {
                write!(f, "truncated bitstream record at offset {offset}")
            }
            Self::VersionMismatch { expected, actual } => {
                write!(f, "bitstream version mismatch: expected {expected}, got {actual}")
            }
        }
    }
}

impl std::error::Error for BitstreamError {}

fn parse_section(section: &[u8]) -> Result<Vec<Record>, BitstreamError> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < section.len() {
        let Some((code, consumed)) = OctalCode::read_packed(&section[offset..]) else {
            return Err(BitstreamError::TruncatedRecord { offset });
        };
        let Some(&flags) = section.get(offset + consumed) else {
            return Err(BitstreamError::TruncatedRecord { offset });
        };
        let mut next = offset + consumed + 1;
        let action = if flags & RECORD_DELETE != 0 {
            RecordAction::Delete
        } else if flags & RECORD_HAS_CONTENT != 0 {
            let Some(rgb) = section.get(next..next + 3) else {
                return Err(BitstreamError::TruncatedRecord { offset });
            };
            next += 3;
            RecordAction::SetContent(VoxelColor([rgb[0], rgb[1], rgb[2]]))
        } else {
            RecordAction::Nothing
        };
        records.push(Record { code, action });
        offset = next;
    }
    Ok(records)
}

/// Apply one decompressed section to the tree.
///
/// Records are parsed in full before anything is applied, so a truncated
/// section leaves the tree untouched — a record is consumed atomically or
/// the section is rejected. Applying the same section twice is observably
/// a no-op the second time.
pub fn read_bitstream_to_tree(
    tree: &mut Octree,
    section: &[u8],
    section_version: u8,
    params: &ReadBitstreamParams,
) -> Result<DecodeOutcome, BitstreamError> {
    if section_version != params.expected_version {
        return Err(BitstreamError::VersionMismatch {
            expected: params.expected_version,
            actual: section_version,
        });
    }
    let records = parse_section(section)?;

    let mut outcome = DecodeOutcome::default();
    for record in records {
        match record.action {
            RecordAction::SetContent(color) => {
                if !params.want_color {
                    outcome.skipped += 1;
                    continue;
                }
                if !params.overwrite_local && tree.content_at(&record.code).is_some() {
                    outcome.skipped += 1;
                    continue;
                }
                match tree.set_content(&record.code, color) {
                    Ok(_) => outcome.updated += 1,
                    Err(OctreeError::InvalidAddress) => {
                        log::warn!(
                            "source {}: dropping record with unaddressable path",
                            params.source_id
                        );
                        outcome.skipped += 1;
                    }
                }
            }
            RecordAction::Delete => {
                if !params.want_existence_bits {
                    outcome.skipped += 1;
                    continue;
                }
                match tree.delete_at(&record.code) {
                    Ok(true) => outcome.deleted += 1,
                    Ok(false) => outcome.skipped += 1,
                    Err(OctreeError::InvalidAddress) => {
                        log::warn!(
                            "source {}: dropping delete with unaddressable path",
                            params.source_id
                        );
                        outcome.skipped += 1;
                    }
                }
            }
            RecordAction::Nothing => outcome.skipped += 1,
        }
    }
    Ok(outcome)
}

/// Append a delete record for `code` to a section body.
pub fn encode_delete_record(code: &OctalCode, out: &mut Vec<u8>) {
    code.write_packed(out);
    out.push(RECORD_DELETE);
}

/// Whether an encode call drained everything it was asked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendState {
    /// Every candidate node fit in the budget.
    Completed,
    /// Some fit; the rest are left pending for a later section.
    Partial,
    /// The budget could not hold even one record.
    NoneFit,
}

#[derive(Clone, Copy, Debug)]
pub struct EncodeBitstreamParams {
    /// Hard ceiling on bytes appended to the section body.
    pub max_bytes: usize,
    /// When set, only nodes inside the view that pass the LOD heuristic
    /// are considered.
    pub view: Option<ViewVolume>,
    pub lod: LodParams,
    /// When true, only nodes whose content changed since the last encode
    /// are written, and writing clears that mark — successive calls
    /// continue where the budget cut the previous one off.
    pub dirty_only: bool,
}

impl EncodeBitstreamParams {
    pub fn budgeted(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            view: None,
            lod: LodParams::default(),
            dirty_only: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncodeOutcome {
    pub state: AppendState,
    pub bytes_written: usize,
    pub nodes_written: usize,
    /// Candidates that did not fit; retry them in a subsequent section.
    pub nodes_skipped: usize,
}

/// Serialize content nodes into a section body, bounded by the byte budget.
pub fn encode_tree_bitstream(
    tree: &mut Octree,
    out: &mut Vec<u8>,
    params: &EncodeBitstreamParams,
) -> EncodeOutcome {
    let candidates: Vec<(OctalCode, VoxelColor)> = tree
        .collect_content()
        .into_iter()
        .filter(|(code, _)| {
            if params.dirty_only {
                let pending = tree
                    .node_at(code)
                    .and_then(|id| tree.node(id))
                    .map(|node| node.pending_send())
                    .unwrap_or(false);
                if !pending {
                    return false;
                }
            }
            if let Some(view) = &params.view {
                let cube = code.cube();
                if !view.bounds.intersects_cube(&cube)
                    || !calculate_should_render(&cube, view.eye, &params.lod)
                {
                    return false;
                }
            }
            true
        })
        .collect();

    let mut written = 0usize;
    let mut bytes_written = 0usize;
    let mut skipped = 0usize;
    for (code, color) in &candidates {
        let record_len = code.packed_len() + 1 + 3;
        if bytes_written + record_len > params.max_bytes {
            skipped += 1;
            continue;
        }
        code.write_packed(out);
        out.push(RECORD_HAS_CONTENT);
        out.extend_from_slice(&color.0);
        bytes_written += record_len;
        written += 1;
        if params.dirty_only {
            if let Some(id) = tree.node_at(code) {
                if let Some(node) = tree.node_mut(id) {
                    node.clear_pending_send();
                }
            }
        }
    }

    let state = if skipped == 0 {
        AppendState::Completed
    } else if written == 0 {
        AppendState::NoneFit
    } else {
        AppendState::Partial
    };
    EncodeOutcome {
        state,
        bytes_written,
        nodes_written: written,
        nodes_skipped: skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::spatial::Aabb3;

    fn code(octants: &[u8]) -> OctalCode {
        OctalCode::from_octants(octants).unwrap()
    }

    fn tree_with(paths: &[(&[u8], [u8; 3])]) -> Octree {
        let mut tree = Octree::new(PROTOCOL_VERSION);
        for (octants, rgb) in paths {
            tree.set_content(&code(octants), VoxelColor(*rgb)).unwrap();
        }
        tree
    }

    #[test]
    fn encode_decode_round_trip_under_budget() {
        let mut source = tree_with(&[
            (&[0], [255, 0, 0]),
            (&[1, 2], [0, 255, 0]),
            (&[7, 7, 7], [0, 0, 255]),
            (&[3], [10, 20, 30]),
        ]);
        let expected = source.collect_content();

        // Budget small enough to force several sections.
        let mut sections = Vec::new();
        loop {
            let mut body = Vec::new();
            let outcome = encode_tree_bitstream(
                &mut source,
                &mut body,
                &EncodeBitstreamParams {
                    dirty_only: true,
                    ..EncodeBitstreamParams::budgeted(16)
                },
            );
            if outcome.nodes_written == 0 {
                break;
            }
            sections.push(body);
            if outcome.state == AppendState::Completed {
                break;
            }
        }
        assert!(sections.len() > 1);

        let mut rebuilt = Octree::new(PROTOCOL_VERSION);
        let params = ReadBitstreamParams::default();
        for section in &sections {
            read_bitstream_to_tree(&mut rebuilt, section, PROTOCOL_VERSION, &params).unwrap();
        }
        let mut actual = rebuilt.collect_content();
        let mut expected = expected;
        actual.sort();
        expected.sort();
        assert_eq!(actual, expected);
    }

    #[test]
    fn decoding_twice_is_idempotent() {
        let mut source = tree_with(&[(&[0], [255, 0, 0]), (&[4, 4], [9, 9, 9])]);
        let mut body = Vec::new();
        encode_tree_bitstream(&mut source, &mut body, &EncodeBitstreamParams::budgeted(1024));

        let mut tree = Octree::new(PROTOCOL_VERSION);
        let params = ReadBitstreamParams::default();
        read_bitstream_to_tree(&mut tree, &body, PROTOCOL_VERSION, &params).unwrap();
        let first = tree.collect_content();
        let first_count = tree.node_count();
        read_bitstream_to_tree(&mut tree, &body, PROTOCOL_VERSION, &params).unwrap();
        assert_eq!(tree.collect_content(), first);
        assert_eq!(tree.node_count(), first_count);
    }

    #[test]
    fn truncated_record_applies_nothing() {
        let mut source = tree_with(&[(&[0], [255, 0, 0]), (&[1], [0, 255, 0])]);
        let mut body = Vec::new();
        encode_tree_bitstream(&mut source, &mut body, &EncodeBitstreamParams::budgeted(1024));
        body.truncate(body.len() - 1);

        let mut tree = Octree::new(PROTOCOL_VERSION);
        let err = read_bitstream_to_tree(
            &mut tree,
            &body,
            PROTOCOL_VERSION,
            &ReadBitstreamParams::default(),
        )
        .unwrap_err();
        assert!(matches!(err, BitstreamError::TruncatedRecord { .. }));
        assert!(tree.collect_content().is_empty());
        assert_eq!(tree.node_count(), 1);
        assert!(!tree.is_dirty());
    }

    #[test]
    fn version_mismatch_rejects_section() {
        let mut tree = Octree::new(PROTOCOL_VERSION);
        let err = read_bitstream_to_tree(
            &mut tree,
            &[],
            PROTOCOL_VERSION + 1,
            &ReadBitstreamParams::default(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            BitstreamError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: PROTOCOL_VERSION + 1,
            }
        );
    }

    #[test]
    fn delete_record_prunes_path() {
        let mut tree = tree_with(&[(&[2, 5], [1, 2, 3])]);
        let mut body = Vec::new();
        encode_delete_record(&code(&[2, 5]), &mut body);
        let outcome = read_bitstream_to_tree(
            &mut tree,
            &body,
            PROTOCOL_VERSION,
            &ReadBitstreamParams::default(),
        )
        .unwrap();
        assert_eq!(outcome.deleted, 1);
        assert!(tree.collect_content().is_empty());
        // Intermediate node at [2] is pruned too.
        assert_eq!(tree.node_count(), 1);
    }

    #[test]
    fn overwrite_local_false_keeps_existing_content() {
        let mut remote = tree_with(&[(&[0], [200, 0, 0])]);
        let mut body = Vec::new();
        encode_tree_bitstream(&mut remote, &mut body, &EncodeBitstreamParams::budgeted(1024));

        let mut local = tree_with(&[(&[0], [1, 1, 1])]);
        let params = ReadBitstreamParams {
            overwrite_local: false,
            ..ReadBitstreamParams::default()
        };
        let outcome =
            read_bitstream_to_tree(&mut local, &body, PROTOCOL_VERSION, &params).unwrap();
        assert_eq!(outcome.skipped, 1);
        assert_eq!(local.content_at(&code(&[0])), Some(VoxelColor([1, 1, 1])));
    }

    #[test]
    fn view_bounded_encode_drops_out_of_view_nodes() {
        let mut source = tree_with(&[(&[0], [255, 0, 0]), (&[7], [0, 255, 0])]);
        let mut body = Vec::new();
        // Octant 7 occupies the high corner; bound the view to the low one.
        let outcome = encode_tree_bitstream(
            &mut source,
            &mut body,
            &EncodeBitstreamParams {
                view: Some(ViewVolume {
                    bounds: Aabb3::new([0.0, 0.0, 0.0], [0.5, 0.5, 0.5]),
                    eye: [0.25, 0.25, 0.25],
                }),
                ..EncodeBitstreamParams::budgeted(1024)
            },
        );
        assert_eq!(outcome.nodes_written, 1);

        let mut rebuilt = Octree::new(PROTOCOL_VERSION);
        read_bitstream_to_tree(
            &mut rebuilt,
            &body,
            PROTOCOL_VERSION,
            &ReadBitstreamParams::default(),
        )
        .unwrap();
        assert_eq!(rebuilt.content_at(&code(&[0])), Some(VoxelColor([255, 0, 0])));
        assert_eq!(rebuilt.content_at(&code(&[7])), None);
    }

    #[test]
    fn none_fit_when_budget_below_record_size() {
        let mut source = tree_with(&[(&[0], [255, 0, 0])]);
        let mut body = Vec::new();
        let outcome =
            encode_tree_bitstream(&mut source, &mut body, &EncodeBitstreamParams::budgeted(3));
        assert_eq!(outcome.state, AppendState::NoneFit);
        assert_eq!(outcome.nodes_written, 0);
        assert_eq!(outcome.nodes_skipped, 1);
        assert!(body.is_empty());
    }
}
