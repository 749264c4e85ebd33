use super::monotonic_ms;
use crate::shared::bitstream::{read_bitstream_to_tree, ReadBitstreamParams};
use crate::shared::octree::SequenceOutcome;
use crate::shared::packet::{
    decompress_section, PacketError, PacketHeader, PacketType, SectionIter,
};
use crate::shared::session::ClockSkewEstimator;
use crate::shared::sync::SyncedOctree;
use std::io::Read;
use std::net::TcpStream;
use std::thread;
use std::time::Instant;

/// Ceiling on one length-prefixed frame. Anything larger is a broken or
/// hostile peer.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Per-connection state the ingest loop keeps between packets.
#[derive(Debug, Default)]
pub struct PeerSession {
    pub skew: ClockSkewEstimator,
}

/// What one packet did to the tree, for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AppliedTotals {
    pub sections: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub flight_time_ms: f64,
}

/// Decode one packet and apply it to the tree.
///
/// Sections are decompressed before the lock is taken; the write lock is
/// then held exactly once for the whole packet, so a concurrent reader sees
/// either none or all of its mutations. Sequence anomalies are logged and
/// the packet applied anyway — arrival order wins.
pub(crate) fn apply_packet_bytes(
    tree: &SyncedOctree,
    session: &mut PeerSession,
    bytes: &[u8],
    arrival_ms: u64,
) -> Result<AppliedTotals, PacketError> {
    let header = PacketHeader::decode(bytes)?;
    session
        .skew
        .observe(header.sent_timestamp_ms, arrival_ms);
    let flight_time_ms = session
        .skew
        .flight_time_ms(header.sent_timestamp_ms, arrival_ms);

    let mut totals = AppliedTotals {
        flight_time_ms,
        ..AppliedTotals::default()
    };

    // Inflate outside the lock so decompression cost never blocks readers.
    let payload = &bytes[header.payload_offset()..];
    let mut sections = Vec::new();
    for section in SectionIter::new(payload, header.flags) {
        if header.flags.is_compressed() {
            match decompress_section(section) {
                Ok(body) => sections.push(body),
                Err(error) => {
                    log::warn!(
                        "source {}: dropping undecompressable section: {error}",
                        header.source_id
                    );
                }
            }
        } else {
            sections.push(section.to_vec());
        }
    }

    let mut tree = tree.write();
    match tree.observe_sequence(header.source_id, header.sequence, arrival_ms) {
        SequenceOutcome::Duplicate => log::warn!(
            "source {}: duplicate sequence {}",
            header.source_id,
            header.sequence
        ),
        SequenceOutcome::Regressed => log::warn!(
            "source {}: sequence regressed to {}",
            header.source_id,
            header.sequence
        ),
        SequenceOutcome::FirstSeen | SequenceOutcome::InOrder => {}
    }

    match header.packet_type {
        PacketType::EraseAll => {
            tree.erase_all();
        }
        PacketType::TreeData => {
            let params = ReadBitstreamParams {
                want_color: header.flags.has_color(),
                want_existence_bits: true,
                expected_version: tree.protocol_version(),
                source_id: header.source_id,
                overwrite_local: true,
            };
            for section in &sections {
                match read_bitstream_to_tree(
                    &mut tree,
                    section,
                    header.protocol_version,
                    &params,
                ) {
                    Ok(outcome) => {
                        totals.sections += 1;
                        totals.updated += outcome.updated;
                        totals.deleted += outcome.deleted;
                        totals.skipped += outcome.skipped;
                    }
                    Err(error) => {
                        log::warn!(
                            "source {}: rejecting section: {error}",
                            header.source_id
                        );
                    }
                }
            }
        }
    }

    Ok(totals)
}

pub(super) fn spawn_client_thread(stream: TcpStream, tree: SyncedOctree, start: Instant) {
    let peer_label = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());

    thread::spawn(move || {
        eprintln!("client connected from {}", peer_label);
        let mut session = PeerSession::default();
        let mut reader = stream;
        let mut len_buf = [0u8; 4];

        loop {
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(error) => {
                    eprintln!("read error from {}: {}", peer_label, error);
                    break;
                }
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_FRAME_LEN {
                eprintln!("{} sent oversized frame ({} bytes)", peer_label, len);
                break;
            }
            let mut frame = vec![0u8; len];
            match reader.read_exact(&mut frame) {
                Ok(()) => {}
                Err(error) => {
                    eprintln!("read error from {}: {}", peer_label, error);
                    break;
                }
            }

            let arrival_ms = monotonic_ms(start);
            match apply_packet_bytes(&tree, &mut session, &frame, arrival_ms) {
                Ok(totals) => {
                    log::debug!(
                        "{}: {} sections, {} updated, {} deleted, {} skipped, flight {:.1} ms",
                        peer_label,
                        totals.sections,
                        totals.updated,
                        totals.deleted,
                        totals.skipped,
                        totals.flight_time_ms
                    );
                }
                Err(error) => {
                    eprintln!("invalid packet from {}: {}", peer_label, error);
                }
            }
        }

        eprintln!("client {} disconnected", peer_label);
    });
}
