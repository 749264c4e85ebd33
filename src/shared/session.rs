use crate::shared::octal::OctalCode;
use crate::shared::octree::VoxelColor;
use crate::shared::traverse::LodParams;
use std::collections::VecDeque;

/// Smoothing factor for the per-peer clock-skew estimate. The first sample
/// seeds the estimate directly; later samples are blended in.
const SKEW_SMOOTHING: f64 = 0.1;

/// Sent packets remembered per peer before the oldest is discarded.
pub const DEFAULT_PACKET_HISTORY: usize = 64;

/// Per-peer estimate of `their_clock - our_clock`, smoothed over observed
/// packets so one delayed packet does not swing the flight-time numbers.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClockSkewEstimator {
    skew_ms: f64,
    samples: u64,
}

impl ClockSkewEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one observation: a packet stamped `sent_ms` on the peer's
    /// clock that arrived at `arrival_ms` on ours. The raw difference
    /// includes true flight time, so the smoothed value converges on
    /// skew-plus-typical-flight; what matters downstream is stability.
    pub fn observe(&mut self, sent_ms: u64, arrival_ms: u64) {
        let raw = arrival_ms as f64 - sent_ms as f64;
        if self.samples == 0 {
            self.skew_ms = raw;
        } else {
            self.skew_ms += (raw - self.skew_ms) * SKEW_SMOOTHING;
        }
        self.samples += 1;
    }

    pub fn skew_ms(&self) -> f64 {
        self.skew_ms
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Estimated one-way transit time for a packet: how much this packet
    /// deviated from the smoothed baseline.
    pub fn flight_time_ms(&self, sent_ms: u64, arrival_ms: u64) -> f64 {
        arrival_ms as f64 - sent_ms as f64 - self.skew_ms
    }
}

/// What was in force when a packet was sent: its sequence number and the
/// LOD parameters the encode pass used. Reliable channels use the record
/// acknowledged last as the delta-compression baseline.
#[derive(Clone, Debug, PartialEq)]
pub struct PacketRecord {
    pub sequence: u32,
    pub lod: LodParams,
    pub sent_ms: u64,
    /// Content the peer is known to hold as of this packet. Reliable
    /// senders keep it so a later encode can diff against it; unreliable
    /// channels leave it `None`.
    pub baseline: Option<Vec<(OctalCode, VoxelColor)>>,
}

/// Bounded window of sent-packet records, discarded oldest-first.
#[derive(Clone, Debug)]
pub struct PacketHistory {
    records: VecDeque<PacketRecord>,
    capacity: usize,
}

impl PacketHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(DEFAULT_PACKET_HISTORY)),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record(&mut self, record: PacketRecord) {
        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Take the record for `sequence`, discarding it and everything older.
    /// Returns `None` when the sequence fell out of the window (or was
    /// never recorded) — the caller falls back to a full re-send.
    pub fn acknowledge(&mut self, sequence: u32) -> Option<PacketRecord> {
        let position = self
            .records
            .iter()
            .position(|record| record.sequence == sequence)?;
        self.records.drain(..=position).last()
    }

    pub fn oldest_sequence(&self) -> Option<u32> {
        self.records.front().map(|record| record.sequence)
    }
}

impl Default for PacketHistory {
    fn default() -> Self {
        Self::new(DEFAULT_PACKET_HISTORY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_the_skew() {
        let mut skew = ClockSkewEstimator::new();
        skew.observe(1_000, 1_250);
        assert_eq!(skew.skew_ms(), 250.0);
    }

    #[test]
    fn smoothing_converges_toward_steady_offset() {
        let mut skew = ClockSkewEstimator::new();
        skew.observe(0, 900);
        for i in 1..200u64 {
            skew.observe(i * 100, i * 100 + 500);
        }
        assert!((skew.skew_ms() - 500.0).abs() < 1.0);
        // A steady stream at the baseline reports near-zero flight time.
        assert!(skew.flight_time_ms(20_100, 20_600).abs() < 1.0);
    }

    #[test]
    fn history_discards_oldest_first() {
        let mut history = PacketHistory::new(3);
        for sequence in 0..5u32 {
            history.record(PacketRecord {
                sequence,
                lod: LodParams::default(),
                sent_ms: sequence as u64,
                baseline: None,
            });
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.oldest_sequence(), Some(2));
    }

    #[test]
    fn acknowledge_hands_back_the_recorded_baseline() {
        use crate::shared::octal::OctalCode;
        use crate::shared::octree::VoxelColor;
        let mut history = PacketHistory::default();
        let baseline = vec![(
            OctalCode::from_octants(&[1, 2]).unwrap(),
            VoxelColor([3, 4, 5]),
        )];
        history.record(PacketRecord {
            sequence: 10,
            lod: LodParams::default(),
            sent_ms: 7,
            baseline: Some(baseline.clone()),
        });
        let record = history.acknowledge(10).unwrap();
        assert_eq!(record.baseline.as_deref(), Some(&baseline[..]));
        assert!(history.is_empty());
    }

    #[test]
    fn acknowledge_drops_everything_older() {
        let mut history = PacketHistory::new(8);
        for sequence in 0..6u32 {
            history.record(PacketRecord {
                sequence,
                lod: LodParams::default(),
                sent_ms: 0,
                baseline: None,
            });
        }
        let record = history.acknowledge(3).expect("sequence 3 is in the window");
        assert_eq!(record.sequence, 3);
        assert_eq!(history.oldest_sequence(), Some(4));
        assert!(history.acknowledge(2).is_none());
    }
}
