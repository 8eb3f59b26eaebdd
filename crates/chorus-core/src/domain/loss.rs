//! Loss arithmetic: gap detection over the wrapping sequence space and
//! transport-layer NACK pair encoding.

use rtcp::transport_feedbacks::transport_layer_nack::NackPair;
use rtp::header::Header;
use rtp::packet::Packet;

use super::clock::PACKET_EXPIRATION;

/// Most missing sequences reportable per stream step: the pair base plus the
/// 16 bitmap bits.
pub const NACK_WINDOW: u16 = 17;

/// Accumulated-loss count at which the originator flushes without waiting
/// for the gap to age.
pub const NACK_BATCH: usize = 16;

/// Header-only descriptors for the sequences missing between the last
/// accepted packet `(prev_seq, prev_ts)` and the newly arrived `packet`.
///
/// A step of more than half the expiration window (~250 ms of media time) is
/// treated as a discontinuity rather than recoverable loss and reports
/// nothing. When more than [`NACK_WINDOW`] sequences are missing, only the
/// most recent window is reported. All sequence arithmetic is mod 2^16, so a
/// gap crossing the 16-bit wrap is reported as one contiguous range.
///
/// The descriptors carry `prev_ts` — the timestamp the missing slots were
/// expected around — and the new packet's SSRC.
pub fn missing_between(prev_seq: u16, prev_ts: u32, packet: &Packet) -> Vec<Header> {
    if prev_ts.wrapping_add(PACKET_EXPIRATION / 2) < packet.header.timestamp {
        return Vec::new();
    }
    let mut gap = packet.header.sequence_number.wrapping_sub(prev_seq);
    let mut next = prev_seq;
    if gap > NACK_WINDOW {
        next = prev_seq.wrapping_add(gap - NACK_WINDOW);
        gap = NACK_WINDOW;
    }
    (1..gap)
        .map(|i| Header {
            sequence_number: next.wrapping_add(i),
            timestamp: prev_ts,
            ssrc: packet.header.ssrc,
            ..Header::default()
        })
        .collect()
}

/// Encode the accumulated loss descriptors as a single NACK pair anchored at
/// the first entry. Followers whose wrapping offset from the base does not
/// fit the 16-bit bitmap are dropped. `None` when `lost` is empty.
pub fn encode_pair(lost: &[Header]) -> Option<NackPair> {
    let first = lost.first()?;
    let packet_id = first.sequence_number;
    let mut lost_packets = 0u16;
    for header in &lost[1..] {
        let offset = header.sequence_number.wrapping_sub(packet_id);
        if offset == 0 || offset > 16 {
            continue;
        }
        lost_packets |= 1 << (offset - 1);
    }
    Some(NackPair {
        packet_id,
        lost_packets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arrival(seq: u16, ts: u32) -> Packet {
        let mut p = Packet::default();
        p.header.sequence_number = seq;
        p.header.timestamp = ts;
        p.header.ssrc = 0xCAFE;
        p
    }

    fn seqs(headers: &[Header]) -> Vec<u16> {
        headers.iter().map(|h| h.sequence_number).collect()
    }

    #[test]
    fn no_gap_no_descriptors() {
        assert!(missing_between(1049, 57_040, &arrival(1050, 58_000)).is_empty());
    }

    #[test]
    fn single_missing_sequence() {
        let lost = missing_between(1049, 57_040, &arrival(1051, 58_960));
        assert_eq!(seqs(&lost), vec![1050]);
        assert_eq!(lost[0].timestamp, 57_040);
        assert_eq!(lost[0].ssrc, 0xCAFE);
    }

    #[test]
    fn burst_reports_every_missing_sequence() {
        let lost = missing_between(1049, 57_040, &arrival(1056, 63_760));
        assert_eq!(seqs(&lost), vec![1050, 1051, 1052, 1053, 1054, 1055]);
    }

    #[test]
    fn wide_gap_keeps_the_most_recent_window() {
        let lost = missing_between(1000, 10_000, &arrival(1100, 14_000));
        // 99 missing; only the 16 closest to the arrival are reported.
        assert_eq!(lost.len(), 16);
        assert_eq!(seqs(&lost), (1084..1100).collect::<Vec<u16>>());
    }

    #[test]
    fn gap_across_the_wrap_is_contiguous() {
        let lost = missing_between(65_533, 10_000, &arrival(2, 13_840));
        assert_eq!(seqs(&lost), vec![65_534, 65_535, 0, 1]);
    }

    #[test]
    fn old_discontinuity_reports_nothing() {
        // The step is ~21 s of media time ahead; retransmission would be futile.
        assert!(missing_between(1000, 10_000, &arrival(1005, 1_010_000)).is_empty());
    }

    #[test]
    fn pair_encodes_base_and_followers() {
        let lost = missing_between(1049, 57_040, &arrival(1056, 63_760));
        let pair = encode_pair(&lost).unwrap();
        assert_eq!(pair.packet_id, 1050);
        assert_eq!(pair.lost_packets, 0b1_1111);
        assert_eq!(pair.packet_list(), vec![1050, 1051, 1052, 1053, 1054, 1055]);
    }

    #[test]
    fn pair_encoding_crosses_the_wrap() {
        let lost = missing_between(65_533, 10_000, &arrival(2, 13_840));
        let pair = encode_pair(&lost).unwrap();
        assert_eq!(pair.packet_id, 65_534);
        // 65 535, 0, 1 sit at wrapping offsets 1, 2, 3 from the base.
        assert_eq!(pair.lost_packets, 0b111);
    }

    #[test]
    fn followers_outside_the_bitmap_are_dropped() {
        let far = Header {
            sequence_number: 1100,
            ..Header::default()
        };
        let base = Header {
            sequence_number: 1050,
            ..Header::default()
        };
        let pair = encode_pair(&[base, far]).unwrap();
        assert_eq!(pair.packet_id, 1050);
        assert_eq!(pair.lost_packets, 0);
    }

    #[test]
    fn empty_accumulator_encodes_nothing() {
        assert!(encode_pair(&[]).is_none());
    }
}
