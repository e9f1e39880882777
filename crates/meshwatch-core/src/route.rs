//! Route reconstruction
//!
//! Discovered routes arrive as hop-number lists that may contain the
//! broadcast sentinel where a relay's identity was never learned. The
//! segment builder turns such a sequence into directed edges between the
//! known nodes, letting one edge bridge a run of unknown relays via its hop
//! count. SNR is only trustworthy for directly-adjacent pairs, so it is
//! attached only to zero-unknown segments.

use crate::identity::is_broadcast;
use tracing::warn;

/// One directed edge emitted by the segment builder.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeSegment {
    pub source: u32,
    pub target: u32,
    /// Unknown relays between source and target; 0 means adjacent.
    pub hop_count: u32,
    /// Link SNR, present only when `hop_count == 0` and the hop had a
    /// measurement.
    pub snr: Option<f32>,
}

/// Map raw hop numbers to resolved hops, turning the broadcast sentinel
/// into an unknown-hop placeholder. Logs when the sentinel shows up since
/// it usually means a misbehaving relay.
pub fn resolve_hops(raw: &[u32]) -> Vec<Option<u32>> {
    raw.iter()
        .map(|&num| {
            if is_broadcast(num) {
                warn!(hop = num, "broadcast sentinel in route, treating as unknown hop");
                None
            } else {
                Some(num)
            }
        })
        .collect()
}

/// Wire SNR values are quarter-dB; scale down for storage.
pub fn scale_snr(raw: &[i32]) -> Vec<f32> {
    raw.iter().map(|&v| v as f32 / 4.0).collect()
}

/// Walk a resolved hop sequence and emit edge segments between known nodes.
///
/// Unknown placeholders between two known nodes become the segment's hop
/// count. Leading unknowns have no source to anchor to and trailing
/// unknowns have no target, so both are dropped. The SNR list is indexed by
/// the segment's source position.
pub fn build_edge_segments(hops: &[Option<u32>], snr: &[f32]) -> Vec<EdgeSegment> {
    let mut segments = Vec::new();
    let mut last_known: Option<usize> = None;
    let mut unknown_count: u32 = 0;

    for (i, hop) in hops.iter().enumerate() {
        match hop {
            None => unknown_count += 1,
            Some(node) => {
                if let Some(j) = last_known {
                    // hops[j] is Some by construction of last_known.
                    let source = hops[j].unwrap();
                    let snr_value = if unknown_count == 0 {
                        snr.get(j).copied()
                    } else {
                        None
                    };
                    segments.push(EdgeSegment {
                        source,
                        target: *node,
                        hop_count: unknown_count,
                        snr: snr_value,
                    });
                }
                last_known = Some(i);
                unknown_count = 0;
            }
        }
    }

    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::BROADCAST_NUM;

    const A: u32 = 1;
    const B: u32 = 2;
    const C: u32 = 3;

    #[test]
    fn adjacent_nodes_get_zero_hop_segments_with_snr() {
        let hops = vec![Some(A), Some(B), Some(C)];
        let snr = vec![5.0, 7.5];
        let segments = build_edge_segments(&hops, &snr);

        assert_eq!(
            segments,
            vec![
                EdgeSegment { source: A, target: B, hop_count: 0, snr: Some(5.0) },
                EdgeSegment { source: B, target: C, hop_count: 0, snr: Some(7.5) },
            ]
        );
    }

    #[test]
    fn unknown_run_is_bridged_by_one_segment() {
        let hops = vec![Some(A), None, None, Some(B)];
        let segments = build_edge_segments(&hops, &[1.0, 2.0, 3.0]);

        assert_eq!(
            segments,
            vec![EdgeSegment { source: A, target: B, hop_count: 2, snr: None }]
        );
    }

    #[test]
    fn leading_unknown_has_no_segment() {
        let hops = vec![None, Some(A)];
        assert!(build_edge_segments(&hops, &[]).is_empty());
    }

    #[test]
    fn trailing_unknowns_are_dropped() {
        let hops = vec![Some(A), None];
        assert!(build_edge_segments(&hops, &[]).is_empty());

        let hops = vec![Some(A), Some(B), None, None];
        let segments = build_edge_segments(&hops, &[4.0]);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].target, B);
    }

    #[test]
    fn missing_snr_index_leaves_snr_absent() {
        let hops = vec![Some(A), Some(B)];
        let segments = build_edge_segments(&hops, &[]);
        assert_eq!(segments[0].snr, None);
        assert_eq!(segments[0].hop_count, 0);
    }

    #[test]
    fn resolve_hops_maps_sentinel_to_placeholder() {
        let resolved = resolve_hops(&[A, BROADCAST_NUM, B]);
        assert_eq!(resolved, vec![Some(A), None, Some(B)]);
    }

    #[test]
    fn snr_scaling_divides_wire_units_by_four() {
        assert_eq!(scale_snr(&[20, -14, 0]), vec![5.0, -3.5, 0.0]);
    }
}
