//! Types for TCP stream reassembly.
//!
//! One [`HalfStream`] per flow direction turns raw segments into the
//! in-order contiguous chunks the dissection engine expects, dropping
//! retransmissions and buffering out-of-order data until the gap fills.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Identifier for a two-way flow, normalized so both directions map to the
/// same key.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FlowId {
    pub ip0: Ipv4Addr,
    pub port0: u16,
    pub ip1: Ipv4Addr,
    pub port1: u16,
    pub protocol: u8,
}

impl FlowId {
    pub fn from_pairs(protocol: u8, p0: (Ipv4Addr, u16), p1: (Ipv4Addr, u16)) -> Self {
        let ((ip0, port0), (ip1, port1)) = if p0 <= p1 { (p0, p1) } else { (p1, p0) };
        Self {
            ip0,
            port0,
            ip1,
            port1,
            protocol,
        }
    }
}

/// `true` when `a` comes before `b` in sequence-number space, accounting for
/// wrap-around.
fn seq_before(a: u32, b: u32) -> bool {
    a != b && b.wrapping_sub(a) < 0x8000_0000
}

/// Reassembly state for one direction of a TCP flow.
#[derive(Debug, Default)]
pub struct HalfStream {
    next_seq: Option<u32>,
    /// Absolute stream offset of the next byte to deliver.
    offset: u64,
    /// Out-of-order segments waiting for the gap before them to fill.
    pending: BTreeMap<u32, Vec<u8>>,
}

impl HalfStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one segment. Returns the contiguous chunks that became ready, as
    /// `(absolute stream offset, bytes)` pairs in stream order.
    pub fn add_segment(&mut self, seq: u32, data: &[u8]) -> Vec<(u64, Vec<u8>)> {
        let mut ready = Vec::new();
        if data.is_empty() {
            return ready;
        }

        match self.next_seq {
            // First segment of the direction sets the base
            None => self.deliver(seq, data.to_vec(), &mut ready),
            Some(next) => {
                if seq == next {
                    self.deliver(seq, data.to_vec(), &mut ready);
                } else if seq_before(seq, next) {
                    // Retransmission; deliver only bytes we have not seen
                    let overlap = next.wrapping_sub(seq) as usize;
                    if overlap < data.len() {
                        self.deliver(next, data[overlap..].to_vec(), &mut ready);
                    }
                } else {
                    self.pending.insert(seq, data.to_vec());
                }
            }
        }

        ready
    }

    fn deliver(&mut self, seq: u32, data: Vec<u8>, ready: &mut Vec<(u64, Vec<u8>)>) {
        let mut next = seq.wrapping_add(data.len() as u32);
        ready.push((self.offset, data));
        self.offset += ready.last().map(|(_, d)| d.len() as u64).unwrap_or(0);

        // Accept buffered segments that continue the stream
        while let Some(data) = self.pending.remove(&next) {
            next = next.wrapping_add(data.len() as u32);
            self.offset += data.len() as u64;
            ready.push((self.offset - data.len() as u64, data));
        }
        // Anything still pending that now lies behind the stream is stale
        let cur = next;
        self.pending.retain(|&s, _| !seq_before(s, cur));

        self.next_seq = Some(next);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn flat(chunks: Vec<(u64, Vec<u8>)>) -> Vec<u8> {
        chunks.into_iter().flat_map(|(_, d)| d).collect()
    }

    #[test]
    fn test_in_order() {
        let mut half = HalfStream::new();
        assert_eq!(vec![0, 1, 2], flat(half.add_segment(1, &[0, 1, 2])));
        assert_eq!(vec![3, 4, 5], flat(half.add_segment(4, &[3, 4, 5])));
        let chunks = half.add_segment(7, &[6, 7]);
        assert_eq!(vec![(6, vec![6, 7])], chunks);
    }

    #[test]
    fn test_out_of_order() {
        let mut half = HalfStream::new();
        // The first segment must be in order to anchor the sequence numbers
        assert_eq!(vec![0, 1, 2], flat(half.add_segment(1, &[0, 1, 2])));

        assert!(half.add_segment(10, &[9, 10, 11]).is_empty());
        assert!(half.add_segment(7, &[6, 7, 8]).is_empty());
        let chunks = half.add_segment(4, &[3, 4, 5]);
        assert_eq!(
            vec![
                (3, vec![3, 4, 5]),
                (6, vec![6, 7, 8]),
                (9, vec![9, 10, 11])
            ],
            chunks
        );
    }

    #[test]
    fn test_duplicate_segments_dropped() {
        let mut half = HalfStream::new();
        assert_eq!(3, flat(half.add_segment(1, &[0, 1, 2])).len());
        assert!(half.add_segment(1, &[0, 1, 2]).is_empty());
        assert_eq!(vec![3, 4, 5], flat(half.add_segment(4, &[3, 4, 5])));
        assert!(half.add_segment(1, &[0, 1, 2]).is_empty());
    }

    #[test]
    fn test_overlapping_retransmission_trimmed() {
        let mut half = HalfStream::new();
        half.add_segment(1, &[0, 1, 2]);
        // Retransmits the last two bytes plus two new ones
        let chunks = half.add_segment(2, &[1, 2, 3, 4]);
        assert_eq!(vec![(3, vec![3, 4])], chunks);
    }

    #[test]
    fn test_wrapping_sequence_numbers() {
        let mut half = HalfStream::new();
        half.add_segment(u32::max_value() - 1, &[0]);
        half.add_segment(u32::max_value(), &[1]);
        half.add_segment(0, &[2]);
        let chunks = half.add_segment(1, &[3]);
        assert_eq!(vec![(3, vec![3])], chunks);
    }

    #[test]
    fn test_flow_id_normalized() {
        let a = ("10.0.0.1".parse().unwrap(), 40000u16);
        let b = ("10.0.0.2".parse().unwrap(), 80u16);
        assert_eq!(FlowId::from_pairs(6, a, b), FlowId::from_pairs(6, b, a));
    }
}
