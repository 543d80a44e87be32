//! Host-side history of sent video fragments, used to answer NACKs.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;

use crate::protocol::Fragment;

/// Default number of fragments kept for retransmission.
pub const DEFAULT_RETRANSMIT_CAPACITY: usize = 4096;

/// Ring of the most recent fragments keyed by sequence number.
#[derive(Debug)]
pub struct RetransmitBuffer {
    capacity: usize,
    fragments: HashMap<u16, Fragment>,
    order: VecDeque<u16>,
    served: u64,
    misses: u64,
}

impl RetransmitBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, u16::MAX as usize / 2);
        Self {
            capacity,
            fragments: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            served: 0,
            misses: 0,
        }
    }

    /// Remember a fragment that was just sent.
    pub fn insert(&mut self, fragment: Fragment) {
        let seq = fragment.header.sequence;
        if self.fragments.insert(seq, fragment).is_none() {
            self.order.push_back(seq);
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.fragments.remove(&old);
            }
        }
    }

    /// Resend copies (flagged `RETRANSMIT`) for every NACKed sequence still
    /// held. Unknown sequences are skipped and counted.
    pub fn answer(&mut self, sequences: &[u16]) -> Vec<Bytes> {
        let mut out = Vec::with_capacity(sequences.len());
        for seq in sequences {
            match self.fragments.get(seq) {
                Some(fragment) => out.push(fragment.as_retransmit()),
                None => self.misses += 1,
            }
        }
        self.served += out.len() as u64;
        out
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Fragments resent so far.
    pub fn served(&self) -> u64 {
        self.served
    }

    /// NACKed sequences that had already been evicted.
    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn clear(&mut self) {
        self.fragments.clear();
        self.order.clear();
    }
}

impl Default for RetransmitBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_RETRANSMIT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::encoder::EncodedPacket;
    use crate::protocol::{FragmentHeader, Packetizer};
    use crate::types::Codec;

    fn fragments(count: usize) -> Vec<Fragment> {
        let mut p = Packetizer::new(FragmentHeader::SIZE + 10).unwrap();
        let packet = EncodedPacket {
            frame_number: 1,
            keyframe: false,
            codec: Codec::Screen,
            data: Bytes::from(vec![0xAA; count * 10]),
            timestamp: Instant::now(),
        };
        p.packetize(&packet).unwrap()
    }

    #[test]
    fn answers_held_sequences_with_retransmit_flag() {
        let mut buf = RetransmitBuffer::new(16);
        for f in fragments(4) {
            buf.insert(f);
        }
        let resent = buf.answer(&[1, 3, 99]);
        assert_eq!(resent.len(), 2);
        assert_eq!(buf.misses(), 1);
        let (hdr, _) = FragmentHeader::decode(&resent[0]).unwrap();
        assert_eq!(hdr.sequence, 1);
        assert!(hdr.is_retransmit());
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let mut buf = RetransmitBuffer::new(3);
        for f in fragments(5) {
            buf.insert(f);
        }
        assert_eq!(buf.len(), 3);
        assert!(buf.answer(&[0, 1]).is_empty());
        assert_eq!(buf.answer(&[2, 3, 4]).len(), 3);
    }
}
