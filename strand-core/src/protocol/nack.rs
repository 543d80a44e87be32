//! NACK wire codec: `{0xFD, count:u8, seq:u16 × count}`.

use crate::error::StreamError;
use crate::protocol::PacketType;

/// Maximum sequences in one NACK datagram (the count is a single byte).
pub const MAX_NACK_ENTRIES: usize = u8::MAX as usize;

/// Encode `sequences` into as many NACK datagrams as needed, each holding
/// at most [`MAX_NACK_ENTRIES`] entries. Order is preserved.
pub fn encode_nack_packets(sequences: &[u16]) -> Vec<Vec<u8>> {
    sequences
        .chunks(MAX_NACK_ENTRIES)
        .map(|chunk| {
            let mut buf = Vec::with_capacity(2 + chunk.len() * 2);
            buf.push(PacketType::Nack as u8);
            buf.push(chunk.len() as u8);
            for seq in chunk {
                buf.extend_from_slice(&seq.to_be_bytes());
            }
            buf
        })
        .collect()
}

/// Parse a NACK datagram into the sequences it names.
pub fn decode_nack(data: &[u8]) -> Result<Vec<u16>, StreamError> {
    if data.len() < 2 {
        return Err(StreamError::PacketTooShort {
            expected: 2,
            actual: data.len(),
        });
    }
    if data[0] != PacketType::Nack as u8 {
        return Err(StreamError::InvalidHeader("not a NACK packet"));
    }
    let count = data[1] as usize;
    let expected = 2 + count * 2;
    if data.len() < expected {
        return Err(StreamError::PacketTooShort {
            expected,
            actual: data.len(),
        });
    }
    Ok(data[2..expected]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_packet_layout() {
        let packets = encode_nack_packets(&[3, 0x0102]);
        assert_eq!(packets, vec![vec![0xFD, 2, 0, 3, 1, 2]]);
        assert_eq!(decode_nack(&packets[0]).unwrap(), vec![3, 0x0102]);
    }

    #[test]
    fn splits_at_255_entries() {
        let seqs: Vec<u16> = (0..600).collect();
        let packets = encode_nack_packets(&seqs);
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0][1], 255);
        assert_eq!(packets[1][1], 255);
        assert_eq!(packets[2][1], 90);

        let decoded: Vec<u16> = packets.iter().flat_map(|p| decode_nack(p).unwrap()).collect();
        assert_eq!(decoded, seqs);
    }

    #[test]
    fn empty_input_produces_nothing() {
        assert!(encode_nack_packets(&[]).is_empty());
    }

    #[test]
    fn truncated_packet_rejected() {
        assert!(decode_nack(&[0xFD]).is_err());
        assert!(matches!(
            decode_nack(&[0xFD, 3, 0, 1, 0, 2]),
            Err(StreamError::PacketTooShort { expected: 8, actual: 6 })
        ));
        assert!(decode_nack(&[0xFE, 0]).is_err());
    }
}
