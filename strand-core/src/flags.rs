//! Per-fragment flag bits carried in byte 1 of the video fragment header.

use bitflags::bitflags;

bitflags! {
    /// Flags describing a single video fragment.
    ///
    /// Unknown bits are dropped on decode so newer senders stay readable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FragmentFlags: u8 {
        /// The fragment belongs to a keyframe (IDR) access unit.
        const KEYFRAME   = 0x01;
        /// The fragment is a NACK-triggered resend of an earlier datagram.
        const RETRANSMIT = 0x02;
    }
}
