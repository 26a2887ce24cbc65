//! Decoded frame model
//!
//! A [`Frame`] is the unit of decoder output: one protocol phase result with
//! an inclusive sample range, a packed value and a set of anomaly flags.
//! Frames are immutable once emitted and arrive in non-decreasing,
//! non-overlapping sample order.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Bit position where the per-node boolean vector starts inside
/// [`Frame::value`].
pub const NODE_VECTOR_SHIFT: u32 = 32;

/// The protocol phase a frame was produced by (closed enumeration).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Arbitration,
    PriorityArbitration,
    ReservedBit,
    Address,
    Data,
    Interrupt,
    ControlBit0,
    ControlBit1,
}

/// Anomaly markers attached to a frame. Independent bits; any combination
/// may be set. None of them abort decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// More than one node matched the arbitration (or priority) winner rule.
    pub const MULTIPLE_ARBITRATION_WINNERS: FrameFlags = FrameFlags(1 << 0);
    /// No node matched the winner rule; the transaction has no transmitter.
    pub const NO_ARBITRATION_WINNER: FrameFlags = FrameFlags(1 << 1);
    /// Set on every Request frame after the first. The first request of a
    /// session is measured from the capture start rather than a preceding
    /// idle latch, so its span is slightly off; consumers can use this flag
    /// to discount it. Not a bus condition.
    pub const REQUEST_BUG_WORKAROUND: FrameFlags = FrameFlags(1 << 2);

    pub fn empty() -> Self {
        FrameFlags(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: FrameFlags) {
        self.0 |= other.0;
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for FrameFlags {
    fn bitor_assign(&mut self, rhs: FrameFlags) {
        self.0 |= rhs.0;
    }
}

/// One decoded protocol phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub flags: FrameFlags,
    /// Inclusive sample range covered by this frame.
    pub start_sample: u64,
    pub end_sample: u64,
    /// Low 32 bits: scalar payload (address, data byte, control bit).
    /// Bits `NODE_VECTOR_SHIFT + i`: per-node boolean vector (node i
    /// requested / won), master at i = 0.
    pub value: u64,
    /// Phase-specific sentinel; 1 when the per-node vector is populated.
    pub aux: u64,
}

impl Frame {
    /// Scalar payload from the low half of `value`.
    pub fn scalar(&self) -> u32 {
        self.value as u32
    }

    /// Whether node `i`'s bit is set in the per-node vector.
    pub fn node_asserted(&self, i: usize) -> bool {
        (self.value >> (NODE_VECTOR_SHIFT as usize + i)) & 1 == 1
    }

    /// The raw per-node vector.
    pub fn node_vector(&self) -> u32 {
        (self.value >> NODE_VECTOR_SHIFT) as u32
    }

    /// Lowest-index node set in the per-node vector, if any. For
    /// arbitration frames this is the winner.
    pub fn winner(&self) -> Option<usize> {
        let v = self.node_vector();
        if v == 0 {
            None
        } else {
            Some(v.trailing_zeros() as usize)
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:?}[{}..{}] value=0x{:x}",
            self.kind, self.start_sample, self.end_sample, self.value
        )?;
        if !self.flags.is_empty() {
            write!(f, " flags=0x{:02x}", self.flags.bits())?;
        }
        Ok(())
    }
}

/// Combined meaning of the two control epilogue bits.
///
/// Control Bit 0 distinguishes End-of-Message (HIGH) from General Error
/// (LOW); Control Bit 1's meaning depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// End of message, receiver acknowledged.
    EndOfMessageAck,
    /// End of message, receiver did not acknowledge.
    EndOfMessageNak,
    /// General error raised by the TX or RX node.
    GeneralErrorNode,
    /// General error: the transaction was interrupted.
    GeneralErrorInterrupted,
}

impl ControlOutcome {
    /// Interpret the two latched control bits.
    pub fn interpret(cb0: bool, cb1: bool) -> Self {
        match (cb0, cb1) {
            (true, false) => ControlOutcome::EndOfMessageAck,
            (true, true) => ControlOutcome::EndOfMessageNak,
            (false, true) => ControlOutcome::GeneralErrorNode,
            (false, false) => ControlOutcome::GeneralErrorInterrupted,
        }
    }
}
