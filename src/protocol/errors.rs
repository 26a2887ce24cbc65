//! Error types for decoding and synthesis
//!
//! Two tiers, deliberately kept apart: protocol-level anomalies (ambiguous
//! arbitration, mid-byte interrupts) are recorded as frame flags and never
//! surface here; these types cover precondition violations, configuration
//! mistakes and synthesis bugs, which must fail loudly.

use std::fmt;

use thiserror::Error;

use crate::capture::CaptureExhausted;

/// Which of a node's two channels an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusLine {
    Clk,
    Dat,
}

impl fmt::Display for BusLine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BusLine::Clk => write!(f, "CLK"),
            BusLine::Dat => write!(f, "DAT"),
        }
    }
}

/// Error type for session configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("bus topology requires at least one node")]
    EmptyTopology,

    #[error("ring size {0} exceeds the 16-node MBus design limit")]
    TooManyNodes(usize),
}

/// Error type for decode sessions
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The capture ran out; not an error for the caller so much as the end
    /// of the frame stream, surfaced here for the paths that need it typed.
    #[error("capture exhausted: {0}")]
    EndOfCapture(#[from] CaptureExhausted),

    /// A line was LOW at the cursors' starting position. Decoding must begin
    /// on an idle bus; captures that start mid-transaction are unsupported.
    #[error("unsupported capture: node {node} {line} is low at the session start (mid-transaction capture)")]
    MidTransactionCapture { node: usize, line: BusLine },

    #[error("frame sink disconnected")]
    SinkClosed,
}

/// Result type for decode operations
pub type DecodeResult<T = ()> = Result<T, DecodeError>;

/// Error type for waveform synthesis
///
/// Every variant is a synthesis bug or bad request, not a bus condition:
/// the generator owns every line it writes, so an unexpected level is a
/// programming error and is reported as such.
#[derive(Debug, Error)]
pub enum SynthError {
    #[error("bus lines must be idle high {stage}: node {node} {line} is low")]
    LinesNotIdle {
        stage: &'static str,
        node: usize,
        line: BusLine,
    },

    #[error("sender index {0} out of range for {1} nodes")]
    InvalidSender(usize, usize),

    #[error("priority index {0} out of range for {1} nodes")]
    InvalidPriority(usize, usize),

    #[error("address {0:#010x} fits neither the 8-bit nor the 0xF-prefixed 32-bit form")]
    UnencodableAddress(u32),

    #[error("synthesized waveform resolved no arbitration winner")]
    NoWinner,

    #[error("synthesized waveform resolved multiple arbitration winners")]
    MultipleWinners,
}
