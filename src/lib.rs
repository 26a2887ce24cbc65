//! MBus waveform decoder and synthesizer
//!
//! This library decodes a multi-drop, clock-synchronous, wired-AND-arbitrated
//! serial bus — a master and an ordered ring of member nodes, each tapped
//! with one CLK and one DAT channel — from captured digital waveforms, and
//! synthesizes valid waveforms for the same protocol from a transaction
//! description.
//!
//! # Architecture
//!
//! - **capture**: run-length encoded [`Trace`]s, forward-only
//!   [`SampleCursor`]s and the [`WaveformBuilder`] used during synthesis
//! - **protocol**: the [`BusTopology`] ring, the [`ProtocolDecoder`] phase
//!   machine producing [`Frame`]s, and the [`WaveformSynthesizer`] driving
//!   the inverse transformation
//!
//! The two directions share the wire grammar, so they round-trip: decoding a
//! synthesized capture reproduces the transaction list.
//!
//! # Example
//!
//! ```
//! use mbus::{BusTopology, ProtocolDecoder, Transaction, WaveformSynthesizer};
//!
//! // One member-initiated transfer on a two-node bus
//! let txn = Transaction::new(1, 0xA5, vec![0x3C], true);
//! let captures = WaveformSynthesizer::new(2)?.synthesize(&[txn], 0)?;
//!
//! let mut decoder = ProtocolDecoder::new(BusTopology::new(captures)?)?;
//! let mut frames = Vec::new();
//! decoder.run(&mut frames, &())?;
//! assert!(!frames.is_empty());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod capture;
pub mod protocol;

pub use capture::{
    CaptureExhausted, LineLevel, NodeCapture, SampleCursor, Trace, TraceError, WaveformBuilder,
};
pub use protocol::{
    Advance, BusLine, BusTopology, ChannelSink, ConfigError, ControlOutcome, DecodeError,
    DecodePhase, DecodeResult, Frame, FrameFlags, FrameKind, FrameSink, Node, ProtocolDecoder,
    RunControl, SinkMessage, StopFlag, SynthConfig, SynthError, Transaction, WaveformSynthesizer,
    INTERRUPT_TRANSITION_TOLERANCE, MAX_NODES, NODE_VECTOR_SHIFT,
};
