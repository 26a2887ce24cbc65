//! Protocol model: frames, ring topology, decoder and synthesizer
//!
//! Both directions encode the same wire grammar. The decoder walks captured
//! edge streams phase by phase and emits frames; the synthesizer writes the
//! inverse transformation, producing waveforms a conformant decoder must
//! translate back into the original transactions.

pub mod decoder;
pub mod errors;
pub mod frame;
pub mod sink;
pub mod synth;
pub mod topology;

pub use decoder::{DecodePhase, ProtocolDecoder};
pub use errors::{BusLine, ConfigError, DecodeError, DecodeResult, SynthError};
pub use frame::{ControlOutcome, Frame, FrameFlags, FrameKind, NODE_VECTOR_SHIFT};
pub use sink::{ChannelSink, FrameSink, RunControl, SinkMessage, StopFlag};
pub use synth::{SynthConfig, Transaction, WaveformSynthesizer};
pub use topology::{Advance, BusTopology, INTERRUPT_TRANSITION_TOLERANCE, MAX_NODES, Node};
