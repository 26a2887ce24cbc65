//! Signal-level substrate: traces, cursors and waveform builders

pub mod cursor;
pub mod trace;

pub use cursor::{CaptureExhausted, SampleCursor};
pub use trace::{LineLevel, NodeCapture, Trace, TraceError, WaveformBuilder};
