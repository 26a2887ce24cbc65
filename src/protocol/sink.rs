//! Frame delivery and decode-loop control
//!
//! The decoder pushes each finished [`Frame`] into a [`FrameSink`]; an
//! append is a commit point, so consumers never observe out-of-order or
//! uncommitted frames. [`ChannelSink`] forwards frames over a crossbeam
//! channel with an explicit end-of-stream marker so a consumer thread can
//! distinguish "decode finished" from "sender dropped mid-stream".
//!
//! [`RunControl`] is the side channel the decode loop consults between
//! frames: a stop flag and an advisory progress report.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Sender;

use super::errors::{DecodeError, DecodeResult};
use super::frame::Frame;

/// Message carried by a [`ChannelSink`]'s channel.
#[derive(Debug, Clone)]
pub enum SinkMessage {
    Frame(Frame),
    /// No more frames will follow.
    EndOfStream,
}

/// An append-only, ordered frame consumer.
pub trait FrameSink {
    /// Commit one frame. Frames arrive in non-decreasing sample order.
    fn append(&mut self, frame: Frame) -> DecodeResult;
}

impl FrameSink for Vec<Frame> {
    fn append(&mut self, frame: Frame) -> DecodeResult {
        self.push(frame);
        Ok(())
    }
}

/// Frame sink that forwards over a crossbeam channel.
pub struct ChannelSink {
    tx: Sender<SinkMessage>,
}

impl ChannelSink {
    pub fn new(tx: Sender<SinkMessage>) -> Self {
        Self { tx }
    }

    /// Signal end-of-stream. Call when the decode session is over; receivers
    /// treat a disconnect without this marker as an aborted session.
    pub fn close(&self) {
        let _ = self.tx.send(SinkMessage::EndOfStream);
    }
}

impl FrameSink for ChannelSink {
    fn append(&mut self, frame: Frame) -> DecodeResult {
        self.tx
            .send(SinkMessage::Frame(frame))
            .map_err(|_| DecodeError::SinkClosed)
    }
}

/// Side channel consulted by the decode loop between frames.
///
/// Both hooks are advisory: neither affects what the decoder produces, only
/// whether and how long it keeps running.
pub trait RunControl {
    /// Checked between frames; `true` ends the session.
    fn should_stop(&self) -> bool {
        false
    }

    /// Called with the current sample position after each committed frame.
    fn progress(&self, _sample: u64) {}
}

/// Never stops, reports nothing.
impl RunControl for () {}

/// Shared stop flag for cancelling a decode loop from another thread.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the decode loop to stop at the next frame boundary.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl RunControl for StopFlag {
    fn should_stop(&self) -> bool {
        self.is_stopped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{FrameFlags, FrameKind};

    fn frame() -> Frame {
        Frame {
            kind: FrameKind::ReservedBit,
            flags: FrameFlags::empty(),
            start_sample: 1,
            end_sample: 2,
            value: 0,
            aux: 0,
        }
    }

    #[test]
    fn test_vec_sink_appends() {
        let mut sink: Vec<Frame> = Vec::new();
        FrameSink::append(&mut sink, frame()).unwrap();
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_channel_sink_round_trip() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut sink = ChannelSink::new(tx);

        sink.append(frame()).unwrap();
        sink.close();

        assert!(matches!(rx.recv().unwrap(), SinkMessage::Frame(_)));
        assert!(matches!(rx.recv().unwrap(), SinkMessage::EndOfStream));
    }

    #[test]
    fn test_channel_sink_reports_disconnect() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut sink = ChannelSink::new(tx);
        drop(rx);

        assert!(matches!(
            sink.append(frame()),
            Err(DecodeError::SinkClosed)
        ));
    }

    #[test]
    fn test_stop_flag() {
        let flag = StopFlag::new();
        assert!(!flag.should_stop());

        let handle = flag.clone();
        handle.stop();
        assert!(flag.should_stop());
    }
}
