//! Protocol decoder state machine
//!
//! Walks every node's CLK/DAT cursor in lock-step through the bus phases and
//! emits one [`Frame`] per phase result. The machine is an explicit phase
//! enum driven by [`ProtocolDecoder::next_frame`], so callers control
//! cancellation between phases without threads; [`ProtocolDecoder::run`]
//! wraps it in the usual sink-and-stop-flag loop.
//!
//! Anomalies (no winner, several winners, mid-byte interrupts) are recorded
//! as frame flags and decoding continues best-effort. Only two things end a
//! session: capture exhaustion and an explicit stop request.

use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use crate::capture::{CaptureExhausted, LineLevel};

use super::errors::{BusLine, DecodeError, DecodeResult};
use super::frame::{Frame, FrameFlags, FrameKind, NODE_VECTOR_SHIFT};
use super::sink::{FrameSink, RunControl};
use super::topology::{Advance, BusTopology};

/// The decoder's position in the fixed phase cycle. Idle is implicit
/// between `Control` and the next `Request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePhase {
    Request,
    Arbitration,
    PriorityArbitration,
    ReservedBit,
    Address,
    Data,
    Control,
}

/// Internal control flow for one phase step. An interrupt pulse train
/// unwinds the current phase and jumps the machine to the control epilogue,
/// mirroring the bus freezing mid-transaction.
enum StepError {
    Interrupted,
    End(CaptureExhausted),
}

impl From<CaptureExhausted> for StepError {
    fn from(e: CaptureExhausted) -> Self {
        StepError::End(e)
    }
}

type StepResult<T = ()> = Result<T, StepError>;

pub struct ProtocolDecoder {
    bus: BusTopology,
    phase: DecodePhase,
    /// Winner of the current transaction's arbitration, refined by the
    /// priority pass.
    transmitter: Option<usize>,
    first_request_done: bool,
    pending: VecDeque<Frame>,
    done: bool,
}

impl ProtocolDecoder {
    /// Create a decoder over a bus whose lines are all idle HIGH at the
    /// cursors' current position.
    ///
    /// Captures that begin mid-transaction are rejected: the phase machine
    /// has no way to resynchronize from an arbitrary point in a transfer.
    pub fn new(bus: BusTopology) -> DecodeResult<Self> {
        for i in 0..bus.node_count() {
            let node = bus.node(i);
            if !node.clk().level().is_high() {
                return Err(DecodeError::MidTransactionCapture {
                    node: i,
                    line: BusLine::Clk,
                });
            }
            if !node.dat().level().is_high() {
                return Err(DecodeError::MidTransactionCapture {
                    node: i,
                    line: BusLine::Dat,
                });
            }
        }
        Ok(Self {
            bus,
            phase: DecodePhase::Request,
            transmitter: None,
            first_request_done: false,
            pending: VecDeque::new(),
            done: false,
        })
    }

    /// Current phase, for observability.
    pub fn phase(&self) -> DecodePhase {
        self.phase
    }

    /// Transmitter of the transaction currently being decoded, if resolved.
    pub fn transmitter(&self) -> Option<usize> {
        self.transmitter
    }

    /// Produce the next frame, stepping phases as needed. `None` once the
    /// capture is exhausted.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(frame);
            }
            if self.done {
                return None;
            }
            self.step();
        }
    }

    /// Decode until the capture is exhausted or `ctl` requests a stop,
    /// committing each frame to `sink` before moving on.
    pub fn run<S: FrameSink, C: RunControl>(&mut self, sink: &mut S, ctl: &C) -> DecodeResult {
        while !ctl.should_stop() {
            match self.next_frame() {
                Some(frame) => {
                    let position = frame.end_sample;
                    sink.append(frame)?;
                    ctl.progress(position);
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Execute the current phase. Frames it produced are queued on
    /// `pending`; interrupts and capture exhaustion redirect the cycle.
    fn step(&mut self) {
        let outcome = match self.phase {
            DecodePhase::Request => self.phase_request(),
            DecodePhase::Arbitration => self.phase_arbitration(),
            DecodePhase::PriorityArbitration => self.phase_priority_arbitration(),
            DecodePhase::ReservedBit => self.phase_reserved_bit(),
            DecodePhase::Address => self.phase_address(),
            DecodePhase::Data => self.phase_data(),
            DecodePhase::Control => self.phase_control(),
        };
        match outcome {
            Ok(()) => {}
            Err(StepError::Interrupted) => {
                if self.phase == DecodePhase::Control {
                    // Interrupted inside the epilogue itself: nothing left
                    // to salvage, start over at the next request window.
                    warn!("interrupt pulse train inside the control epilogue; abandoning transaction");
                    self.phase = DecodePhase::Request;
                } else {
                    debug!(
                        "interrupt pulse train during {:?}; skipping to control epilogue",
                        self.phase
                    );
                    self.phase = DecodePhase::Control;
                }
            }
            Err(StepError::End(e)) => {
                debug!("capture exhausted at sample {}; decode complete", e.0);
                self.done = true;
            }
        }
    }

    fn emit(&mut self, frame: Frame) {
        trace!("emit {}", frame);
        self.pending.push_back(frame);
    }

    /// Barrier advance that converts an interrupt window into phase unwind.
    fn barrier(&mut self, sample: u64) -> StepResult {
        match self.bus.advance_all_to(sample)? {
            Advance::Clean => Ok(()),
            Advance::Interrupted => Err(StepError::Interrupted),
        }
    }

    /// Advance the tap CLK one edge and bring the whole bus to it.
    fn clk_edge(&mut self) -> StepResult<u64> {
        let edge = self.bus.last_clk_mut().advance_to_next_edge()?;
        self.barrier(edge)?;
        Ok(edge)
    }

    /// Latch one bit: advance to the latch edge, read the tap DAT level,
    /// then advance through the following drive edge.
    fn latch_bit(&mut self) -> StepResult<bool> {
        self.clk_edge()?;
        let bit = self.bus.last_dat().level().is_high();
        self.clk_edge()?;
        Ok(bit)
    }

    /// Idle → Request. The tap CLK's next edge marks the end of the idle
    /// hold ("t_long"); every DAT line that fell inside that window was
    /// participating. The master requested if its line ever fell; a member
    /// requested only if its fall precedes its ring predecessor's — a fall
    /// that isn't earlier is just the predecessor's request being forwarded.
    fn phase_request(&mut self) -> StepResult {
        let start = self.bus.last_clk().sample() + 1;
        let t_long_end = self.bus.last_clk_mut().advance_to_next_edge()?;

        let count = self.bus.node_count();
        let mut fall = vec![0u64; count];
        let mut requested = vec![false; count];
        for i in 0..count {
            let dat = self.bus.dat_cursor_mut(i);
            // DAT lines might not fall until data transmission, so blindly
            // advancing to the next edge is unsafe; peek to the end of
            // t_long to see whether this node is participating.
            let window = t_long_end - dat.sample();
            if dat.would_transition_within(window) {
                fall[i] = dat.advance_to_next_edge()?;
                if i == 0 {
                    requested[0] = true;
                }
            } else {
                // Fake fall time past every participant
                fall[i] = t_long_end + 1;
            }
        }
        for i in 1..count {
            if fall[i] < fall[i - 1] {
                requested[i] = true;
            }
        }

        self.barrier(t_long_end)?;

        let mut value = 0u64;
        for (i, &r) in requested.iter().enumerate() {
            value |= (r as u64) << (NODE_VECTOR_SHIFT as usize + i);
        }
        let mut flags = FrameFlags::empty();
        if self.first_request_done {
            flags |= FrameFlags::REQUEST_BUG_WORKAROUND;
        } else {
            self.first_request_done = true;
        }

        self.emit(Frame {
            kind: FrameKind::Request,
            flags,
            start_sample: start,
            end_sample: self.bus.last_clk().sample(),
            value,
            aux: 1,
        });
        self.phase = DecodePhase::Arbitration;
        Ok(())
    }

    /// Request → Arbitration. After the latch edge the winner is the master
    /// if its line is LOW, else the unique member whose line is LOW while
    /// its predecessor's is HIGH (a genuine new assertion rather than
    /// forwarded signal). Multiplicity and absence are flagged, not fatal.
    fn phase_arbitration(&mut self) -> StepResult {
        let start = self.bus.last_clk().sample() + 1;
        self.clk_edge()?;

        let count = self.bus.node_count();
        let mut flags = FrameFlags::empty();
        let mut winner: Option<usize> = None;
        if self.bus.dat_level(0) == LineLevel::Low {
            winner = Some(0);
        } else {
            for i in 1..count {
                if self.bus.dat_level(self.bus.predecessor(i)).is_high()
                    && self.bus.dat_level(i) == LineLevel::Low
                {
                    if winner.is_some() {
                        flags |= FrameFlags::MULTIPLE_ARBITRATION_WINNERS;
                    }
                    winner = Some(i);
                }
            }
        }
        if winner.is_none() {
            flags |= FrameFlags::NO_ARBITRATION_WINNER;
        }
        self.transmitter = winner;
        debug!("arbitration winner: {:?}", winner);

        let mut value = 0u64;
        if let Some(w) = winner {
            value |= 1u64 << (NODE_VECTOR_SHIFT as usize + w);
        }

        // Extend the frame through the priority drive edge
        self.clk_edge()?;

        self.emit(Frame {
            kind: FrameKind::Arbitration,
            flags,
            start_sample: start,
            end_sample: self.bus.last_clk().sample(),
            value,
            aux: 1,
        });
        self.phase = DecodePhase::PriorityArbitration;
        Ok(())
    }

    /// Arbitration → PriorityArbitration. The transmitter keeps the bus if
    /// its line is still LOW; otherwise the ring is scanned starting just
    /// after it for a HIGH-going assertion (predecessor LOW, self HIGH). A
    /// distinct priority winner replaces the transmitter.
    fn phase_priority_arbitration(&mut self) -> StepResult {
        let start = self.bus.last_clk().sample() + 1;
        self.clk_edge()?;

        let mut flags = FrameFlags::empty();
        let mut value = 0u64;
        let mut aux = 0u64;
        match self.transmitter {
            None => {
                // No arbitration winner means nothing to refine
                flags |= FrameFlags::NO_ARBITRATION_WINNER;
            }
            Some(t) => {
                let count = self.bus.node_count();
                let mut winner: Option<usize> = None;
                if self.bus.dat_level(t) == LineLevel::Low {
                    winner = Some(t);
                } else {
                    for off in 1..count {
                        let k = (t + off) % count;
                        if self.bus.dat_level(self.bus.predecessor(k)) == LineLevel::Low
                            && self.bus.dat_level(k).is_high()
                        {
                            if winner.is_some() {
                                flags |= FrameFlags::MULTIPLE_ARBITRATION_WINNERS;
                            }
                            winner = Some(k);
                        }
                    }
                }
                if let Some(w) = winner {
                    self.transmitter = Some(w);
                    value |= 1u64 << (NODE_VECTOR_SHIFT as usize + w);
                }
                debug!("priority winner: {:?}, transmitter: {:?}", winner, self.transmitter);
                aux = 1;
            }
        }

        // Extend the frame through the first bit's drive edge
        self.clk_edge()?;

        self.emit(Frame {
            kind: FrameKind::PriorityArbitration,
            flags,
            start_sample: start,
            end_sample: self.bus.last_clk().sample(),
            value,
            aux,
        });
        self.phase = DecodePhase::ReservedBit;
        Ok(())
    }

    /// PriorityArbitration → ReservedBit. One bit time consumed without
    /// interpretation. If the next CLK edge would land after the next DAT
    /// edge, an interrupt is being asserted inside the reserved slot: stop
    /// just short of the DAT edge instead of running past it.
    fn phase_reserved_bit(&mut self) -> StepResult {
        let start = self.bus.last_clk().sample() + 1;
        self.clk_edge()?;

        let clk_next = self.bus.last_clk().next_edge_sample();
        let dat_next = self.bus.last_dat().next_edge_sample();
        match (clk_next, dat_next) {
            (Some(c), Some(d)) if c > d => {
                debug!("interrupt asserted inside the reserved slot (DAT edge at {})", d);
                self.barrier(d - 1)?;
            }
            _ => {
                self.clk_edge()?;
            }
        }

        self.emit(Frame {
            kind: FrameKind::ReservedBit,
            flags: FrameFlags::empty(),
            start_sample: start,
            end_sample: self.bus.last_clk().sample(),
            value: 0,
            aux: 0,
        });
        self.phase = DecodePhase::Address;
        Ok(())
    }

    /// ReservedBit → Address. Eight bits MSB-first off the tap DAT line; a
    /// 0xF top nibble extends the address by 24 further bits. This nibble
    /// is the sole width rule.
    fn phase_address(&mut self) -> StepResult {
        let start = self.bus.last_clk().sample() + 1;

        let mut address = 0u32;
        for _ in 0..8 {
            address = (address << 1) | self.latch_bit()? as u32;
        }
        if address & 0xF0 == 0xF0 {
            for _ in 0..24 {
                address = (address << 1) | self.latch_bit()? as u32;
            }
        }
        debug!("address 0x{:x}", address);

        self.emit(Frame {
            kind: FrameKind::Address,
            flags: FrameFlags::empty(),
            start_sample: start,
            end_sample: self.bus.last_clk().sample(),
            value: address as u64,
            aux: 0,
        });
        self.phase = DecodePhase::Data;
        Ok(())
    }

    /// Address → Data. Bytes MSB-first, one Data frame each, until an
    /// interrupt pulse train lands inside a byte. A byte whose eight bits
    /// all latched before the interrupt is still emitted; the span from the
    /// last fully-latched sample to the interrupt's settling point becomes
    /// one synthetic Interrupt frame. No further bytes are attempted.
    fn phase_data(&mut self) -> StepResult {
        loop {
            let start = self.bus.last_clk().sample() + 1;
            let mut byte = 0u8;
            let mut bits = 0u8;
            let mut last_latch: Option<u64> = None;
            let mut interrupted = false;

            for _ in 0..8 {
                // Latch edge
                let edge = self.bus.last_clk_mut().advance_to_next_edge()?;
                if self.bus.advance_all_to(edge)? == Advance::Interrupted {
                    interrupted = true;
                    break;
                }
                byte = (byte << 1) | self.bus.last_dat().level().is_high() as u8;
                bits += 1;
                last_latch = Some(self.bus.last_clk().sample());

                // Advance to the next drive edge; if we're watching a node
                // downstream of the interrupter the pulse train triggers
                // here rather than at the latch.
                let edge = self.bus.last_clk_mut().advance_to_next_edge()?;
                if self.bus.advance_all_to(edge)? == Advance::Interrupted {
                    interrupted = true;
                    break;
                }
            }

            let end = self.bus.last_clk().sample();
            if interrupted {
                if let (8, Some(latch)) = (bits, last_latch) {
                    // The byte completed just before the interrupt hit
                    self.emit(Frame {
                        kind: FrameKind::Data,
                        flags: FrameFlags::empty(),
                        start_sample: start,
                        end_sample: latch,
                        value: byte as u64,
                        aux: 0,
                    });
                    self.emit(Frame {
                        kind: FrameKind::Interrupt,
                        flags: FrameFlags::empty(),
                        start_sample: latch + 1,
                        end_sample: end,
                        value: 0,
                        aux: 0,
                    });
                } else {
                    debug!("interrupt truncated a byte after {} bits", bits);
                    let int_start = last_latch.map_or(start, |s| s + 1);
                    self.emit(Frame {
                        kind: FrameKind::Interrupt,
                        flags: FrameFlags::empty(),
                        start_sample: int_start,
                        end_sample: end,
                        value: 0,
                        aux: 0,
                    });
                }
                break;
            }

            trace!("data byte 0x{:02x}", byte);
            self.emit(Frame {
                kind: FrameKind::Data,
                flags: FrameFlags::empty(),
                start_sample: start,
                end_sample: end,
                value: byte as u64,
                aux: 0,
            });
        }
        self.phase = DecodePhase::Control;
        Ok(())
    }

    /// Interrupt → Control → Idle. Two silently consumed edges reach the
    /// CB0 latch; each control bit frame latches one bit and extends
    /// through the following drive edge; one final edge is consumed to
    /// reach the idle boundary before the cycle restarts.
    fn phase_control(&mut self) -> StepResult {
        // Latch begin-control, then drive CB0
        self.clk_edge()?;
        self.clk_edge()?;

        for kind in [FrameKind::ControlBit0, FrameKind::ControlBit1] {
            let start = self.bus.last_clk().sample() + 1;
            self.clk_edge()?;
            let bit = self.bus.last_dat().level().is_high();
            self.clk_edge()?;
            self.emit(Frame {
                kind,
                flags: FrameFlags::empty(),
                start_sample: start,
                end_sample: self.bus.last_clk().sample(),
                value: bit as u64,
                aux: 0,
            });
        }

        // Latch begin-idle, silently consumed
        self.clk_edge()?;

        self.transmitter = None;
        self.phase = DecodePhase::Request;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{NodeCapture, Trace};
    use crate::protocol::errors::ConfigError;

    fn trace(transitions: Vec<u64>) -> Trace {
        Trace::new(LineLevel::High, transitions, 2000).unwrap()
    }

    fn low_trace(transitions: Vec<u64>) -> Trace {
        Trace::new(LineLevel::Low, transitions, 2000).unwrap()
    }

    fn decode_all(captures: Vec<NodeCapture>) -> Vec<Frame> {
        let bus = BusTopology::new(captures).unwrap();
        let mut decoder = ProtocolDecoder::new(bus).unwrap();
        let mut frames = Vec::new();
        decoder.run(&mut frames, &()).unwrap();
        frames
    }

    #[test]
    fn test_idle_capture_produces_no_frames() {
        let frames = decode_all(vec![NodeCapture::idle(5000), NodeCapture::idle(5000)]);
        assert!(frames.is_empty());
    }

    #[test]
    fn test_mid_transaction_capture_rejected() {
        let bus = BusTopology::new(vec![
            NodeCapture::new(trace(vec![]), low_trace(vec![])),
        ])
        .unwrap();
        assert!(matches!(
            ProtocolDecoder::new(bus),
            Err(DecodeError::MidTransactionCapture {
                node: 0,
                line: BusLine::Dat
            })
        ));
    }

    #[test]
    fn test_empty_topology_rejected() {
        assert!(matches!(
            BusTopology::new(Vec::new()),
            Err(ConfigError::EmptyTopology)
        ));
    }

    /// Two non-adjacent members assert while the one between them stays
    /// HIGH (broken forwarding): both look like genuine new assertions, so
    /// the multiplicity is recorded and the last match wins.
    #[test]
    fn test_multiple_arbitration_winners_flagged() {
        let clk = || trace(vec![200, 300, 400]);
        let captures = vec![
            NodeCapture::new(clk(), trace(vec![])),
            NodeCapture::new(clk(), trace(vec![100])),
            NodeCapture::new(clk(), trace(vec![])),
            NodeCapture::new(clk(), trace(vec![110])),
        ];
        let frames = decode_all(captures);
        assert_eq!(frames.len(), 2);

        let request = &frames[0];
        assert_eq!(request.kind, FrameKind::Request);
        assert!(request.node_asserted(1));
        assert!(request.node_asserted(3));
        assert!(!request.node_asserted(0));
        assert!(!request.node_asserted(2));

        let arb = &frames[1];
        assert_eq!(arb.kind, FrameKind::Arbitration);
        assert!(arb.flags.contains(FrameFlags::MULTIPLE_ARBITRATION_WINNERS));
        assert!(arb.node_asserted(3));
    }

    /// Nobody requests but the clock runs: the no-winner flag propagates
    /// from arbitration into the priority frame instead of aborting.
    #[test]
    fn test_no_arbitration_winner_flagged() {
        let clk = || trace(vec![200, 300, 400, 500, 600]);
        let captures = vec![
            NodeCapture::new(clk(), trace(vec![])),
            NodeCapture::new(clk(), trace(vec![])),
        ];
        let frames = decode_all(captures);
        assert_eq!(frames.len(), 3);

        let arb = &frames[1];
        assert_eq!(arb.kind, FrameKind::Arbitration);
        assert!(arb.flags.contains(FrameFlags::NO_ARBITRATION_WINNER));
        assert_eq!(arb.winner(), None);

        let prio = &frames[2];
        assert_eq!(prio.kind, FrameKind::PriorityArbitration);
        assert!(prio.flags.contains(FrameFlags::NO_ARBITRATION_WINNER));
        assert_eq!(prio.aux, 0);
    }

    /// The arbitration winner releases the bus before the priority latch
    /// while another node raises its line against a LOW predecessor: the
    /// priority winner replaces the transmitter.
    #[test]
    fn test_priority_winner_replaces_transmitter() {
        let clk = || trace(vec![200, 300, 400, 500, 600]);
        let captures = vec![
            NodeCapture::new(clk(), trace(vec![])),
            // Requests at 100, cedes at 450 (before the priority latch)
            NodeCapture::new(clk(), trace(vec![100, 450])),
            // Falls at 460: the LOW predecessor for node 3's assertion
            NodeCapture::new(clk(), trace(vec![460])),
            NodeCapture::new(clk(), trace(vec![])),
        ];
        let bus = BusTopology::new(captures).unwrap();
        let mut decoder = ProtocolDecoder::new(bus).unwrap();
        let mut frames = Vec::new();
        decoder.run(&mut frames, &()).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].kind, FrameKind::Arbitration);
        assert!(frames[1].node_asserted(1));

        let prio = &frames[2];
        assert_eq!(prio.kind, FrameKind::PriorityArbitration);
        assert!(prio.flags.is_empty());
        assert!(prio.node_asserted(3));
        assert_eq!(decoder.transmitter(), Some(3));
    }

    /// A DAT pulse train arriving before the next CLK edge inside the
    /// reserved slot stops the phase just short of the first DAT edge.
    #[test]
    fn test_reserved_slot_interrupt_detection() {
        let clk = || trace(vec![200, 300, 400, 500, 600, 650, 800]);
        let pulse_train = vec![700, 705, 710, 715, 720, 725, 730];
        let captures = vec![
            NodeCapture::new(clk(), trace(vec![])),
            NodeCapture::new(clk(), trace(vec![100])),
            NodeCapture::new(clk(), trace(pulse_train)),
        ];
        let frames = decode_all(captures);

        // Request, Arbitration, PriorityArbitration, ReservedBit; the
        // address phase then runs into the pulse train and the capture ends
        // inside the epilogue.
        assert_eq!(frames.len(), 4);
        let reserved = &frames[3];
        assert_eq!(reserved.kind, FrameKind::ReservedBit);
        // The phase stops one sample short of the first pulse edge at 700
        assert_eq!(reserved.end_sample, 699);
        assert!(frames.iter().all(|f| f.kind != FrameKind::Address));
    }

    #[test]
    fn test_stop_flag_halts_between_frames() {
        use crate::protocol::sink::StopFlag;

        let clk = || trace(vec![200, 300, 400, 500, 600]);
        let captures = vec![
            NodeCapture::new(clk(), trace(vec![])),
            NodeCapture::new(clk(), trace(vec![100])),
        ];
        let bus = BusTopology::new(captures).unwrap();
        let mut decoder = ProtocolDecoder::new(bus).unwrap();

        let flag = StopFlag::new();
        flag.stop();
        let mut frames = Vec::new();
        decoder.run(&mut frames, &flag).unwrap();
        assert!(frames.is_empty());

        // The session is still resumable once the flag would be cleared;
        // next_frame picks up where run() left off.
        assert!(decoder.next_frame().is_some());
    }
}
