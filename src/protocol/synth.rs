//! Waveform synthesizer
//!
//! Generates per-node CLK/DAT waveforms for an ordered list of transactions,
//! the inverse of the decoder: a conformant decoder must translate the
//! output back into the same transactions. The generator shares the ring
//! model with the decoder — members forward a LOW seen on their predecessor,
//! the master never forwards, and the arbitration winner holds the line
//! through the priority pass.
//!
//! Timing is a single playhead over all channels: every assertion and every
//! ring hop advances it by a small seeded-random propagation delay, modeling
//! wired-AND settling, and each bit slot spans a configurable half-period.

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use tracing::debug;

use crate::capture::{LineLevel, NodeCapture, WaveformBuilder};

use super::errors::{BusLine, ConfigError, SynthError};
use super::topology::MAX_NODES;

/// Idle hold before the first clock edge, in half-periods ("t_long").
const T_LONG_HALF_PERIODS: u64 = 5;
/// Idle space written before each transaction.
const LEAD_IN_HALF_PERIODS: u64 = 10;
/// Idle space written after each transaction.
const LEAD_OUT_HALF_PERIODS: u64 = 20;
/// Pulses in the interrupt train that ends every data run.
const INTERRUPT_PULSES: usize = 3;

/// One bus transfer to synthesize.
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Requesting node (ring index; 0 = master).
    pub sender: usize,
    /// 8-bit address, or 32-bit when the top nibble is 0xF.
    pub address: u32,
    pub payload: Vec<u8>,
    /// Whether the receiver acknowledges (CB1 driven LOW).
    pub acked: bool,
    /// Optional wake-up requester asserting during the priority pass.
    pub priority: Option<usize>,
    /// Cut the payload bit stream short after this many bits and jump
    /// straight to the interrupt sequence, producing a mid-byte interrupt
    /// capture.
    pub truncate_after_data_bits: Option<usize>,
}

impl Transaction {
    pub fn new(sender: usize, address: u32, payload: Vec<u8>, acked: bool) -> Self {
        Self {
            sender,
            address,
            payload,
            acked,
            priority: None,
            truncate_after_data_bits: None,
        }
    }

    pub fn with_priority(mut self, node: usize) -> Self {
        self.priority = Some(node);
        self
    }

    pub fn with_data_truncated_after(mut self, bits: usize) -> Self {
        self.truncate_after_data_bits = Some(bits);
        self
    }
}

/// Timing knobs for the generator.
#[derive(Debug, Clone, Copy)]
pub struct SynthConfig {
    /// Samples per clock half-period.
    pub half_period: u64,
    /// Seed for the propagation-delay jitter; same seed, same waveform.
    pub seed: u64,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            half_period: 20,
            seed: 0x6D62_7573_0002,
        }
    }
}

pub struct WaveformSynthesizer {
    clk: Vec<WaveformBuilder>,
    dat: Vec<WaveformBuilder>,
    /// Shared playhead across every channel.
    now: u64,
    half_period: u64,
    rng: Xoshiro256StarStar,
}

impl WaveformSynthesizer {
    pub fn new(node_count: usize) -> Result<Self, ConfigError> {
        Self::with_config(node_count, SynthConfig::default())
    }

    pub fn with_config(node_count: usize, config: SynthConfig) -> Result<Self, ConfigError> {
        if node_count == 0 {
            return Err(ConfigError::EmptyTopology);
        }
        if node_count > MAX_NODES {
            return Err(ConfigError::TooManyNodes(node_count));
        }
        Ok(Self {
            clk: (0..node_count).map(|_| WaveformBuilder::new()).collect(),
            dat: (0..node_count).map(|_| WaveformBuilder::new()).collect(),
            now: 0,
            half_period: config.half_period,
            rng: Xoshiro256StarStar::seed_from_u64(config.seed),
        })
    }

    /// Write every transaction in order and finish into one trace pair per
    /// node, each anchored at sample 0 with initial level HIGH and padded
    /// with idle out to at least `horizon` samples.
    pub fn synthesize(
        mut self,
        transactions: &[Transaction],
        horizon: u64,
    ) -> Result<Vec<NodeCapture>, SynthError> {
        for txn in transactions {
            self.write_transaction(txn)?;
        }
        let len = (self.now + 1).max(horizon);
        debug!(
            "synthesized {} transactions over {} samples",
            transactions.len(),
            len
        );
        Ok(self
            .clk
            .into_iter()
            .zip(self.dat)
            .map(|(clk, dat)| NodeCapture::new(clk.finish(len), dat.finish(len)))
            .collect())
    }

    fn node_count(&self) -> usize {
        self.clk.len()
    }

    fn predecessor(&self, i: usize) -> usize {
        (i + self.node_count() - 1) % self.node_count()
    }

    fn advance(&mut self, samples: u64) {
        self.now += samples;
    }

    fn half_periods(&self, n: u64) -> u64 {
        n * self.half_period
    }

    /// One wired-AND settling hop.
    fn propagation_delay(&mut self) {
        let jitter = self.rng.gen_range(1..=3);
        self.now += jitter;
    }

    fn drive_dat(&mut self, i: usize, level: LineLevel) {
        self.dat[i].drive(self.now, level);
    }

    fn dat_level(&self, i: usize) -> LineLevel {
        self.dat[i].level()
    }

    /// Toggle every node's CLK, staggered by propagation delay in ring
    /// order.
    fn clock_edge_all(&mut self) {
        for i in 0..self.node_count() {
            self.clk[i].toggle(self.now);
            self.propagation_delay();
        }
    }

    fn check_idle(&self, stage: &'static str) -> Result<(), SynthError> {
        for i in 0..self.node_count() {
            if !self.clk[i].level().is_high() {
                return Err(SynthError::LinesNotIdle {
                    stage,
                    node: i,
                    line: BusLine::Clk,
                });
            }
            if !self.dat[i].level().is_high() {
                return Err(SynthError::LinesNotIdle {
                    stage,
                    node: i,
                    line: BusLine::Dat,
                });
            }
        }
        Ok(())
    }

    fn check_clks_idle(&self, stage: &'static str) -> Result<(), SynthError> {
        for i in 0..self.node_count() {
            if !self.clk[i].level().is_high() {
                return Err(SynthError::LinesNotIdle {
                    stage,
                    node: i,
                    line: BusLine::Clk,
                });
            }
        }
        Ok(())
    }

    /// Bit count the address is transmitted with, per the 0xF-nibble rule.
    fn address_width(address: u32) -> Result<u32, SynthError> {
        if address <= 0xFF && address & 0xF0 != 0xF0 {
            Ok(8)
        } else if address & 0xF000_0000 == 0xF000_0000 {
            Ok(32)
        } else {
            Err(SynthError::UnencodableAddress(address))
        }
    }

    fn write_transaction(&mut self, txn: &Transaction) -> Result<(), SynthError> {
        let n = self.node_count();
        if txn.sender >= n {
            return Err(SynthError::InvalidSender(txn.sender, n));
        }
        if let Some(p) = txn.priority {
            if p >= n {
                return Err(SynthError::InvalidPriority(p, n));
            }
        }
        let addr_bits = Self::address_width(txn.address)?;

        self.check_idle("entering a transaction")?;
        debug!(
            "writing transaction: sender={} address=0x{:x} {} bytes",
            txn.sender,
            txn.address,
            txn.payload.len()
        );

        let lead_in = self.half_periods(LEAD_IN_HALF_PERIODS);
        self.advance(lead_in);

        let winner = self.write_arbitration(txn.sender, txn.priority)?;
        self.check_clks_idle("after arbitration")?;

        // Reserved slot on the wire before the address
        self.write_bit(txn.sender, LineLevel::High);

        for k in (0..addr_bits).rev() {
            let bit = (txn.address >> k) & 1 == 1;
            self.write_bit(txn.sender, if bit { LineLevel::High } else { LineLevel::Low });
        }

        let total_bits = txn.payload.len() * 8;
        let limit = txn
            .truncate_after_data_bits
            .map_or(total_bits, |l| l.min(total_bits));
        let mut written = 0usize;
        'bytes: for byte in &txn.payload {
            for k in (0..8).rev() {
                if written == limit {
                    break 'bytes;
                }
                let bit = (byte >> k) & 1 == 1;
                self.write_bit(txn.sender, if bit { LineLevel::High } else { LineLevel::Low });
                written += 1;
            }
        }
        self.check_clks_idle("after the data run")?;

        self.write_interrupt(winner);
        self.check_clks_idle("after the interrupt sequence")?;

        let cb1 = if txn.acked { LineLevel::Low } else { LineLevel::High };
        self.write_control(
            txn.sender,
            LineLevel::High,
            (txn.address & 0xF) as usize,
            cb1,
        );
        self.check_clks_idle("after the control epilogue")?;

        let lead_out = self.half_periods(LEAD_OUT_HALF_PERIODS);
        self.advance(lead_out);
        self.check_idle("leaving a transaction")?;
        Ok(())
    }

    /// Request assertion, propagation, t_long, and both arbitration edges,
    /// through the priority latch inclusive. Returns the resolved winner.
    fn write_arbitration(
        &mut self,
        sender: usize,
        priority: Option<usize>,
    ) -> Result<usize, SynthError> {
        let n = self.node_count();

        // Request assertion and ring propagation. Members forward a LOW
        // seen on their predecessor; the master never forwards.
        for i in 0..n {
            if i == sender {
                self.drive_dat(i, LineLevel::Low);
            }
            self.propagation_delay();
            for j in i..i + n {
                let k = j % n;
                if k == 0 {
                    continue;
                }
                if self.dat_level(self.predecessor(k)) == LineLevel::Low {
                    self.drive_dat(k, LineLevel::Low);
                }
                self.propagation_delay();
            }
        }

        // t_long hold
        let t_long = self.half_periods(T_LONG_HALF_PERIODS);
        self.advance(t_long);

        // Falling clock starts the transaction
        self.clock_edge_all();
        self.advance(self.half_periods(1));

        // Arbitration latch edge
        self.clock_edge_all();
        self.advance(self.half_periods(1));

        // Resolve the winner the same way the receiving nodes do
        let mut winner: Option<usize> = None;
        if self.dat_level(0) == LineLevel::Low {
            winner = Some(0);
        } else {
            for i in 1..n {
                if self.dat_level(self.predecessor(i)).is_high()
                    && self.dat_level(i) == LineLevel::Low
                {
                    if winner.is_some() {
                        return Err(SynthError::MultipleWinners);
                    }
                    winner = Some(i);
                }
            }
        }
        let winner = winner.ok_or(SynthError::NoWinner)?;

        // Priority drive edge, then the HIGH-going assertion/propagation
        // pattern; the arbitration winner holds its line and never forwards.
        self.clock_edge_all();
        for i in 0..n {
            if priority == Some(i) {
                self.drive_dat(i, LineLevel::High);
            }
            self.propagation_delay();
            for j in i..i + n {
                let k = j % n;
                if k == winner {
                    continue;
                }
                if self.dat_level(self.predecessor(k)).is_high() {
                    self.drive_dat(k, LineLevel::High);
                }
                self.propagation_delay();
            }
        }
        self.advance(self.half_periods(1));

        // Priority latch edge
        self.clock_edge_all();
        self.advance(self.half_periods(1));

        Ok(winner)
    }

    /// One bit slot: CLK drive edge, ring write of the bit level starting
    /// at the driving node, CLK latch edge.
    fn write_bit(&mut self, origin: usize, level: LineLevel) {
        let n = self.node_count();

        self.clock_edge_all();
        for j in origin..origin + n {
            let k = j % n;
            self.drive_dat(k, level);
            self.propagation_delay();
        }
        self.advance(self.half_periods(1));

        self.clock_edge_all();
        self.advance(self.half_periods(1));
    }

    /// The interrupt sequence: four clock phases visible only to nodes
    /// strictly upstream of the interrupter (the bus freezes beyond its
    /// origin), the master returning every DAT line HIGH, then the fixed
    /// pulse train on all DAT lines.
    fn write_interrupt(&mut self, interrupter: usize) {
        let n = self.node_count();

        for phase in 0..4 {
            for i in 0..interrupter {
                self.clk[i].toggle(self.now);
                self.propagation_delay();
            }
            if phase == 3 {
                for i in 0..n {
                    self.drive_dat(i, LineLevel::High);
                    self.propagation_delay();
                }
            }
            self.advance(self.half_periods(1));
        }

        for _ in 0..INTERRUPT_PULSES * 2 {
            for i in 0..n {
                self.dat[i].toggle(self.now);
                self.propagation_delay();
            }
            self.advance(self.half_periods(1));
        }
    }

    /// The control epilogue: begin-control edges, CB0, CB1, and the
    /// begin-idle edges returning every line HIGH.
    fn write_control(&mut self, origin: usize, cb0: LineLevel, target: usize, cb1: LineLevel) {
        let n = self.node_count();

        // Begin-control drive and latch edges
        self.clock_edge_all();
        self.advance(self.half_periods(1));
        self.clock_edge_all();
        self.advance(self.half_periods(1));

        // CB0 drive: the transmitter's side of the handshake
        self.clock_edge_all();
        for j in origin..origin + n {
            self.drive_dat(j % n, cb0);
        }
        self.advance(self.half_periods(1));

        // CB0 latch
        self.clock_edge_all();
        self.advance(self.half_periods(1));

        // CB1 drive: the addressed node answers, so the ring write starts
        // at its offset
        self.clock_edge_all();
        let target = target % n;
        for j in target..target + n {
            self.drive_dat(j % n, cb1);
        }
        self.advance(self.half_periods(1));

        // CB1 latch
        self.clock_edge_all();
        self.advance(self.half_periods(1));

        // Begin-idle drive: master returns every data line HIGH
        self.clock_edge_all();
        for i in 0..n {
            self.drive_dat(i, LineLevel::High);
            self.propagation_delay();
        }
        self.advance(self.half_periods(1));

        // Begin-idle latch
        self.clock_edge_all();
        for i in 0..n {
            self.drive_dat(i, LineLevel::High);
            self.propagation_delay();
        }
    }
}
