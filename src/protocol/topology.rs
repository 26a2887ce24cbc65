//! Bus ring topology
//!
//! An ordered set of nodes — master at index 0, members 1..K in ring order —
//! each owning one CLK and one DAT cursor. The ring is a fixed-size array
//! with modular neighbor lookup; wired-AND request propagation and
//! arbitration scans only ever need "the node before this one".
//!
//! [`BusTopology::advance_all_to`] is the single synchronization barrier the
//! decoder uses to move the whole bus forward; no phase advances a subset of
//! nodes except the request phase's per-node participation peek.

use crate::capture::{CaptureExhausted, LineLevel, NodeCapture, SampleCursor};

use super::errors::ConfigError;

/// MBus rings are limited to 16 nodes by design.
pub const MAX_NODES: usize = 16;

/// DAT transitions tolerated inside one barrier advance before the window is
/// classified as containing an interrupt pulse train. The slack covers
/// unsynchronized re-arming effects in real captures.
pub const INTERRUPT_TRANSITION_TOLERANCE: u32 = 3;

/// Outcome of a barrier advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Clean,
    /// At least one DAT line saw more transitions than the tolerance: an
    /// out-of-band interrupt landed inside the window.
    Interrupted,
}

/// One bus node's channel cursors. Constructed once per session, never
/// reassigned.
pub struct Node {
    clk: SampleCursor,
    dat: SampleCursor,
}

impl Node {
    fn new(capture: NodeCapture) -> Self {
        Self {
            clk: SampleCursor::new(capture.clk),
            dat: SampleCursor::new(capture.dat),
        }
    }

    pub fn clk(&self) -> &SampleCursor {
        &self.clk
    }

    pub fn dat(&self) -> &SampleCursor {
        &self.dat
    }
}

/// The full ring. Index 0 is the master; the remaining nodes are members in
/// ring order with no gaps.
pub struct BusTopology {
    nodes: Vec<Node>,
}

impl BusTopology {
    pub fn new(captures: Vec<NodeCapture>) -> Result<Self, ConfigError> {
        if captures.is_empty() {
            return Err(ConfigError::EmptyTopology);
        }
        if captures.len() > MAX_NODES {
            return Err(ConfigError::TooManyNodes(captures.len()));
        }
        Ok(Self {
            nodes: captures.into_iter().map(Node::new).collect(),
        })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, i: usize) -> &Node {
        &self.nodes[i]
    }

    /// Ring predecessor of node `i`.
    pub fn predecessor(&self, i: usize) -> usize {
        (i + self.nodes.len() - 1) % self.nodes.len()
    }

    /// Current DAT level of node `i`.
    pub fn dat_level(&self, i: usize) -> LineLevel {
        self.nodes[i].dat.level()
    }

    pub fn dat_cursor_mut(&mut self, i: usize) -> &mut SampleCursor {
        &mut self.nodes[i].dat
    }

    fn last_index(&self) -> usize {
        self.nodes.len() - 1
    }

    /// CLK of the bus tap the decoder latches from: the highest-index
    /// member, or the master when the ring has no members.
    pub fn last_clk(&self) -> &SampleCursor {
        &self.nodes[self.last_index()].clk
    }

    pub fn last_clk_mut(&mut self) -> &mut SampleCursor {
        let i = self.last_index();
        &mut self.nodes[i].clk
    }

    /// DAT of the same tap.
    pub fn last_dat(&self) -> &SampleCursor {
        &self.nodes[self.last_index()].dat
    }

    /// Whether every line is currently HIGH (the idle precondition).
    pub fn is_idle_high(&self) -> bool {
        self.nodes
            .iter()
            .all(|n| n.clk.level().is_high() && n.dat.level().is_high())
    }

    /// Advance every node's CLK and DAT cursor to `sample`.
    ///
    /// Even after an interrupt is seen on one DAT line, the remaining
    /// channels are still advanced; otherwise the next barrier would
    /// re-detect the same pulse train on a later node.
    pub fn advance_all_to(&mut self, sample: u64) -> Result<Advance, CaptureExhausted> {
        let mut interrupted = false;
        for node in &mut self.nodes {
            node.clk.advance_to(sample)?;
            if node.dat.advance_to(sample)? > INTERRUPT_TRANSITION_TOLERANCE {
                interrupted = true;
            }
        }
        if interrupted {
            Ok(Advance::Interrupted)
        } else {
            Ok(Advance::Clean)
        }
    }
}
