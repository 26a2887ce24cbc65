//! Example: synthesize a bus capture and decode it back
//!
//! Generates waveforms for a handful of transactions on a configurable ring,
//! runs the decoder over them and prints the resulting frame stream.
//!
//! Usage:
//!   cargo run --example round_trip -- --nodes 4 --transactions 3
//!
//! With verbose decoder logging:
//!   RUST_LOG=mbus=debug cargo run --example round_trip -- --nodes 2

use clap::Parser;
use mbus::{
    BusTopology, ControlOutcome, FrameKind, ProtocolDecoder, SynthConfig, Transaction,
    WaveformSynthesizer,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Ring size including the master (1-16)
    #[arg(short, long, default_value = "2")]
    nodes: usize,

    /// Number of transactions to generate
    #[arg(short, long, default_value = "3")]
    transactions: usize,

    /// Seed for the propagation-delay jitter
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Samples per clock half-period
    #[arg(long, default_value = "20")]
    half_period: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let transactions: Vec<Transaction> = (0..args.transactions)
        .map(|i| {
            let sender = if args.nodes > 1 { 1 + i % (args.nodes - 1) } else { 0 };
            Transaction::new(
                sender,
                0x10 + i as u32,
                vec![0xA0 | i as u8, i as u8],
                i % 2 == 0,
            )
        })
        .collect();

    let config = SynthConfig {
        half_period: args.half_period,
        seed: args.seed,
    };
    let captures = WaveformSynthesizer::with_config(args.nodes, config)?
        .synthesize(&transactions, 0)?;
    info!(
        "synthesized {} transactions across {} nodes ({} samples)",
        transactions.len(),
        args.nodes,
        captures[0].clk.len()
    );

    let mut decoder = ProtocolDecoder::new(BusTopology::new(captures)?)?;
    let mut frames = Vec::new();
    decoder.run(&mut frames, &())?;

    let mut cb0 = false;
    for frame in &frames {
        match frame.kind {
            FrameKind::ControlBit0 => {
                cb0 = frame.scalar() == 1;
                println!("{frame}");
            }
            FrameKind::ControlBit1 => {
                let outcome = ControlOutcome::interpret(cb0, frame.scalar() == 1);
                println!("{frame}  => {outcome:?}");
            }
            _ => println!("{frame}"),
        }
    }
    info!("decoded {} frames", frames.len());

    Ok(())
}
