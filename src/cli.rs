//! Command line interface for the `fragmentation` demo binary.
//!
//! The binary pushes oversized messages across a simulated lossy link and
//! prints how each delivery went.

use std::num::NonZeroUsize;

use clap::Parser;

/// Command line arguments for the `fragmentation` binary.
#[derive(Debug, Parser)]
#[command(
    name = "fragmentation",
    version,
    about = "Send oversized messages across a simulated lossy link"
)]
pub struct Cli {
    /// Largest datagram the simulated link carries.
    #[arg(long, default_value_t = 512)]
    pub mtu: usize,
    /// Size of each message in bytes.
    #[arg(short, long, default_value_t = 8192)]
    pub size: usize,
    /// Number of messages sent concurrently.
    #[arg(short, long, default_value_t = 4)]
    pub messages: usize,
    /// Drop every Nth datagram in either direction. Zero disables loss.
    #[arg(long, default_value_t = 7)]
    pub drop_every: usize,
    /// Initial retransmission timeout in milliseconds.
    #[arg(long, default_value_t = 50)]
    pub retransmit_ms: u64,
    /// Retransmission rounds without progress before a message fails.
    #[arg(long, default_value_t = 5)]
    pub max_rounds: u32,
    /// Maximum fragments in flight per message.
    #[arg(long)]
    pub window: Option<NonZeroUsize>,
    /// Limit fragment transmissions per second.
    #[arg(long)]
    pub pace: Option<NonZeroUsize>,
}
