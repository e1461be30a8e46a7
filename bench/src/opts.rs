//! Command-line options. Defaults match the classic single-process
//! run: 4 KiB blocks, 50000 sequential inserts.

use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "bench",
    about = "Drive a shared bptree database from multiple processes and threads"
)]
pub struct Opts {
    /// log2 of the block size
    #[arg(short = 'p', long = "page-bits", default_value_t = 12)]
    pub node_bits: u32,

    /// Number of keys in the shared table
    #[arg(short = 'n', long = "rounds", default_value_t = 50_000)]
    pub rounds: usize,

    /// Operation performed for each dispatched index
    #[arg(short = 'o', long = "op", value_enum, default_value = "write")]
    pub op: OpKind,

    /// Visit the key table in a random permutation
    #[arg(short = 'r', long = "random")]
    pub random: bool,

    /// Buffer pool capacity, in segments
    #[arg(short = 'c', long = "cache", default_value_t = 64)]
    pub pool_capacity: usize,

    /// Worker threads per process
    #[arg(short = 't', long = "threads", default_value_t = 1)]
    pub threads: u32,

    /// Processes sharing the database
    #[arg(short = 'P', long = "processes", default_value_t = 1)]
    pub processes: u32,

    /// Keep the shared-memory and semaphore names on exit
    #[arg(short = 'C', long = "no-cleanup")]
    pub no_cleanup: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    /// Look every key up and check its value
    Read,
    /// Insert every key
    Write,
    /// Insert, then immediately look up, each dispatched key
    Rw,
}

impl OpKind {
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Read => "read",
            OpKind::Write => "write",
            OpKind::Rw => "rw",
        }
    }
}
