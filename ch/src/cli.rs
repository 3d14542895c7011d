//! CLI argument parsing for the clusterhub demo

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ch")]
#[command(
    author,
    version,
    about = "Run clusterhub scenarios on an in-process cluster",
    long_about = None
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (overrides config; RUST_LOG still applies per target)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Override the namespace marker
    #[arg(short, long, global = true)]
    pub namespace: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Exchange plain messages between the coordinator and a worker
    Broadcast {
        /// Number of workers to spawn
        #[arg(short, long, default_value = "1")]
        workers: usize,
    },

    /// Correlated requests in every supported direction
    Requests {
        #[arg(short, long, default_value = "5")]
        a: i64,

        #[arg(short, long, default_value = "7")]
        b: i64,
    },

    /// Contend for named locks from the coordinator and a worker
    Locks {
        /// How long each holder keeps "foo" (milliseconds)
        #[arg(long, default_value = "100")]
        hold_ms: u64,
    },

    /// Kill a worker while requests to it are outstanding
    DieRequest {
        /// Requests to leave pending before the worker dies
        #[arg(short, long, default_value = "1")]
        pending: usize,
    },

    /// Kill lock holders one after another; each next waiter gets the lock
    DieLock {
        /// Number of workers contending for "foo"
        #[arg(short, long, default_value = "2")]
        workers: usize,
    },
}
