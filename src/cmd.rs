use std::path::PathBuf;

use clap::{ArgAction, Parser};

fn default_threads() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

/// HTTP/1.1 load generator driven by a declarative connection file.
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
pub struct Cmd {
    /// Use session cookies.
    #[clap(short, long)]
    pub cookies: bool,
    /// Test duration (including ramp-up) [s].
    #[clap(short, long, default_value_t = 60)]
    pub duration: u64,
    /// Input request file.
    #[clap(short = 'i', long, value_name = "PATH")]
    pub request_file: PathBuf,
    /// Output response stats file.
    #[clap(short = 'o', long, value_name = "PATH")]
    pub response_file: Option<PathBuf>,
    /// Quiet mode.
    #[clap(short, long)]
    pub quiet: bool,
    /// Thread ramp-up time [s].
    #[clap(short, long, default_value_t = 0)]
    pub ramp_up: u64,
    /// SSL version: auto(0), SSLv3(1) - TLS1.2(4).
    #[clap(short = 's', long, default_value_t = 0)]
    pub ssl_version: u8,
    /// Number of worker threads.
    #[clap(short, long, default_value_t = default_threads())]
    pub threads: usize,
    /// Be verbose in terms of logging.
    #[clap(short, action = ArgAction::Count)]
    pub verbose: u8,
}
