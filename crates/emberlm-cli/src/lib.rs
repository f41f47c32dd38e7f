use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use emberlm::BackendKind;

#[derive(Parser)]
#[command(name = "emberlm")]
#[command(about = "emberlm: token generation for small Llama models", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Generate tokens starting from BOS
    Generate(GenerateArgs),

    /// Print the model dimensions and check files or the accelerator against them
    Info {
        /// Weight file to check against the expected size
        #[arg(long)]
        weights: Option<PathBuf>,

        /// Vocabulary file to parse
        #[arg(long)]
        vocab: Option<PathBuf>,

        /// Open the compute adapter and report its name
        #[arg(long)]
        accelerator: bool,
    },
}

#[derive(Args, Debug, PartialEq)]
pub struct GenerateArgs {
    /// Weight file
    #[arg(long, default_value = "./model/stories15M.bin")]
    pub weights: PathBuf,

    /// Vocabulary file
    #[arg(long, default_value = "./model/tokenizer.bin")]
    pub vocab: PathBuf,

    /// JSON generation config; flags given on the command line win
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of positions to decode (capped at the sequence length)
    #[arg(short = 'n', long)]
    pub max_steps: Option<usize>,

    /// Sampling temperature (below 1e-5 = greedy)
    #[arg(short, long)]
    pub temperature: Option<f32>,

    /// Seed for sampling
    #[arg(long)]
    pub seed: Option<u64>,

    /// Execution backend: local or accelerator
    #[arg(short, long, default_value = "local")]
    pub backend: BackendKind,

    /// Only accept an adapter whose name contains this string
    #[arg(long)]
    pub adapter: Option<String>,

    /// Prefer a low-power adapter
    #[arg(long)]
    pub low_power: bool,

    /// Only accept the software fallback adapter
    #[arg(long)]
    pub fallback_adapter: bool,

    /// Print generated tokens in color
    #[arg(long)]
    pub color: bool,

    /// Print layer 0 attention scores and weights after every position
    #[arg(long)]
    pub print_softmax: bool,

    /// Dump the decode state of every position into this directory
    #[arg(long)]
    pub dump_dir: Option<PathBuf>,
}
