use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "gpu",
    author,
    version,
    about = "Claim, run on, and release GPUs of a shared host."
)]
pub struct Gpu {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,

    #[arg(long, global = true, help = "Path to the config file")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub enum Commands {
    /// List current GPU allocation & status
    Status,
    /// Claim one or more GPUs for exclusive use
    Claim(ClaimArgs),
    /// Claim GPUs and run a command that sees only those devices
    Run(RunArgs),
    /// Return claimed GPUs to the pool
    Release(ReleaseArgs),
}

#[derive(Debug, Parser, Clone)]
pub struct ClaimArgs {
    /// Number of GPUs to claim
    #[arg(short = 'n', long = "num-cards", default_value_t = 1, value_name = "N")]
    pub num_cards: u32,
}

#[derive(Debug, Parser, Clone)]
pub struct RunArgs {
    /// Number of GPUs to claim
    #[arg(short = 'n', long = "num-cards", value_name = "N")]
    pub num_cards: Option<u32>,

    /// Attach to a card you already reserved instead of claiming a new one
    /// (may be given multiple times)
    #[arg(long = "card", value_name = "INDEX", conflicts_with = "num_cards")]
    pub cards: Vec<u32>,

    /// Run without the private /dev view; other cards stay visible
    #[arg(long)]
    pub no_isolation: bool,

    /// The command to run
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Parser, Clone)]
pub struct ReleaseArgs {
    /// Card index to release (may be given multiple times)
    #[arg(long = "card", value_name = "INDEX", required_unless_present = "all")]
    pub cards: Vec<u32>,

    /// Release every card you currently hold
    #[arg(long, conflicts_with = "cards")]
    pub all: bool,
}
