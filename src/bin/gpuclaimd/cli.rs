use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "gpuclaimd",
    author,
    version,
    about = "Reservation and admission-control daemon for shared GPU hosts."
)]
pub struct GpuClaimd {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    #[arg(long, global = true, help = "Path to the config file")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub enum Commands {
    /// Print the merged configuration and exit
    CheckConfig,
    /// Write a config file populated with the defaults
    Init(InitArgs),
}

#[derive(Debug, Parser, Clone)]
pub struct InitArgs {
    /// Overwrite an existing config file
    #[arg(long)]
    pub force: bool,
}
