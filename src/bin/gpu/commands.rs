use crate::cli::Commands;
use gpuclaim::config::Config;

mod claim;
mod release;
mod run;
mod status;

pub async fn handle_commands(config: &Config, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Status => status::handle_status(config).await,
        Commands::Claim(claim_args) => claim::handle_claim(config, claim_args).await,
        Commands::Run(run_args) => run::handle_run(config, run_args).await,
        Commands::Release(release_args) => release::handle_release(config, release_args).await,
    }
}
