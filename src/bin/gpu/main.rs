use clap::Parser;

mod cli;
mod commands;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let gpu = cli::Gpu::parse();
    env_logger::Builder::new()
        .filter_level(gpu.verbose.log_level_filter())
        .init();

    log::debug!("{:?}", gpu);

    let config = gpuclaim::config::load_config(gpu.config.as_ref())
        .map_err(|e| anyhow::anyhow!("failed to load config: {e}"))?;

    commands::handle_commands(&config, gpu.command).await
}
