use anyhow::Context;
use clap::Parser;
use gpuclaim::config::Config;
use tracing_appender::non_blocking::WorkerGuard;

mod cli;
mod commands;
mod server;

fn main() -> anyhow::Result<()> {
    let mut args = cli::GpuClaimd::parse();

    if let Some(command) = args.command.take() {
        return commands::handle_commands(args.config.as_ref(), command);
    }

    let config = gpuclaim::config::load_config(args.config.as_ref())
        .map_err(|e| anyhow::anyhow!("failed to load config: {e}"))?;

    let _guard = init_tracing(&args, &config)?;

    // All reservation state lives in one task on a single-threaded runtime,
    // so exclusive ownership is enforced by construction rather than locks.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("could not build runtime")?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, server::run(config))
}

/// Console (stderr) layer plus, when a log directory is configured and
/// writable, a daily rolling file layer.
fn init_tracing(args: &cli::GpuClaimd, config: &Config) -> anyhow::Result<Option<WorkerGuard>> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let (file_layer, guard) = match &config.log_dir {
        Some(log_dir) => match std::fs::create_dir_all(log_dir) {
            Ok(()) => {
                let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
                    .rotation(tracing_appender::rolling::Rotation::DAILY)
                    .filename_prefix("daemon")
                    .filename_suffix("log")
                    .max_log_files(7)
                    .build(log_dir)?;
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                let layer = tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(non_blocking);
                (Some(layer), Some(guard))
            }
            Err(e) => {
                eprintln!(
                    "Warning: could not create log directory {}: {e}; logging to console only.",
                    log_dir.display()
                );
                (None, None)
            }
        },
        None => (None, None),
    };

    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(args.verbosity.tracing_level_filter())
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}
