use crate::cli::{Commands, InitArgs};
use anyhow::Context;
use gpuclaim::config::Config;
use std::path::{Path, PathBuf};

pub fn handle_commands(config_path: Option<&PathBuf>, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::CheckConfig => {
            let config = gpuclaim::config::load_config(config_path)
                .map_err(|e| anyhow::anyhow!("failed to load config: {e}"))?;
            println!("{config:#?}");
            Ok(())
        }
        Commands::Init(init_args) => handle_init(config_path, init_args),
    }
}

fn handle_init(config_path: Option<&PathBuf>, args: InitArgs) -> anyhow::Result<()> {
    let target_path = config_path
        .cloned()
        .unwrap_or_else(|| PathBuf::from("/etc/gpuclaim.toml"));

    if target_path.exists() && !args.force {
        anyhow::bail!(
            "Config file already exists: {} (use --force to overwrite)",
            target_path.display()
        );
    }

    let rendered = render_config_toml(&Config::default())?;
    write_config_file(&target_path, &rendered, args.force)?;
    println!("Configuration saved to: {}", target_path.display());
    Ok(())
}

fn render_config_toml(config: &Config) -> anyhow::Result<String> {
    toml::to_string_pretty(config).context("Failed to serialize config to TOML")
}

fn write_config_file(path: &Path, content: &str, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Refusing to overwrite existing file: {} (use --force)",
            path.display()
        );
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create config directory {}", parent.display()))?;

    let tmp = parent.join(format!(".gpuclaim.toml.tmp.{}", std::process::id()));
    std::fs::write(&tmp, content)
        .with_context(|| format!("Failed to write temp file {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| {
        format!(
            "Failed to move temp file {} to {}",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}
