use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Daemon and front-end settings. Everything has a shipped default; a config
/// file or `GPUCLAIM_*` environment variables override individual keys.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// Path of the local seqpacket socket the daemon listens on.
    pub socket_path: PathBuf,
    /// Sentinel file; while it exists, new claims are rejected.
    pub maintenance_path: PathBuf,
    /// Maximum number of cards a single uid may hold at once.
    pub gpu_limit_per_user: u32,
    /// Reserved cards with no observed process activity for this long are
    /// forcibly returned to the pool.
    pub idle_timeout_secs: u64,
    /// Connections that are not waiting on the queue are closed this long
    /// after accept.
    pub client_sweep_secs: u64,
    /// Soft cap on concurrent client connections; further connects are
    /// dropped at accept.
    pub max_clients: usize,
    /// Directory for the daemon's rolling log files. Unset logs to the
    /// console only.
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/gpu_server.sock"),
            maintenance_path: PathBuf::from("/var/run/gpu_claim_maintenance"),
            gpu_limit_per_user: 8,
            idle_timeout_secs: 60,
            client_sweep_secs: 2,
            max_clients: 100,
            log_dir: Some(PathBuf::from("/var/log/gpuclaim")),
        }
    }
}

/// Load the layered configuration: an explicitly passed file first, then
/// `/etc/gpuclaim.toml`, then the per-user config directory, with
/// `GPUCLAIM_*` environment variables on top.
pub fn load_config(config_path: Option<&PathBuf>) -> Result<Config, config::ConfigError> {
    let mut config_vec = vec![];

    if let Some(config_path) = config_path {
        if config_path.exists() {
            config_vec.push(config_path.clone());
        } else {
            eprintln!("Warning: Config file {config_path:?} not found.");
        }
    }

    let system_config = PathBuf::from("/etc/gpuclaim.toml");
    if system_config.exists() {
        config_vec.push(system_config);
    }

    if let Some(user_config) = dirs::config_dir().map(|d| d.join("gpuclaim").join("gpuclaim.toml"))
    {
        if user_config.exists() {
            config_vec.push(user_config);
        }
    }

    let settings = config::Config::builder();
    let settings = config_vec.iter().fold(settings, |s, path| {
        s.add_source(config::File::from(path.as_path()))
    });

    settings
        .add_source(
            config::Environment::with_prefix("GPUCLAIM")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}
