mod audit;
mod commands;
mod init;
mod session;
mod status;

pub use audit::{run_audit_list, run_audit_rebuild_summary, run_audit_reconcile, run_audit_summary};
pub use commands::AuditCommands;
pub use init::{InitOptions, run_init};
pub use session::{run_check, run_login, run_sync, run_watch};
pub use status::run_status;

use std::path::{Path, PathBuf};

use crate::client::RosterClient;
use crate::config::ClientConfig;

pub const CONFIG_FILE: &str = "config.toml";

#[must_use]
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

/// Loads the config written by `init`, pinning its data directory to the one
/// given on the command line.
pub fn load_config(data_dir: &str) -> anyhow::Result<ClientConfig> {
    let data_path = PathBuf::from(data_dir);
    let path = config_path(&data_path);

    if !path.exists() {
        anyhow::bail!(
            "Config not found at {}. Run 'rostersync init' first.",
            path.display()
        );
    }

    let mut config = ClientConfig::load(&path)?;
    config.data_dir = data_path;
    Ok(config)
}

/// Builds a client from the data directory. Opening does not touch the network.
pub fn open_client(data_dir: &str) -> anyhow::Result<RosterClient> {
    let config = load_config(data_dir)?;
    RosterClient::from_config(&config).map_err(Into::into)
}
