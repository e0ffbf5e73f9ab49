use std::fs;
use std::path::PathBuf;

use crate::client::open_envelope;
use crate::config::ClientConfig;

use super::config_path;

pub struct InitOptions {
    pub data_dir: String,
    pub base_url: String,
    pub principal_id: Option<String>,
    pub no_encrypt: bool,
    pub force: bool,
}

#[cfg(unix)]
fn set_restrictive_permissions(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        tracing::warn!("Failed to set permissions on {}: {e}", path.display());
    }
}

/// Writes a fresh config file and provisions the cache key.
pub fn run_init(options: InitOptions) -> anyhow::Result<()> {
    let data_path = PathBuf::from(&options.data_dir);
    fs::create_dir_all(&data_path)?;

    let path = config_path(&data_path);
    if path.exists() && !options.force {
        anyhow::bail!(
            "Already initialized. Config exists at: {} (use --force to overwrite)",
            path.display()
        );
    }

    let config = ClientConfig {
        base_url: options.base_url,
        data_dir: data_path,
        principal_id: options.principal_id,
        encrypt_cache: !options.no_encrypt,
        ..ClientConfig::default()
    };
    config.validate()?;

    fs::write(&path, config.to_toml_string()?)?;
    #[cfg(unix)]
    set_restrictive_permissions(&path);

    open_envelope(&config)?;

    println!("Config written to: {}", path.display());
    if config.encrypt_cache {
        println!("Cache key: {}", config.key_path().display());
    }
    if config.principal_id.is_none() {
        println!("Set principal_id in the config before running 'rostersync login'.");
    }
    Ok(())
}
