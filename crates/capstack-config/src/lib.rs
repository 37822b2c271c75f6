pub mod credentials;
pub mod error;
pub mod kubeconfig;

pub use credentials::Credentials;
pub use error::*;
pub use kubeconfig::Kubeconfig;

use std::path::PathBuf;

/// Environment variable pointing directly at a credentials file
pub const CLOUD_CONFIG_ENV: &str = "CAPSTACK_CLOUD_CONFIG";

const CREDENTIALS_FILE: &str = "cloud-config";

/// capstack's directory under the user config dir
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("capstack");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// Locate the credentials file
///
/// Search order:
/// 1. `CAPSTACK_CLOUD_CONFIG` (direct path)
/// 2. `./cloud-config`
/// 3. `./.capstack/cloud-config`
/// 4. `~/.config/capstack/cloud-config`
pub fn find_credentials_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var(CLOUD_CONFIG_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(
            "{} points at {}, which does not exist",
            CLOUD_CONFIG_ENV,
            path.display()
        );
    }

    let current_dir = std::env::current_dir()?;

    let path = current_dir.join(CREDENTIALS_FILE);
    if path.exists() {
        return Ok(path);
    }

    let path = current_dir.join(".capstack").join(CREDENTIALS_FILE);
    if path.exists() {
        return Ok(path);
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global = config_dir.join("capstack").join(CREDENTIALS_FILE);
        if global.exists() {
            return Ok(global);
        }
    }

    Err(ConfigError::CredentialsFileNotFound)
}
