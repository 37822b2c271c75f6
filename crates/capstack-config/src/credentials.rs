//! Cloud API credentials
//!
//! Read from the `[Global]` section of an INI file:
//!
//! ```ini
//! [Global]
//! api-url = https://cloud.example.com/client/api
//! api-key = ...
//! secret-key = ...
//! verify-ssl = true
//! ```

use crate::error::{ConfigError, Result};
use config::{Config, File, FileFormat};
use serde::Deserialize;
use std::path::Path;

const GLOBAL_SECTION: &str = "Global";

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    #[serde(rename = "api-url")]
    pub api_url: String,

    #[serde(rename = "api-key")]
    pub api_key: String,

    #[serde(rename = "secret-key")]
    pub secret_key: String,

    #[serde(rename = "verify-ssl", default = "default_verify_ssl")]
    pub verify_ssl: bool,
}

fn default_verify_ssl() -> bool {
    true
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_url", &self.api_url)
            .field("api_key", &self.api_key)
            .field("secret_key", &"<redacted>")
            .field("verify_ssl", &self.verify_ssl)
            .finish()
    }
}

impl Credentials {
    /// Load and validate credentials from an INI file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigError::MissingFile(path.to_path_buf()));
        }

        let settings = Config::builder()
            .add_source(File::from(path).format(FileFormat::Ini))
            .build()
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        // Keys are lower-cased by the config crate
        let credentials: Credentials = match settings.get(&GLOBAL_SECTION.to_lowercase()) {
            Ok(credentials) => credentials,
            Err(config::ConfigError::NotFound(_)) => {
                return Err(ConfigError::SectionNotFound {
                    section: GLOBAL_SECTION.to_string(),
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(invalid(path, e.to_string())),
        };

        credentials.validate(path)?;
        tracing::debug!("Loaded credentials for {} from {}", credentials.api_url, path.display());
        Ok(credentials)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        for (field, value) in [
            ("api-url", &self.api_url),
            ("api-key", &self.api_key),
            ("secret-key", &self.secret_key),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(path, format!("{} is empty", field)));
            }
        }

        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(invalid(
                path,
                format!("api-url must be an http(s) URL, got '{}'", self.api_url),
            ));
        }
        Ok(())
    }
}

fn invalid(path: &Path, message: String) -> ConfigError {
    ConfigError::InvalidCredentials {
        section: GLOBAL_SECTION.to_string(),
        path: path.to_path_buf(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud-config");
        fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_global_section() {
        let (_dir, path) = write(
            "[Global]\n\
             api-url = https://cloud.example.com/client/api\n\
             api-key = key-123\n\
             secret-key = s3cr3t\n\
             verify-ssl = false\n",
        );

        let creds = Credentials::load(&path).unwrap();
        assert_eq!(creds.api_url, "https://cloud.example.com/client/api");
        assert_eq!(creds.api_key, "key-123");
        assert_eq!(creds.secret_key, "s3cr3t");
        assert!(!creds.verify_ssl);
    }

    #[test]
    fn test_verify_ssl_defaults_to_true() {
        let (_dir, path) = write(
            "[Global]\n\
             api-url = https://cloud.example.com/client/api\n\
             api-key = key-123\n\
             secret-key = s3cr3t\n",
        );

        assert!(Credentials::load(&path).unwrap().verify_ssl);
    }

    #[test]
    fn test_missing_section() {
        let (_dir, path) = write("[Other]\napi-url = https://x\n");

        let err = Credentials::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::SectionNotFound { ref section, .. } if section == "Global"));
    }

    #[test]
    fn test_missing_required_field() {
        let (_dir, path) = write("[Global]\napi-url = https://cloud.example.com/client/api\n");

        let err = Credentials::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCredentials { .. }));
    }

    #[test]
    fn test_non_http_url_is_rejected() {
        let (_dir, path) = write(
            "[Global]\n\
             api-url = cloud.example.com\n\
             api-key = key-123\n\
             secret-key = s3cr3t\n",
        );

        let err = Credentials::load(&path).unwrap_err();
        assert!(err.to_string().contains("http(s) URL"));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Credentials::load(dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingFile(_)));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let creds = Credentials {
            api_url: "https://x".to_string(),
            api_key: "k".to_string(),
            secret_key: "very-secret".to_string(),
            verify_ssl: true,
        };
        assert!(!format!("{:?}", creds).contains("very-secret"));
    }
}
