use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config directory not found")]
    ConfigDirNotFound,

    #[error(
        "Credentials file not found. Checked:\n\
        - CAPSTACK_CLOUD_CONFIG environment variable\n\
        - ./cloud-config\n\
        - ./.capstack/cloud-config\n\
        - ~/.config/capstack/cloud-config"
    )]
    CredentialsFileNotFound,

    #[error("Credentials file does not exist: {0}")]
    MissingFile(PathBuf),

    #[error("Section [{section}] not found in {path}")]
    SectionNotFound { section: String, path: PathBuf },

    #[error("Invalid [{section}] section in {path}: {message}")]
    InvalidCredentials {
        section: String,
        path: PathBuf,
        message: String,
    },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: config::ConfigError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum KubeconfigError {
    #[error("Kubeconfig is not valid YAML: {0}")]
    Parse(#[source] serde_yaml::Error),

    /// A field is present but holds a value of the wrong shape
    #[error("Kubeconfig field has the wrong type: {0}")]
    WrongType(#[source] serde_yaml::Error),

    #[error("Kubeconfig field missing: {0}")]
    FieldMissing(String),

    #[error("No {kind} named '{name}' in kubeconfig")]
    EntryNotFound { kind: &'static str, name: String },

    #[error("Failed to serialize kubeconfig: {0}")]
    Serialize(#[source] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
