use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DistError {
    #[error("Failed to connect SSH session or execute SSH command: {0}")]
    SshError(#[from] openssh::Error),
    #[error("Failed to execute local command: {0}")]
    LocalCommandError(#[from] std::io::Error),
    #[error("Failed to read hosts file {path}: {source}")]
    HostsFileError {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Invalid hosts file {path}: {reason}")]
    InvalidHosts { path: PathBuf, reason: String },
    #[error("Transfer host list has {transfer} entries but there are {hosts} hosts")]
    TransferHostMismatch { hosts: usize, transfer: usize },
    #[error("Failed to (de)serialize pending operation record: {0}")]
    RecordError(#[from] serde_json::Error),
    #[error("Failed to render script: {0}")]
    RenderError(#[from] handlebars::RenderError),
    #[error("Could not determine home directory; pass --hf-cache and --cache-dir explicitly")]
    NoHomeDir,
}

pub type Result<T> = std::result::Result<T, DistError>;
