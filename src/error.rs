use thiserror::Error;

use crate::store::JobId;

#[derive(Error, Debug)]
pub enum SchedError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to read config {path}: {source}")]
    ConfigIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn agent {agent}: {source}")]
    Spawn {
        agent: String,
        #[source]
        source: std::io::Error,
    },

    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("store error: {0}")]
    Store(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SchedError>;
