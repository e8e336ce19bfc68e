use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config document: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("kubeconfig not found at {0}")]
    CredentialsMissing(String),
    #[error("kube client error: {0}")]
    Kube(#[from] kube::Error),
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Crate-wide error, aggregating each subsystem's own error enum via
/// `#[from]` the way the teacher's single `Error` enum wraps
/// `kube::runtime::finalizer::Error` and `serde_json::Error`.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Watcher(#[from] WatcherError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error("invalid listen address '{0}'")]
    InvalidListenAddr(String),
    #[error("invalid duration '{raw}': {reason}")]
    InvalidDuration { raw: String, reason: String },
    #[error("probe interval must be at least 1s, got '{0}'")]
    ProbeIntervalTooShort(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http client build error: {0}")]
    HttpClient(#[from] reqwest::Error),
}
