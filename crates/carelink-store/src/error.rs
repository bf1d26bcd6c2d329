use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Could not resolve a data directory")]
    NoDataDir,
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
