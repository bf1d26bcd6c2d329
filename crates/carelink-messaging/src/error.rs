use thiserror::Error;

#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Transport error: {0}")]
    Transport(#[from] carelink_transport::TransportError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] carelink_store::PersistenceError),
}

pub type Result<T> = std::result::Result<T, MessagingError>;
