use thiserror::Error;

pub type MegaResult<T> = Result<T, MegaError>;

#[derive(Debug, Error)]
pub enum MegaError {
    #[error("config error: {0}")]
    Config(String),

    #[error("logging error: {0}")]
    Logging(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
