use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A tool reported failure. Carries the provider's own text.
    #[error("{0}")]
    Provider(String),

    #[error("{0} timed out")]
    Timeout(String),

    #[error("tool catalog unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Mcp(#[from] mcp::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
