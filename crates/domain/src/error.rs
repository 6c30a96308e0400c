/// Shared error type used across all keygate crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("upstream {key}: {message}")]
    Upstream { key: String, message: String },

    #[error("config: {0}")]
    Config(String),

    #[error("no usable key available")]
    NoKeyAvailable,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
