use thiserror::Error;

/// Errors raised while loading the pipeline's inputs from disk.
///
/// Scanning itself never returns an error: malformed invoices degrade to a
/// partial, scored result instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
