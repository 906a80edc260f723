use std::io;

/// All error types for the tilestream engine.
#[derive(thiserror::Error, Debug)]
pub enum TileStreamError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Format error: {0}")]
    Format(String),
    #[error("Semantic error: {0}")]
    Semantic(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TileStreamError>;
