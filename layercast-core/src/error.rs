use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LayercastError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Peer discovery error: {0}")]
    Discovery(String),

    #[error("{0}")]
    Aggregate(AggregateError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LayercastError>;

/// Failures collected from a best-effort batch, in the order they occurred.
#[derive(Debug)]
pub struct AggregateError {
    errors: Vec<LayercastError>,
}

impl AggregateError {
    pub fn errors(&self) -> &[LayercastError] {
        &self.errors
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred: ", self.errors.len())?;
        for (index, error) in self.errors.iter().enumerate() {
            if index > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", error)?;
        }
        Ok(())
    }
}

impl LayercastError {
    /// Collapses per-item failures into one result. No failures is success and
    /// a single failure is returned unchanged.
    pub fn combine(mut errors: Vec<LayercastError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(LayercastError::Aggregate(AggregateError { errors })),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LayercastError::Cancelled)
    }
}
