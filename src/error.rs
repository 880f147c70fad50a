// src/error.rs
use std::io;

/// Central error type for the weir serving engine.
#[derive(Debug)]
pub enum WeirError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// The connection table reached its fixed upper bound.
    TableFull,
    /// The worker task queue rejected a push.
    QueueFull,
    /// Generic or miscellaneous error.
    Other(String),
}

impl std::fmt::Display for WeirError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WeirError::Io(e) => write!(f, "I/O error: {}", e),
            WeirError::TableFull => write!(f, "Connection table is full"),
            WeirError::QueueFull => write!(f, "Worker queue is full"),
            WeirError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for WeirError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WeirError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WeirError {
    fn from(e: io::Error) -> Self {
        WeirError::Io(e)
    }
}

pub type WeirResult<T> = Result<T, WeirError>;
