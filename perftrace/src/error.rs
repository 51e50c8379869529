use crate::emit::ConsistencyError;
use thiserror::Error;

/// Errors that abort a conversion.
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("trace output error: {0}")]
    Write(#[from] trace_event::WriteError),

    #[error("internal consistency error: {0}")]
    InternalConsistency(#[from] ConsistencyError),
}

pub type Result<T> = std::result::Result<T, ConvertError>;
