//! Error types for the sharded optimizer core.

use thiserror::Error;

use crate::dtype::Dtype;
use crate::param::ParamId;

pub type Result<T> = std::result::Result<T, ShardError>;

/// Errors that can occur while partitioning, copying, collective-driving,
/// or checkpointing a sharded optimizer. Every variant is fatal: the core
/// never retries, and a step that raises one of these aborts (spec §7).
#[derive(Error, Debug)]
pub enum ShardError {
    #[error("invalid range: end {end} < start {start}")]
    InvalidRange { start: usize, end: usize },

    #[error("unsupported dtype for param {param:?}: {dtype:?}")]
    UnsupportedDtype { param: ParamId, dtype: Dtype },

    #[error("buffer alias unsafe: param dtype ({param_size}B) wider than grad dtype ({grad_size}B)")]
    BufferAliasUnsafe { param_size: usize, grad_size: usize },

    #[error("size mismatch: expected {expected} elements, found {found}")]
    SizeMismatch { expected: usize, found: usize },

    #[error("checkpoint shape mismatch for param world_order {world_order}: saved partition does not match current world size/shape")]
    CheckpointShapeMismatch { world_order: u64 },

    #[error("collective operation failed: {0}")]
    CollectiveFailure(#[from] anyhow::Error),

    #[error("checkpoint serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for ShardError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_informative() {
        let err = ShardError::InvalidRange { start: 5, end: 2 };
        assert!(err.to_string().contains('5'));
        assert!(err.to_string().contains('2'));

        let err = ShardError::SizeMismatch { expected: 4, found: 3 };
        assert!(err.to_string().contains("4"));
        assert!(err.to_string().contains("3"));
    }

    #[test]
    fn wraps_anyhow_errors() {
        let source = anyhow::anyhow!("network partition");
        let err: ShardError = source.into();
        assert!(matches!(err, ShardError::CollectiveFailure(_)));
        assert!(err.to_string().contains("network partition"));
    }

    #[test]
    fn wraps_bincode_errors() {
        // Deserializing an empty buffer as a non-trivial struct is a
        // reliable way to force a real `bincode::Error` without depending
        // on a specific type from elsewhere in the crate.
        let source = bincode::deserialize::<(u64, u64, u64)>(&[]).unwrap_err();
        let err: ShardError = source.into();
        assert!(matches!(err, ShardError::Serialization(_)));
    }
}
