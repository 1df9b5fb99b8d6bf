// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for path-patching.

/// Errors that can occur while preparing or scoring a patching experiment.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    /// Tensor operation error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Invalid sequence-position specification or index/tensor mismatch.
    #[error("invalid seq_pos: {0}")]
    Position(String),

    /// Hook capture or lookup error.
    #[error("hook error: {0}")]
    Hook(String),

    /// Logit-difference metric error.
    #[error("metric error: {0}")]
    Metric(String),

    /// Prompt dataset construction error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for path-patching operations.
pub type Result<T> = std::result::Result<T, PatchError>;
