#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The requested stage layout cannot be satisfied by the graph.
    /// Surfaced before any training step runs.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A node referenced a nonexistent attribute path, submodule, function,
    /// or an unresolved predecessor value. Indicates a malformed graph or a
    /// partition mismatch between ranks.
    #[error("reference error: {0}")]
    Reference(String),

    /// The transport was asked to encode or decode a value of unsupported
    /// structural type. Once this fires mid-stream, the framing is
    /// misaligned and the channel is unrecoverable.
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// A local per-node evaluation failure. Not retried; aborts the step.
    #[error("execution error: {0}")]
    Execution(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
