/// Errors raised by the dual-encoder core.
#[derive(Debug, thiserror::Error)]
pub enum SclError {
    /// The model could not be configured (e.g. unknown feature dimension).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Paired tensors or parameter slots disagree in shape or kind.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Tensor data could not be read back to the host.
    #[error("Tensor data error: {0}")]
    Data(String),

    /// Saving or loading a module record failed.
    #[error("Record error: {0}")]
    Record(String),

    /// TOML config could not be parsed.
    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SclError>;
