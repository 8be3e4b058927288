use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelocError>;

/// Error taxonomy for a relocation run.
///
/// `Config` and `Consistency` abort before or while touching the working
/// directory; `Engine` is fatal for the stage that invoked the external tool
/// and carries its captured output. Per-pair data problems (missing waveform,
/// unpairable picks) are not errors at all: those are skipped and logged by
/// the components that encounter them.
#[derive(Debug, Error)]
pub enum RelocError {
    /// Invalid setup, detected before any engine file is written.
    #[error("configuration error: {0}")]
    Config(String),

    /// Pipeline state that would silently corrupt the relocation if ignored.
    #[error("consistency error: {0}")]
    Consistency(String),

    /// External tool failure: non-zero exit, timeout, or missing/unparsable
    /// output. The decoded process output is attached for diagnosis.
    #[error("{stage} failed: {reason}\n--- captured output ---\n{output}")]
    Engine {
        stage: &'static str,
        reason: String,
        output: String,
    },

    /// Catalog or station file that could not be understood.
    #[error("catalog error in {}: {message}", path.display())]
    Catalog { path: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RelocError {
    pub fn config(message: impl Into<String>) -> Self {
        RelocError::Config(message.into())
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        RelocError::Consistency(message.into())
    }

    pub fn catalog(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        RelocError::Catalog {
            path: path.into(),
            message: message.into(),
        }
    }
}
