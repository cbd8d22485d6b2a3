use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal error kinds. Recoverable conditions (dropped timestamps, failed
/// tasks) are counted in `RunSummary` instead of surfacing here.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("input table error: {0}")]
    InputShape(String),

    #[error("geometry error: {0}")]
    Geometry(String),

    #[error("failed to write output {path}: {source}")]
    OutputIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("output write failed after temp-dir retry: {0}")]
    OutputRetryExhausted(String),
}

impl EngineError {
    /// Process exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Config(_) | EngineError::InputShape(_) | EngineError::Geometry(_) => 2,
            EngineError::OutputIo { .. } | EngineError::OutputRetryExhausted(_) => 3,
        }
    }
}

/// Per-timestamp worker failure. Logged and skipped, never fatal.
#[derive(Debug, Clone)]
pub struct TaskError {
    pub slot_min: i64,
    pub reason: String,
}
