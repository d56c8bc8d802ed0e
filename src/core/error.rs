/// Error taxonomy of the staged backup/restore orchestration
///
/// Dispatch decides per kind whether to log-and-continue or to treat a
/// failure as fatal to the session, so the kinds are explicit instead
/// of one opaque error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    /// Container runtime API failure: enumerating containers/volumes,
    /// inspecting, stopping or starting them.
    #[error("container runtime error: {0:#}")]
    Runtime(anyhow::Error),

    /// Metadata store I/O failure. Aborts stage 1 before any container
    /// is touched.
    #[error("metadata store error: {0:#}")]
    Store(anyhow::Error),

    /// The backup engine subprocess failed.
    #[error("{0}")]
    Engine(String),

    /// The runner could not be launched or exited non-zero.
    #[error("{0}")]
    Runner(String),

    /// Healthcheck detection. Reported, never auto-remediated.
    #[error("{0}")]
    Consistency(String),

    /// The operation was cancelled. Privileged: must never be masked by
    /// a broader error and always re-surfaces after guaranteed cleanup.
    #[error("operation cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn runtime(err: impl Into<anyhow::Error>) -> Self {
        Self::Runtime(err.into())
    }

    pub fn store(err: impl Into<anyhow::Error>) -> Self {
        Self::Store(err.into())
    }
}
