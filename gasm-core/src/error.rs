// Assembly error taxonomy

use thiserror::Error;

/// Fatal outcomes of an assembly run.
///
/// Transaction conflicts are not errors: they are retried inside the
/// region and never surface here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    /// A required buffer could not be allocated
    #[error("failed to allocate {what} ({requested} entries)")]
    AllocationFailure { what: &'static str, requested: usize },

    /// A structural invariant was broken; the run cannot produce a sequence
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// The segments or parameters cannot be assembled
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A worker thread panicked
    #[error("worker {0} panicked")]
    WorkerPanicked(usize),
}

impl AssemblyError {
    pub(crate) fn invariant(detail: impl Into<String>) -> Self {
        AssemblyError::InvariantViolation(detail.into())
    }
}

pub type Result<T, E = AssemblyError> = std::result::Result<T, E>;
