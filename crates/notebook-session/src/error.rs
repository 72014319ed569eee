//! Error types shared across the session engine.

/// Failures of [`ExecutionFuture::done`](crate::ExecutionFuture::done).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// The future was disposed before its reply arrived.
    #[error("Canceled")]
    Canceled,

    #[error("Kernel connection closed before the execute reply arrived")]
    ReplyDropped,

    #[error("Execution future has already been awaited")]
    AlreadyAwaited,
}

/// Errors a backend reports when starting a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The backend does not know the requested kernel. Callers may retry
    /// with the backend's default kernel.
    #[error("Kernel '{0}' is not supported by this backend")]
    UnsupportedKernel(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum NotebookError {
    #[error("Path or notebook managers not defined")]
    InvalidOptions,

    #[error("Failed to find notebook manager for provider '{0}'")]
    ManagerNotFound(String),

    #[error("No content manager available to {0} the notebook")]
    NoContentManager(&'static str),
}
