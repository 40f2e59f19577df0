/// Error taxonomy shared by the engine and the gateway.
///
/// The first four variants are caller errors and are never retried
/// automatically. `Store` and `Internal` are infrastructure failures; the
/// mutation that hit them was not applied.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("{0}")]
    Internal(String),
}

impl WorkflowError {
    /// Short classification string for logs, metrics and wire error codes.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Authorization(_) => "authorization_error",
            Self::Store(_) => "store_error",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Store(_) | Self::Internal(_))
    }
}
