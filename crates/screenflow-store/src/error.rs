use screenflow_core::WorkflowError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Optimistic version check failed; the caller may reload and retry.
    #[error("stale version: {0}")]
    StaleVersion(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        if e.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation) {
            return StoreError::Conflict(e.to_string());
        }
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for WorkflowError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => WorkflowError::NotFound(what),
            StoreError::Conflict(what) | StoreError::StaleVersion(what) => {
                WorkflowError::Conflict(what)
            }
            other => WorkflowError::Store(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_into_workflow_error() {
        let err: WorkflowError = StoreError::NotFound("session wfs_1".into()).into();
        assert!(matches!(err, WorkflowError::NotFound(_)));

        let err: WorkflowError = StoreError::Conflict("stale version".into()).into();
        assert!(matches!(err, WorkflowError::Conflict(_)));

        let err: WorkflowError = StoreError::StaleVersion("wfs_1".into()).into();
        assert!(matches!(err, WorkflowError::Conflict(_)));

        let err: WorkflowError = StoreError::Database("disk I/O error".into()).into();
        assert!(matches!(err, WorkflowError::Store(_)));
    }

    #[test]
    fn constraint_violation_becomes_conflict() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id TEXT PRIMARY KEY); INSERT INTO t VALUES ('a');")
            .unwrap();
        let err: StoreError = conn
            .execute("INSERT INTO t VALUES ('a')", [])
            .unwrap_err()
            .into();
        assert!(matches!(err, StoreError::Conflict(_)), "got {err:?}");
    }
}
