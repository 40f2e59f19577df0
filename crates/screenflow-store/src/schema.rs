/// SQL DDL for the screenflow store.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS workflow_sessions (
    id TEXT PRIMARY KEY,
    patient_id TEXT NOT NULL,
    screening_type TEXT NOT NULL,
    overall_status TEXT NOT NULL,
    current_step TEXT NOT NULL,
    version INTEGER NOT NULL,
    state TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS activity_log (
    session_id TEXT NOT NULL REFERENCES workflow_sessions(id),
    sequence INTEGER NOT NULL,
    step TEXT,
    action TEXT NOT NULL,
    actor_id TEXT NOT NULL,
    actor_name TEXT NOT NULL,
    actor_role TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    changes TEXT NOT NULL,
    comment TEXT,
    origin TEXT NOT NULL,
    PRIMARY KEY (session_id, sequence)
);

CREATE TABLE IF NOT EXISTS approval_index (
    request_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES workflow_sessions(id)
);

-- At most one non-terminal session per patient, across engine instances.
CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_open_patient
    ON workflow_sessions(patient_id)
    WHERE overall_status IN ('active', 'locked');

CREATE INDEX IF NOT EXISTS idx_sessions_patient ON workflow_sessions(patient_id);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON workflow_sessions(overall_status);
CREATE INDEX IF NOT EXISTS idx_activity_actor ON activity_log(session_id, actor_id);

CREATE TRIGGER IF NOT EXISTS activity_log_no_update
    BEFORE UPDATE ON activity_log
BEGIN
    SELECT RAISE(ABORT, 'activity_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS activity_log_no_delete
    BEFORE DELETE ON activity_log
BEGIN
    SELECT RAISE(ABORT, 'activity_log is append-only');
END;

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
