use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use tracing::{debug, instrument};

use screenflow_core::activity::{ActivityLogEntry, NewActivity};
use screenflow_core::ids::{ApprovalId, PatientId, SessionId};
use screenflow_core::session::WorkflowSession;
use screenflow_core::workflow::SessionStatus;

use crate::activity;
use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const TABLE: &str = "workflow_sessions";

pub const DEFAULT_LIST_LIMIT: u32 = 50;
pub const MAX_LIST_LIMIT: u32 = 500;

#[derive(Clone, Debug, Default)]
pub struct SessionFilter {
    pub patient_id: Option<PatientId>,
    pub status: Option<SessionStatus>,
    pub limit: Option<u32>,
}

/// Persistence for the session aggregate.
///
/// Writes always go through [`SessionRepo::insert`] or
/// [`SessionRepo::commit`], each of which appends exactly one audit entry
/// in the same transaction.
#[derive(Clone)]
pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a brand-new session together with its `created` entry.
    /// Fails with `Conflict` if the patient already has an open session.
    #[instrument(skip(self, session, entry), fields(session_id = %session.session_id, patient_id = %session.patient_id))]
    pub fn insert(
        &self,
        session: &WorkflowSession,
        entry: NewActivity,
    ) -> Result<ActivityLogEntry, StoreError> {
        self.db.with_tx(|conn| {
            let inserted = conn.execute(
                "INSERT INTO workflow_sessions (id, patient_id, screening_type, overall_status,
                                                current_step, version, state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    session.session_id.as_str(),
                    session.patient_id.as_str(),
                    session.screening_type,
                    session.overall_status.to_string(),
                    session.current_step.as_str(),
                    session.version,
                    serde_json::to_string(session)?,
                    row_helpers::format_time(&session.created_at),
                    row_helpers::format_time(&session.updated_at),
                ],
            );
            if let Err(e) = inserted {
                return Err(match StoreError::from(e) {
                    StoreError::Conflict(_) => StoreError::Conflict(format!(
                        "patient {} already has an open session",
                        session.patient_id
                    )),
                    other => other,
                });
            }
            index_approvals(conn, session)?;
            activity::append(conn, entry)
        })
    }

    /// Persist a mutated session. `session.version` must be exactly one
    /// more than the stored version, otherwise another writer got there
    /// first and the whole commit is rejected with `StaleVersion`.
    #[instrument(skip(self, session, entry), fields(session_id = %session.session_id, version = session.version, action = %entry.action))]
    pub fn commit(
        &self,
        session: &WorkflowSession,
        entry: NewActivity,
    ) -> Result<ActivityLogEntry, StoreError> {
        self.db.with_tx(|conn| {
            let updated = conn.execute(
                "UPDATE workflow_sessions
                 SET overall_status = ?1, current_step = ?2, version = ?3, state = ?4, updated_at = ?5
                 WHERE id = ?6 AND version = ?7",
                rusqlite::params![
                    session.overall_status.to_string(),
                    session.current_step.as_str(),
                    session.version,
                    serde_json::to_string(session)?,
                    row_helpers::format_time(&session.updated_at),
                    session.session_id.as_str(),
                    session.version - 1,
                ],
            )?;

            if updated == 0 {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM workflow_sessions WHERE id = ?1)",
                    [session.session_id.as_str()],
                    |row| row.get(0),
                )?;
                return Err(if exists {
                    debug!("stale session version");
                    StoreError::StaleVersion(format!(
                        "session {} was modified concurrently",
                        session.session_id
                    ))
                } else {
                    StoreError::NotFound(format!("session {}", session.session_id))
                });
            }

            index_approvals(conn, session)?;
            activity::append(conn, entry)
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn get(&self, session_id: &SessionId) -> Result<WorkflowSession, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT state FROM workflow_sessions WHERE id = ?1")?;
            let mut rows = stmt.query([session_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {session_id}"))),
            }
        })
    }

    /// The patient's active or locked session, if any.
    pub fn find_open_for_patient(
        &self,
        patient_id: &PatientId,
    ) -> Result<Option<WorkflowSession>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT state FROM workflow_sessions
                 WHERE patient_id = ?1 AND overall_status IN ('active', 'locked')",
            )?;
            let mut rows = stmt.query([patient_id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Newest sessions first.
    #[instrument(skip(self))]
    pub fn list(&self, filter: &SessionFilter) -> Result<Vec<WorkflowSession>, StoreError> {
        let mut sql = String::from("SELECT state FROM workflow_sessions WHERE 1 = 1");
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(patient) = &filter.patient_id {
            sql.push_str(" AND patient_id = ?");
            args.push(SqlValue::Text(patient.to_string()));
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND overall_status = ?");
            args.push(SqlValue::Text(status.to_string()));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        args.push(SqlValue::Integer(i64::from(limit)));

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(args.iter()))?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    /// Owning session of an approval request.
    pub fn session_for_approval(&self, request_id: &ApprovalId) -> Result<SessionId, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT session_id FROM approval_index WHERE request_id = ?1")?;
            let mut rows = stmt.query([request_id.as_str()])?;
            match rows.next()? {
                Some(row) => {
                    let id: String = row_helpers::get(row, 0, "approval_index", "session_id")?;
                    Ok(SessionId::from_raw(id))
                }
                None => Err(StoreError::NotFound(format!("approval request {request_id}"))),
            }
        })
    }
}

fn index_approvals(conn: &Connection, session: &WorkflowSession) -> Result<(), StoreError> {
    for approval in &session.approvals {
        conn.execute(
            "INSERT OR IGNORE INTO approval_index (request_id, session_id) VALUES (?1, ?2)",
            rusqlite::params![approval.request_id.as_str(), session.session_id.as_str()],
        )?;
    }
    Ok(())
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<WorkflowSession, StoreError> {
    let state: String = row_helpers::get(row, 0, TABLE, "state")?;
    row_helpers::parse_json(&state, TABLE, "state")
}
