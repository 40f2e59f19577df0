//! The append-only audit trail.
//!
//! Rows are only ever written by [`append`] from inside a session commit
//! transaction; triggers reject UPDATE and DELETE.

use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use tracing::instrument;

use screenflow_core::activity::{ActivityLogEntry, ActivityQuery, NewActivity};
use screenflow_core::identity::{Participant, Role};
use screenflow_core::ids::{ParticipantId, SessionId};
use screenflow_core::workflow::WorkflowStep;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const TABLE: &str = "activity_log";

const COLUMNS: &str = "session_id, sequence, step, action, actor_id, actor_name, actor_role, \
                       timestamp, changes, comment, origin";

/// Insert `entry` with the next gap-free sequence for its session.
pub(crate) fn append(conn: &Connection, entry: NewActivity) -> Result<ActivityLogEntry, StoreError> {
    let sequence: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sequence), 0) + 1 FROM activity_log WHERE session_id = ?1",
        [entry.session_id.as_str()],
        |row| row.get(0),
    )?;

    conn.execute(
        "INSERT INTO activity_log (session_id, sequence, step, action, actor_id, actor_name,
                                   actor_role, timestamp, changes, comment, origin)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            entry.session_id.as_str(),
            sequence,
            entry.step.map(|s| s.as_str()),
            entry.action.as_str(),
            entry.actor.id.as_str(),
            entry.actor.name,
            entry.actor.role.as_str(),
            row_helpers::format_time(&entry.timestamp),
            serde_json::to_string(&entry.changes)?,
            entry.comment,
            serde_json::to_string(&entry.origin)?,
        ],
    )?;

    Ok(ActivityLogEntry::from_new(entry, sequence))
}

/// Read side of the audit trail. There is no update or delete API.
#[derive(Clone)]
pub struct ActivityRepo {
    db: Database,
}

impl ActivityRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// List entries for a session. Newest first unless `query.ascending`.
    #[instrument(skip(self, query), fields(session_id = %session_id))]
    pub fn list(
        &self,
        session_id: &SessionId,
        query: &ActivityQuery,
    ) -> Result<Vec<ActivityLogEntry>, StoreError> {
        let mut sql = format!("SELECT {COLUMNS} FROM activity_log WHERE session_id = ?");
        let mut args: Vec<SqlValue> = vec![SqlValue::Text(session_id.to_string())];

        if let Some(step) = query.step {
            sql.push_str(" AND step = ?");
            args.push(SqlValue::Text(step.as_str().to_string()));
        }
        if let Some(action) = query.action {
            sql.push_str(" AND action = ?");
            args.push(SqlValue::Text(action.as_str().to_string()));
        }
        if let Some(actor) = &query.actor_id {
            sql.push_str(" AND actor_id = ?");
            args.push(SqlValue::Text(actor.to_string()));
        }
        if let Some(after) = query.after_sequence {
            sql.push_str(" AND sequence > ?");
            args.push(SqlValue::Integer(after));
        }
        sql.push_str(if query.ascending {
            " ORDER BY sequence ASC"
        } else {
            " ORDER BY sequence DESC"
        });
        sql.push_str(" LIMIT ?");
        args.push(SqlValue::Integer(i64::from(query.effective_limit())));

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(args.iter()))?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_entry(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn count(&self, session_id: &SessionId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM activity_log WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }

    /// Highest committed sequence, 0 for an unknown session.
    pub fn latest_sequence(&self, session_id: &SessionId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COALESCE(MAX(sequence), 0) FROM activity_log WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<ActivityLogEntry, StoreError> {
    let session_id: String = row_helpers::get(row, 0, TABLE, "session_id")?;
    let step: Option<String> = row_helpers::get_opt(row, 2, TABLE, "step")?;
    let action: String = row_helpers::get(row, 3, TABLE, "action")?;
    let actor_id: String = row_helpers::get(row, 4, TABLE, "actor_id")?;
    let actor_role: String = row_helpers::get(row, 6, TABLE, "actor_role")?;
    let timestamp: String = row_helpers::get(row, 7, TABLE, "timestamp")?;
    let changes: String = row_helpers::get(row, 8, TABLE, "changes")?;
    let origin: String = row_helpers::get(row, 10, TABLE, "origin")?;

    Ok(ActivityLogEntry {
        session_id: SessionId::from_raw(session_id),
        sequence: row_helpers::get(row, 1, TABLE, "sequence")?,
        step: step
            .map(|s| row_helpers::parse_enum::<WorkflowStep>(&s, TABLE, "step"))
            .transpose()?,
        action: row_helpers::parse_enum(&action, TABLE, "action")?,
        actor: Participant {
            id: ParticipantId::from_raw(actor_id),
            name: row_helpers::get(row, 5, TABLE, "actor_name")?,
            role: row_helpers::parse_enum::<Role>(&actor_role, TABLE, "actor_role")?,
        },
        timestamp: row_helpers::parse_time(&timestamp, TABLE, "timestamp")?,
        changes: row_helpers::parse_json(&changes, TABLE, "changes")?,
        comment: row_helpers::get_opt(row, 9, TABLE, "comment")?,
        origin: row_helpers::parse_json(&origin, TABLE, "origin")?,
    })
}
