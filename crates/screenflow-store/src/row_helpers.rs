use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Get an optional column value.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Deserialize a JSON string column, returning CorruptRow on parse failure.
pub fn parse_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

pub fn parse_time(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table,
            column,
            detail: format!("invalid timestamp {raw}: {e}"),
        })
}

/// Fixed-width RFC 3339 so lexical order matches time order.
pub fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use screenflow_core::workflow::{SessionStatus, WorkflowStep};

    #[test]
    fn parse_enum_success() {
        let result: Result<SessionStatus, _> =
            parse_enum("locked", "workflow_sessions", "overall_status");
        assert_eq!(result.unwrap(), SessionStatus::Locked);
    }

    #[test]
    fn parse_enum_failure() {
        let result: Result<WorkflowStep, _> = parse_enum("triage", "activity_log", "step");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "activity_log", column: "step", .. })
        ));
    }

    #[test]
    fn parse_json_failure() {
        let result: Result<serde_json::Value, _> =
            parse_json("not valid json", "activity_log", "changes");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "activity_log", column: "changes", .. })
        ));
    }

    #[test]
    fn time_round_trip_keeps_micros() {
        let now = Utc::now();
        let raw = format_time(&now);
        assert!(raw.ends_with('Z'), "got: {raw}");
        let back = parse_time(&raw, "activity_log", "timestamp").unwrap();
        assert_eq!(back.timestamp_micros(), now.timestamp_micros());
    }
}
