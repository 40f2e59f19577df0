use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(SessionId, "wfs");
branded_id!(ApprovalId, "apr");
branded_id!(ConnectionId, "conn");
branded_id!(RequestId, "req");

// Owned by external collaborators; `new()` exists mainly for tests.
branded_id!(PatientId, "pat");
branded_id!(ParticipantId, "usr");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_has_prefix() {
        let id = SessionId::new();
        assert!(id.as_str().starts_with("wfs_"), "got: {id}");
    }

    #[test]
    fn approval_id_has_prefix() {
        let id = ApprovalId::new();
        assert!(id.as_str().starts_with("apr_"), "got: {id}");
    }

    #[test]
    fn connection_id_has_prefix() {
        let id = ConnectionId::new();
        assert!(id.as_str().starts_with("conn_"), "got: {id}");
    }

    #[test]
    fn external_ids_keep_raw_value() {
        let patient = PatientId::from_raw("MRN-000123");
        assert_eq!(patient.as_str(), "MRN-000123");
        let user = ParticipantId::from_raw("dr.okafor");
        assert_eq!(user.to_string(), "dr.okafor");
    }

    #[test]
    fn ids_are_unique_and_monotonic() {
        let ids: Vec<SessionId> = (0..50).map(|_| SessionId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "not monotonic: {} >= {}", w[0], w[1]);
        }
    }

    #[test]
    fn serde_is_transparent() {
        let id = ApprovalId::from_raw("apr_1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"apr_1\"");
        let back: ApprovalId = serde_json::from_str("\"apr_1\"").unwrap();
        assert_eq!(back, id);
    }
}
