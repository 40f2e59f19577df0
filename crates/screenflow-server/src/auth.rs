//! Bearer token authentication.

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use screenflow_core::identity::{Participant, Role};
use screenflow_settings::TokenGrant;

/// Resolves an opaque token to the participant it was issued to.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &SecretString) -> Option<Participant>;
}

/// Fixed token table loaded from settings. Only token digests are kept.
#[derive(Debug, Default)]
pub struct StaticTokenAuthenticator {
    grants: HashMap<[u8; 32], Participant>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthConfigError {
    #[error("token grant for '{participant_id}': {reason}")]
    InvalidGrant {
        participant_id: String,
        reason: String,
    },
}

impl StaticTokenAuthenticator {
    pub fn from_grants(grants: &[TokenGrant]) -> Result<Self, AuthConfigError> {
        let mut table = HashMap::with_capacity(grants.len());
        for grant in grants {
            let invalid = |reason: String| AuthConfigError::InvalidGrant {
                participant_id: grant.participant_id.clone(),
                reason,
            };
            if grant.token.is_empty() {
                return Err(invalid("empty token".into()));
            }
            if grant.participant_id.is_empty() {
                return Err(invalid("empty participant id".into()));
            }
            let role: Role = grant.role.parse().map_err(invalid)?;
            let participant = Participant::new(&grant.participant_id, &grant.name, role);
            if table.insert(digest(&grant.token), participant).is_some() {
                return Err(invalid("duplicate token".into()));
            }
        }
        Ok(Self { grants: table })
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &SecretString) -> Option<Participant> {
        self.grants.get(&digest(token.expose_secret())).cloned()
    }
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

/// Token from a `Bearer` authorization header value.
pub fn bearer_token(header: &str) -> Option<SecretString> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty())
        .then(|| SecretString::from(token.to_string()))
}
