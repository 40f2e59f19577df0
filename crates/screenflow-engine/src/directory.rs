use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::RwLock;

use screenflow_core::ids::PatientId;
use screenflow_core::WorkflowError;

/// Lookup into the external patient registry.
#[async_trait]
pub trait PatientDirectory: Send + Sync {
    async fn exists(&self, patient_id: &PatientId) -> Result<bool, WorkflowError>;
}

/// Process-local directory seeded from configuration.
#[derive(Debug, Default)]
pub struct InMemoryPatientDirectory {
    known: RwLock<HashSet<PatientId>>,
    allow_unknown: bool,
}

impl InMemoryPatientDirectory {
    pub fn new(known: impl IntoIterator<Item = PatientId>) -> Self {
        Self {
            known: RwLock::new(known.into_iter().collect()),
            allow_unknown: false,
        }
    }

    /// A directory that accepts every patient id.
    pub fn permissive() -> Self {
        Self {
            known: RwLock::new(HashSet::new()),
            allow_unknown: true,
        }
    }

    pub fn insert(&self, patient_id: PatientId) {
        let _ = self.known.write().insert(patient_id);
    }
}

#[async_trait]
impl PatientDirectory for InMemoryPatientDirectory {
    async fn exists(&self, patient_id: &PatientId) -> Result<bool, WorkflowError> {
        Ok(self.allow_unknown || self.known.read().contains(patient_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeded_directory() {
        let dir = InMemoryPatientDirectory::new([PatientId::from_raw("pat-1")]);
        assert!(dir.exists(&PatientId::from_raw("pat-1")).await.unwrap());
        assert!(!dir.exists(&PatientId::from_raw("pat-2")).await.unwrap());

        dir.insert(PatientId::from_raw("pat-2"));
        assert!(dir.exists(&PatientId::from_raw("pat-2")).await.unwrap());
    }

    #[tokio::test]
    async fn permissive_directory() {
        let dir = InMemoryPatientDirectory::permissive();
        assert!(dir.exists(&PatientId::from_raw("anyone")).await.unwrap());
    }
}
