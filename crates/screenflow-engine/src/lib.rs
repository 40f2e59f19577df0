//! The workflow engine: the only writer of workflow sessions.
//!
//! Every mutation of a session runs inside that session's actor task, so
//! mutations of one session are applied strictly one at a time while
//! independent sessions proceed in parallel. Each mutation is validated
//! against the committed state, applied in memory, then committed together
//! with its audit entry in one store transaction. Events go out on a
//! broadcast channel only after the commit succeeds.

mod actor;
pub mod clock;
pub mod config;
pub mod directory;
pub mod engine;
pub mod policy;
pub mod transitions;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use directory::{InMemoryPatientDirectory, PatientDirectory};
pub use engine::{CreateSession, WorkflowEngine};
pub use transitions::{ApprovalSubmission, LockRequest, StepUpdate};
