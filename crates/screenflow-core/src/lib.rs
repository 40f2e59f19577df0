//! Foundation types shared by every screenflow crate: branded ids, the
//! canonical workflow vocabulary, the session aggregate, audit entries,
//! domain events and the error taxonomy.

pub mod activity;
pub mod diff;
pub mod errors;
pub mod events;
pub mod identity;
pub mod ids;
pub mod session;
pub mod workflow;

pub use errors::WorkflowError;
