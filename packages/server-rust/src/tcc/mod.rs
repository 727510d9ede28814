//! Try-Confirm-Cancel distributed transactions.
//!
//! - [`coordinator`]: runs the try logic, decides, dispatches confirm/cancel, recovers
//! - [`store`] / [`repository`]: the persisted transaction log and its backends
//! - [`recovery`]: the periodic recovery scan as a background worker
//! - [`participant`]: duplicate-suppressing wrapper for confirm/cancel handlers

pub mod config;
pub mod coordinator;
pub mod memory;
pub mod model;
pub mod participant;
pub mod recovery;
#[cfg(feature = "redb")]
pub mod redb_repository;
pub mod repository;
pub mod store;

use crate::service::CallError;

pub use config::TransactionConfig;
pub use coordinator::{RecoveryReport, TccCoordinator, TccLeg, TransactionScope};
pub use memory::InMemoryTransRepository;
pub use model::{
    Participant, ParticipantInvocation, ParticipantStatus, TccPhase, Transaction, TransactionStatus, TransactionType,
};
pub use participant::IdempotentPhase;
pub use recovery::{RecoveryCommand, RecoveryRunnable};
#[cfg(feature = "redb")]
pub use redb_repository::RedbTransRepository;
pub use repository::TransRepository;
pub use store::{RepositoryCatalog, TransLogStore};

#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// No usable log repository. Fatal at startup.
    #[error("transaction log repository `{name}` is unavailable: {reason}")]
    RepositoryUnavailable { name: String, reason: String },
    /// Another worker holds the participant; the candidate is skipped this round.
    #[error("participant {participant_id} of transaction {trans_id} is locked by another worker")]
    RecoveryConflict { trans_id: String, participant_id: String },
    /// The settled participants contradict the recorded decision. The
    /// transaction is left unfinished for an operator.
    #[error("transaction {trans_id} is {status:?} but participant {participant_id} settled the other way")]
    Inconsistent {
        trans_id: String,
        participant_id: String,
        status: TransactionStatus,
    },
    #[error(transparent)]
    Repository(#[from] anyhow::Error),
}

impl From<TransactionError> for CallError {
    fn from(err: TransactionError) -> Self {
        CallError::Internal {
            message: err.to_string(),
        }
    }
}
