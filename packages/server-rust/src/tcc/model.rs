//! Transaction and participant records persisted by the log store.

use std::fmt;
use std::str::FromStr;

use meridian_core::{Attachments, Value};
use serde::{Deserialize, Serialize};

/// Lifecycle of a transaction.
///
/// `Begin -> Confirming -> Committed` or `Begin -> Cancelling -> Rollbacked`;
/// `Deleted` follows either terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    Begin,
    Confirming,
    Cancelling,
    Committed,
    Rollbacked,
    Deleted,
}

impl TransactionStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionStatus::Committed | TransactionStatus::Rollbacked | TransactionStatus::Deleted
        )
    }

    /// Forward-only transition check. Re-applying the current status is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        use TransactionStatus::{Begin, Cancelling, Committed, Confirming, Deleted, Rollbacked};
        self == next
            || matches!(
                (self, next),
                (Begin, Confirming | Cancelling)
                    | (Confirming, Committed)
                    | (Cancelling, Rollbacked)
                    | (Committed | Rollbacked, Deleted)
            )
    }

    /// The phase participants must settle with once this status is
    /// recorded, `None` before a decision or after deletion.
    #[must_use]
    pub fn decided_phase(self) -> Option<TccPhase> {
        match self {
            TransactionStatus::Confirming | TransactionStatus::Committed => Some(TccPhase::Confirm),
            TransactionStatus::Cancelling | TransactionStatus::Rollbacked => Some(TccPhase::Cancel),
            TransactionStatus::Begin | TransactionStatus::Deleted => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    Tcc,
}

/// Lifecycle of one remote leg: `Tried -> {Confirmed | Cancelled} -> Deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParticipantStatus {
    Tried,
    Confirmed,
    Cancelled,
    Deleted,
}

impl ParticipantStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, ParticipantStatus::Tried)
    }

    /// Forward-only transition check. Re-applying the current status is
    /// allowed so that duplicate confirm/cancel acknowledgements are harmless.
    /// `Tried -> Deleted` covers orphaned legs whose transaction is gone.
    #[must_use]
    pub fn can_transition_to(self, next: ParticipantStatus) -> bool {
        use ParticipantStatus::{Cancelled, Confirmed, Deleted, Tried};
        self == next
            || matches!(
                (self, next),
                (Tried, Confirmed | Cancelled | Deleted) | (Confirmed | Cancelled, Deleted)
            )
    }
}

/// TCC phase, carried in the `tccPhase` attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TccPhase {
    Try,
    Confirm,
    Cancel,
}

impl TccPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TccPhase::Try => "try",
            TccPhase::Confirm => "confirm",
            TccPhase::Cancel => "cancel",
        }
    }

    /// Participant status recorded once this phase is acknowledged.
    #[must_use]
    pub fn settled_status(self) -> Option<ParticipantStatus> {
        match self {
            TccPhase::Try => None,
            TccPhase::Confirm => Some(ParticipantStatus::Confirmed),
            TccPhase::Cancel => Some(ParticipantStatus::Cancelled),
        }
    }
}

impl fmt::Display for TccPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TccPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "try" => Ok(TccPhase::Try),
            "confirm" => Ok(TccPhase::Confirm),
            "cancel" => Ok(TccPhase::Cancel),
            other => Err(format!("unknown tcc phase: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub trans_id: String,
    pub status: TransactionStatus,
    pub transaction_type: TransactionType,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Transaction {
    #[must_use]
    pub fn begin(trans_id: impl Into<String>, now: u64) -> Self {
        Self {
            trans_id: trans_id.into(),
            status: TransactionStatus::Begin,
            transaction_type: TransactionType::Tcc,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Everything needed to re-issue a leg's confirm or cancel call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInvocation {
    pub try_entry_id: String,
    pub confirm_entry_id: String,
    pub cancel_entry_id: String,
    pub service_key: Option<String>,
    pub args: Vec<Value>,
    pub attachments: Attachments,
}

impl ParticipantInvocation {
    #[must_use]
    pub fn entry_for(&self, phase: TccPhase) -> &str {
        match phase {
            TccPhase::Try => &self.try_entry_id,
            TccPhase::Confirm => &self.confirm_entry_id,
            TccPhase::Cancel => &self.cancel_entry_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub trans_id: String,
    pub participant_id: String,
    pub transaction_type: TransactionType,
    pub status: ParticipantStatus,
    pub invocation: ParticipantInvocation,
    /// Bumped by every successful lock; the lock is a compare-and-swap on it.
    pub version: u64,
    pub lock_owner: Option<String>,
    /// Number of recovery attempts so far.
    pub retried: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Participant {
    #[must_use]
    pub fn tried(
        trans_id: impl Into<String>,
        participant_id: impl Into<String>,
        invocation: ParticipantInvocation,
        now: u64,
    ) -> Self {
        Self {
            trans_id: trans_id.into(),
            participant_id: participant_id.into(),
            transaction_type: TransactionType::Tcc,
            status: ParticipantStatus::Tried,
            invocation,
            version: 0,
            lock_owner: None,
            retried: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Deterministic message id of this leg's call in `phase`, reused by retries.
    #[must_use]
    pub fn message_id(&self, phase: TccPhase) -> String {
        format!("{}:{}:{}", self.trans_id, self.participant_id, phase)
    }
}
