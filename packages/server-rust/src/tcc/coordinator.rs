//! TCC coordinator.
//!
//! A transaction is started by [`TccCoordinator::execute`]. Inside it, every
//! remote leg goes through [`TransactionScope::try_leg`], which records the
//! participant as `Tried` before the try call leaves. Once the try logic
//! returns, the coordinator records its decision (`Confirming` or
//! `Cancelling`), sends confirm or cancel to every participant, and finishes
//! the transaction when all of them have settled. Legs that could not be
//! settled stay `Tried` and are picked up by [`TccCoordinator::recover`].

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use meridian_core::{attachment_keys, Attachments, ClockSource, RemoteInvokeMessage, Value};
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::Instrument;

use super::config::TransactionConfig;
use super::model::{
    Participant, ParticipantInvocation, ParticipantStatus, TccPhase, Transaction, TransactionStatus, TransactionType,
};
use super::store::TransLogStore;
use super::TransactionError;
use crate::service::{CallError, ServiceEntry};
use crate::transport::RemoteInvoker;

/// One remote leg: the try entry and the entries that confirm or cancel it.
#[derive(Debug, Clone)]
pub struct TccLeg {
    pub try_entry_id: String,
    pub confirm_entry_id: String,
    pub cancel_entry_id: String,
    pub service_key: Option<String>,
    pub args: Vec<Value>,
}

impl TccLeg {
    #[must_use]
    pub fn new(
        try_entry_id: impl Into<String>,
        confirm_entry_id: impl Into<String>,
        cancel_entry_id: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            try_entry_id: try_entry_id.into(),
            confirm_entry_id: confirm_entry_id.into(),
            cancel_entry_id: cancel_entry_id.into(),
            service_key: None,
            args,
        }
    }

    /// Leg for a registered TCC try entry. `None` if the entry declares no
    /// confirm/cancel methods.
    #[must_use]
    pub fn for_entry(entry: &ServiceEntry, args: Vec<Value>) -> Option<Self> {
        let tcc = entry.tcc.as_ref()?;
        Some(Self::new(
            entry.id.clone(),
            tcc.confirm_entry_id.clone(),
            tcc.cancel_entry_id.clone(),
            args,
        ))
    }

    #[must_use]
    pub fn with_service_key(mut self, service_key: impl Into<String>) -> Self {
        self.service_key = Some(service_key.into());
        self
    }
}

/// Counts from one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub confirmed: usize,
    pub cancelled: usize,
    /// Dispatches that failed again; retried on a later pass.
    pub failed: usize,
    /// Candidates locked by another worker.
    pub conflicts: usize,
    /// Candidates past `max_recovery_attempts`, left `Tried`.
    pub abandoned: usize,
    /// Participants whose transaction no longer exists.
    pub orphans: usize,
    /// Transactions brought to a terminal status.
    pub finalized: usize,
    pub errors: usize,
}

/// What recovery did with one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveredLeg {
    Settled(TccPhase),
    Failed,
    Abandoned,
    Orphaned,
}

/// Handle given to the try logic of one transaction. Cheap to clone, so
/// legs may be tried concurrently.
#[derive(Clone)]
pub struct TransactionScope {
    trans_id: String,
    attachments: Attachments,
    store: Arc<TransLogStore>,
    invoker: RemoteInvoker,
    clock: Arc<dyn ClockSource>,
    began: Arc<OnceCell<()>>,
    participants: Arc<Mutex<Vec<Participant>>>,
}

impl TransactionScope {
    #[must_use]
    pub fn trans_id(&self) -> &str {
        &self.trans_id
    }

    /// Enlists `leg` and issues its try call.
    ///
    /// The transaction row is created by the first leg; the participant row
    /// is written before the try call, so a crash after the call still
    /// leaves a record for recovery to cancel.
    ///
    /// # Errors
    ///
    /// Returns the try call's error, or [`CallError::Internal`] if the log
    /// store could not record the leg.
    pub async fn try_leg(&self, leg: TccLeg) -> Result<Value, CallError> {
        self.began
            .get_or_try_init(|| async {
                let transaction = Transaction::begin(self.trans_id.clone(), self.clock.now());
                self.store.create_transaction(&transaction).await?;
                tracing::debug!(trans_id = %self.trans_id, "transaction begun");
                Ok::<(), TransactionError>(())
            })
            .await?;

        let invocation = ParticipantInvocation {
            try_entry_id: leg.try_entry_id,
            confirm_entry_id: leg.confirm_entry_id,
            cancel_entry_id: leg.cancel_entry_id,
            service_key: leg.service_key,
            args: leg.args,
            attachments: self.attachments.clone(),
        };
        let participant = Participant::tried(
            self.trans_id.clone(),
            uuid::Uuid::new_v4().to_string(),
            invocation,
            self.clock.now(),
        );
        self.store.create_participant(&participant).await?;
        self.participants.lock().push(participant.clone());

        self.invoker
            .invoke_with_id(
                phase_message(&participant, TccPhase::Try),
                &participant.message_id(TccPhase::Try),
                None,
            )
            .await
    }

    fn began(&self) -> bool {
        self.began.initialized()
    }
}

/// Builds the invocation of `participant`'s entry for `phase`, tagged with
/// the transaction attachments.
fn phase_message(participant: &Participant, phase: TccPhase) -> RemoteInvokeMessage {
    let invocation = &participant.invocation;
    let mut message = RemoteInvokeMessage::new(invocation.entry_for(phase), invocation.args.clone());
    message.service_key.clone_from(&invocation.service_key);
    message.attachments.clone_from(&invocation.attachments);
    message
        .with_attachment(attachment_keys::TRANS_ID, participant.trans_id.clone())
        .with_attachment(attachment_keys::PARTICIPANT_ID, participant.participant_id.clone())
        .with_attachment(attachment_keys::TCC_PHASE, phase.as_str())
}

pub struct TccCoordinator {
    store: Arc<TransLogStore>,
    invoker: RemoteInvoker,
    clock: Arc<dyn ClockSource>,
    config: TransactionConfig,
    /// Lock owner recorded on participants this coordinator recovers.
    node_id: String,
}

impl TccCoordinator {
    #[must_use]
    pub fn new(
        store: Arc<TransLogStore>,
        invoker: RemoteInvoker,
        clock: Arc<dyn ClockSource>,
        config: TransactionConfig,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            invoker,
            clock,
            config,
            node_id: node_id.into(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<TransLogStore> {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    #[must_use]
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Runs `body` as the try phase of a new transaction and settles it.
    ///
    /// `attachments` travel with every leg's try, confirm and cancel calls.
    /// The try result is returned as is; confirm/cancel failures are logged
    /// and left to recovery. If recovery already cancelled the transaction
    /// while the try logic was still running, a successful try is reported
    /// as [`CallError::Internal`].
    ///
    /// # Errors
    ///
    /// Returns the error of `body`.
    pub async fn execute<T, F, Fut>(&self, attachments: Attachments, body: F) -> Result<T, CallError>
    where
        F: FnOnce(TransactionScope) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let scope = TransactionScope {
            trans_id: uuid::Uuid::new_v4().to_string(),
            attachments,
            store: self.store.clone(),
            invoker: self.invoker.clone(),
            clock: self.clock.clone(),
            began: Arc::new(OnceCell::new()),
            participants: Arc::new(Mutex::new(Vec::new())),
        };
        let trans_id = scope.trans_id.clone();
        let span = tracing::info_span!("tcc", trans_id = %trans_id);

        let result = body(scope.clone()).instrument(span.clone()).await;
        if !scope.began() {
            return result;
        }
        let participants = std::mem::take(&mut *scope.participants.lock());

        async {
            let wanted = if result.is_ok() { TccPhase::Confirm } else { TccPhase::Cancel };
            let phase = self.decide(&trans_id, wanted).await;
            let settled = self.dispatch_all(&participants, phase).await;
            tracing::info!(?phase, participants = participants.len(), settled, "transaction decided");
            if let Err(e) = self.finalize(&trans_id).await {
                tracing::error!(error = %e, "finalizing transaction failed");
            }

            match (result, phase) {
                (Ok(_), TccPhase::Cancel) => Err(CallError::internal(format!(
                    "transaction {trans_id} was cancelled by recovery"
                ))),
                (result, _) => result,
            }
        }
        .instrument(span)
        .await
    }

    /// Records the decision and returns the phase to dispatch, which is the
    /// stored decision if another worker decided first.
    async fn decide(&self, trans_id: &str, wanted: TccPhase) -> TccPhase {
        let status = match wanted {
            TccPhase::Confirm => TransactionStatus::Confirming,
            _ => TransactionStatus::Cancelling,
        };
        match self.store.update_transaction_status(trans_id, status, self.now()).await {
            Ok(true) => wanted,
            Ok(false) => match self.store.load_transaction(trans_id).await {
                Ok(Some(t)) => t.status.decided_phase().unwrap_or(wanted),
                _ => wanted,
            },
            Err(e) => {
                tracing::error!(trans_id, error = %e, "recording decision failed");
                wanted
            }
        }
    }

    async fn dispatch_all(&self, participants: &[Participant], phase: TccPhase) -> usize {
        stream::iter(participants)
            .map(|p| self.apply_phase(p, phase))
            .buffer_unordered(self.config.dispatch_concurrency.max(1))
            .filter(|settled| std::future::ready(*settled))
            .count()
            .await
    }

    /// Sends `phase` to one participant and records the acknowledgement.
    /// Returns whether the participant settled.
    async fn apply_phase(&self, participant: &Participant, phase: TccPhase) -> bool {
        let Some(settled) = phase.settled_status() else {
            return false;
        };
        let timeout = Duration::from_millis(self.config.phase_timeout_ms);
        let outcome = self
            .invoker
            .invoke_with_id(phase_message(participant, phase), &participant.message_id(phase), Some(timeout))
            .await;
        if let Err(e) = outcome {
            tracing::warn!(
                trans_id = %participant.trans_id,
                participant_id = %participant.participant_id,
                %phase,
                error = %e,
                "phase dispatch failed, leaving participant for recovery"
            );
            return false;
        }
        match self.store.update_participant_status(participant, settled, self.now()).await {
            Ok(applied) => applied,
            Err(e) => {
                tracing::error!(participant_id = %participant.participant_id, error = %e, "recording phase outcome failed");
                false
            }
        }
    }

    /// Moves the transaction to its terminal status once every participant
    /// has settled, then cleans it up if configured to.
    ///
    /// Returns the terminal status, or `None` while participants are pending
    /// or the transaction is gone.
    ///
    /// # Errors
    ///
    /// Returns a repository failure, or [`TransactionError::Inconsistent`]
    /// when a participant settled against the recorded decision.
    pub async fn finalize(&self, trans_id: &str) -> Result<Option<TransactionStatus>, TransactionError> {
        let Some(transaction) = self.store.load_transaction(trans_id).await? else {
            return Ok(None);
        };
        if transaction.status.is_terminal() {
            return Ok(Some(transaction.status));
        }
        let participants = self.store.participants_of(trans_id).await?;
        if participants.iter().any(|p| !p.status.is_terminal()) {
            return Ok(None);
        }

        let now = self.now();
        let terminal = match transaction.status {
            TransactionStatus::Confirming => TransactionStatus::Committed,
            _ => TransactionStatus::Rollbacked,
        };
        let contrary = match terminal {
            TransactionStatus::Committed => ParticipantStatus::Cancelled,
            _ => ParticipantStatus::Confirmed,
        };
        if let Some(p) = participants.iter().find(|p| p.status == contrary) {
            tracing::error!(
                trans_id,
                participant_id = %p.participant_id,
                status = ?transaction.status,
                "participants settled against the recorded decision, leaving transaction unfinished"
            );
            metrics::counter!("meridian_tcc_inconsistent_total").increment(1);
            return Err(TransactionError::Inconsistent {
                trans_id: trans_id.to_string(),
                participant_id: p.participant_id.clone(),
                status: transaction.status,
            });
        }
        if transaction.status == TransactionStatus::Begin {
            self.store
                .update_transaction_status(trans_id, TransactionStatus::Cancelling, now)
                .await?;
        }
        if !self.store.update_transaction_status(trans_id, terminal, now).await? {
            return Ok(None);
        }
        tracing::info!(trans_id, status = ?terminal, "transaction finished");
        metrics::counter!("meridian_tcc_transactions_total", "status" => format!("{terminal:?}")).increment(1);

        if self.config.cleanup_immediately {
            for p in &participants {
                self.store.remove_participant(p, now).await?;
            }
            self.store.remove_transaction(trans_id, now).await?;
        }
        Ok(Some(terminal))
    }

    /// One recovery pass at time `now`.
    ///
    /// Re-dispatches `Tried` participants older than `recover_delay_ms`,
    /// then finalizes every transaction it touched and every stale
    /// undecided or unfinished one.
    ///
    /// # Errors
    ///
    /// Returns a repository failure of the initial scans. Failures on
    /// individual participants are counted in the report.
    pub async fn recover(&self, now: u64) -> Result<RecoveryReport, TransactionError> {
        let threshold = now.saturating_sub(self.config.recover_delay_ms);
        let candidates = self
            .store
            .list_participants(threshold, TransactionType::Tcc, self.config.scan_limit)
            .await?;
        let mut report = RecoveryReport {
            scanned: candidates.len(),
            ..RecoveryReport::default()
        };
        let mut touched = BTreeSet::new();

        let outcomes: Vec<_> = stream::iter(candidates)
            .map(|p| async move {
                let trans_id = p.trans_id.clone();
                (trans_id, self.recover_participant(p, now).await)
            })
            .buffer_unordered(self.config.dispatch_concurrency.max(1))
            .collect()
            .await;
        for (trans_id, outcome) in outcomes {
            match outcome {
                Ok(RecoveredLeg::Settled(TccPhase::Confirm)) => report.confirmed += 1,
                Ok(RecoveredLeg::Settled(_)) => report.cancelled += 1,
                Ok(RecoveredLeg::Failed) => report.failed += 1,
                Ok(RecoveredLeg::Abandoned) => report.abandoned += 1,
                Ok(RecoveredLeg::Orphaned) => report.orphans += 1,
                Err(TransactionError::RecoveryConflict { .. }) => report.conflicts += 1,
                Err(e) => {
                    tracing::error!(trans_id = %trans_id, error = %e, "recovering participant failed");
                    report.errors += 1;
                }
            }
            touched.insert(trans_id);
        }

        let stale = self
            .store
            .list_transactions(
                threshold,
                &[
                    TransactionStatus::Begin,
                    TransactionStatus::Confirming,
                    TransactionStatus::Cancelling,
                ],
                self.config.scan_limit,
            )
            .await?;
        touched.extend(stale.into_iter().map(|t| t.trans_id));

        for trans_id in touched {
            match self.finalize(&trans_id).await {
                Ok(Some(_)) => report.finalized += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(trans_id = %trans_id, error = %e, "finalizing recovered transaction failed");
                    report.errors += 1;
                }
            }
        }

        if report != RecoveryReport::default() {
            tracing::info!(?report, "recovery pass finished");
        }
        Ok(report)
    }

    /// Locks and re-dispatches one `Tried` participant.
    ///
    /// The phase follows the owning transaction: `Begin` (the starter is
    /// presumed dead and the transaction is cancelled), `Cancelling` and
    /// `Rollbacked` cancel, `Confirming` and `Committed` confirm. A
    /// participant without a live transaction is removed.
    ///
    /// # Errors
    ///
    /// [`TransactionError::RecoveryConflict`] if another worker holds the
    /// participant; no call is made in that case.
    pub async fn recover_participant(&self, participant: Participant, now: u64) -> Result<RecoveredLeg, TransactionError> {
        if participant.retried >= self.config.max_recovery_attempts {
            tracing::warn!(
                trans_id = %participant.trans_id,
                participant_id = %participant.participant_id,
                attempts = participant.retried,
                "participant abandoned after repeated recovery failures"
            );
            metrics::counter!("meridian_tcc_recovery_abandoned_total").increment(1);
            return Ok(RecoveredLeg::Abandoned);
        }
        if !self.store.lock_participant(&participant, &self.node_id, now).await? {
            return Err(TransactionError::RecoveryConflict {
                trans_id: participant.trans_id,
                participant_id: participant.participant_id,
            });
        }

        let status = self
            .store
            .load_transaction(&participant.trans_id)
            .await?
            .map(|t| t.status);
        let phase = match status {
            None | Some(TransactionStatus::Deleted) => {
                self.store.remove_participant(&participant, now).await?;
                tracing::info!(
                    trans_id = %participant.trans_id,
                    participant_id = %participant.participant_id,
                    "removed orphaned participant"
                );
                return Ok(RecoveredLeg::Orphaned);
            }
            Some(TransactionStatus::Begin) => {
                if self
                    .store
                    .update_transaction_status(&participant.trans_id, TransactionStatus::Cancelling, now)
                    .await?
                {
                    TccPhase::Cancel
                } else {
                    // The starter decided after our read; follow its decision.
                    let decided = self
                        .store
                        .load_transaction(&participant.trans_id)
                        .await?
                        .and_then(|t| t.status.decided_phase());
                    let Some(phase) = decided else {
                        return Ok(RecoveredLeg::Failed);
                    };
                    tracing::info!(
                        trans_id = %participant.trans_id,
                        participant_id = %participant.participant_id,
                        %phase,
                        "transaction decided during recovery, adopting its decision"
                    );
                    phase
                }
            }
            Some(TransactionStatus::Cancelling | TransactionStatus::Rollbacked) => TccPhase::Cancel,
            Some(TransactionStatus::Confirming | TransactionStatus::Committed) => TccPhase::Confirm,
        };

        if self.apply_phase(&participant, phase).await {
            Ok(RecoveredLeg::Settled(phase))
        } else {
            Ok(RecoveredLeg::Failed)
        }
    }

    /// Removes terminal transactions last updated before `older_than`,
    /// with their participants. Needed when cleanup is deferred or rows are
    /// only marked `Deleted`. Returns the number of transactions removed.
    ///
    /// # Errors
    ///
    /// Returns a repository failure.
    pub async fn purge(&self, older_than: u64) -> Result<usize, TransactionError> {
        let terminal = self
            .store
            .list_transactions(
                older_than,
                &[
                    TransactionStatus::Committed,
                    TransactionStatus::Rollbacked,
                    TransactionStatus::Deleted,
                ],
                self.config.scan_limit,
            )
            .await?;
        for transaction in &terminal {
            self.store.purge_transaction(&transaction.trans_id).await?;
        }
        if !terminal.is_empty() {
            tracing::info!(purged = terminal.len(), "purged finished transactions");
        }
        Ok(terminal.len())
    }
}
