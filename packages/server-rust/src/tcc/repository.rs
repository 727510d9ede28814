//! Persistence backend trait for the transaction log.
//!
//! Every operation is keyed except the two scans, [`list_participants`] for
//! recovery and [`list_transactions`] for purging. Status updates are
//! single-row and forward-only: an implementation applies an update only if
//! the stored status may transition to the requested one, atomically with
//! the check.
//!
//! [`list_participants`]: TransRepository::list_participants
//! [`list_transactions`]: TransRepository::list_transactions

use async_trait::async_trait;

use super::model::{Participant, ParticipantStatus, Transaction, TransactionStatus, TransactionType};

/// Storage for transaction and participant rows.
///
/// Used as `Arc<dyn TransRepository>`.
#[async_trait]
pub trait TransRepository: Send + Sync {
    async fn create_transaction(&self, transaction: &Transaction) -> anyhow::Result<()>;

    async fn find_by_trans_id(&self, trans_id: &str) -> anyhow::Result<Option<Transaction>>;

    /// Returns `false` if the row is missing or the transition is not forward.
    async fn update_transaction_status(
        &self,
        trans_id: &str,
        status: TransactionStatus,
        now: u64,
    ) -> anyhow::Result<bool>;

    async fn remove_transaction(&self, trans_id: &str) -> anyhow::Result<()>;

    async fn create_participant(&self, participant: &Participant) -> anyhow::Result<()>;

    async fn find_participant(&self, trans_id: &str, participant_id: &str) -> anyhow::Result<Option<Participant>>;

    /// Returns `false` if the row is missing or the transition is not forward.
    async fn update_participant_status(
        &self,
        trans_id: &str,
        participant_id: &str,
        status: ParticipantStatus,
        now: u64,
    ) -> anyhow::Result<bool>;

    async fn remove_participant(&self, trans_id: &str, participant_id: &str) -> anyhow::Result<()>;

    /// `Tried` participants of `transaction_type` last updated before
    /// `older_than`, oldest first, at most `limit`.
    async fn list_participants(
        &self,
        older_than: u64,
        transaction_type: TransactionType,
        limit: usize,
    ) -> anyhow::Result<Vec<Participant>>;

    /// Takes the recovery lock on `participant`.
    ///
    /// Succeeds only if the stored row is still `Tried` at the version the
    /// caller read. On success the version is bumped, `lock_owner` and
    /// `updated_at` are set and `retried` is incremented, so at most one of
    /// several concurrent callers holding the same snapshot wins.
    async fn lock_participant(&self, participant: &Participant, owner: &str, now: u64) -> anyhow::Result<bool>;

    /// All participants of one transaction.
    async fn find_participants(&self, trans_id: &str) -> anyhow::Result<Vec<Participant>>;

    /// Transactions in one of `statuses` last updated before `older_than`.
    async fn list_transactions(
        &self,
        older_than: u64,
        statuses: &[TransactionStatus],
        limit: usize,
    ) -> anyhow::Result<Vec<Transaction>>;
}

/// Behaviour every repository must share; run by each implementation's tests.
#[cfg(test)]
pub(crate) mod contract {
    use meridian_core::{Attachments, Value};

    use super::TransRepository;
    use crate::tcc::model::{
        Participant, ParticipantInvocation, ParticipantStatus, Transaction, TransactionStatus, TransactionType,
    };

    pub(crate) fn participant(trans_id: &str, participant_id: &str, now: u64) -> Participant {
        let invocation = ParticipantInvocation {
            try_entry_id: "stock.try".into(),
            confirm_entry_id: "stock.confirm".into(),
            cancel_entry_id: "stock.cancel".into(),
            service_key: Some("v1".into()),
            args: vec![Value::Int(3)],
            attachments: Attachments::new(),
        };
        Participant::tried(trans_id, participant_id, invocation, now)
    }

    pub(crate) async fn keyed_crud(repo: &dyn TransRepository) {
        repo.create_transaction(&Transaction::begin("T1", 100)).await.unwrap();
        repo.create_participant(&participant("T1", "P1", 100)).await.unwrap();
        repo.create_participant(&participant("T1", "P2", 100)).await.unwrap();

        let t = repo.find_by_trans_id("T1").await.unwrap().unwrap();
        assert_eq!(t.status, TransactionStatus::Begin);
        let p = repo.find_participant("T1", "P2").await.unwrap().unwrap();
        assert_eq!(p.invocation.args, vec![Value::Int(3)]);
        assert_eq!(repo.find_participants("T1").await.unwrap().len(), 2);

        repo.remove_participant("T1", "P1").await.unwrap();
        assert!(repo.find_participant("T1", "P1").await.unwrap().is_none());
        repo.remove_transaction("T1").await.unwrap();
        assert!(repo.find_by_trans_id("T1").await.unwrap().is_none());
        assert!(repo.find_by_trans_id("missing").await.unwrap().is_none());
    }

    pub(crate) async fn forward_only_updates(repo: &dyn TransRepository) {
        repo.create_transaction(&Transaction::begin("T2", 0)).await.unwrap();
        repo.create_participant(&participant("T2", "P1", 0)).await.unwrap();

        assert!(repo.update_transaction_status("T2", TransactionStatus::Confirming, 1).await.unwrap());
        assert!(!repo.update_transaction_status("T2", TransactionStatus::Cancelling, 2).await.unwrap());
        assert!(!repo.update_transaction_status("nope", TransactionStatus::Confirming, 2).await.unwrap());

        assert!(repo.update_participant_status("T2", "P1", ParticipantStatus::Confirmed, 3).await.unwrap());
        assert!(!repo.update_participant_status("T2", "P1", ParticipantStatus::Cancelled, 4).await.unwrap());
        // Duplicate acknowledgement.
        assert!(repo.update_participant_status("T2", "P1", ParticipantStatus::Confirmed, 5).await.unwrap());

        let p = repo.find_participant("T2", "P1").await.unwrap().unwrap();
        assert_eq!(p.status, ParticipantStatus::Confirmed);
        assert_eq!(p.updated_at, 5);
    }

    pub(crate) async fn recovery_scan_and_lock(repo: &dyn TransRepository) {
        repo.create_transaction(&Transaction::begin("T3", 0)).await.unwrap();
        repo.create_participant(&participant("T3", "old", 10)).await.unwrap();
        repo.create_participant(&participant("T3", "older", 5)).await.unwrap();
        repo.create_participant(&participant("T3", "fresh", 500)).await.unwrap();
        repo.create_participant(&participant("T3", "done", 1)).await.unwrap();
        repo.update_participant_status("T3", "done", ParticipantStatus::Cancelled, 2)
            .await
            .unwrap();

        let found = repo.list_participants(100, TransactionType::Tcc, 10).await.unwrap();
        let ids: Vec<_> = found.iter().map(|p| p.participant_id.as_str()).collect();
        assert_eq!(ids, vec!["older", "old"]);
        assert_eq!(repo.list_participants(100, TransactionType::Tcc, 1).await.unwrap().len(), 1);

        let snapshot = found[0].clone();
        assert!(repo.lock_participant(&snapshot, "node-a", 200).await.unwrap());
        assert!(!repo.lock_participant(&snapshot, "node-b", 200).await.unwrap());

        let locked = repo.find_participant("T3", "older").await.unwrap().unwrap();
        assert_eq!(locked.lock_owner.as_deref(), Some("node-a"));
        assert_eq!(locked.retried, 1);
        assert_eq!(locked.version, snapshot.version + 1);
        // The lock refreshes `updated_at`, so the next scan skips the row.
        let again = repo.list_participants(100, TransactionType::Tcc, 10).await.unwrap();
        assert_eq!(again.len(), 1);
    }

    pub(crate) async fn transaction_scan(repo: &dyn TransRepository) {
        for (id, status) in [
            ("A", TransactionStatus::Committed),
            ("B", TransactionStatus::Rollbacked),
            ("C", TransactionStatus::Confirming),
        ] {
            repo.create_transaction(&Transaction::begin(id, 0)).await.unwrap();
            let step = if status == TransactionStatus::Rollbacked {
                TransactionStatus::Cancelling
            } else {
                TransactionStatus::Confirming
            };
            repo.update_transaction_status(id, step, 1).await.unwrap();
            repo.update_transaction_status(id, status, 2).await.unwrap();
        }

        let terminal = repo
            .list_transactions(10, &[TransactionStatus::Committed, TransactionStatus::Rollbacked], 10)
            .await
            .unwrap();
        let mut ids: Vec<_> = terminal.into_iter().map(|t| t.trans_id).collect();
        ids.sort();
        assert_eq!(ids, vec!["A", "B"]);
        assert!(repo
            .list_transactions(2, &[TransactionStatus::Committed], 10)
            .await
            .unwrap()
            .is_empty());
    }
}
