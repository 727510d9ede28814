//! The transaction log store handed to the coordinator.
//!
//! [`TransLogStore`] wraps one [`TransRepository`] and applies the removal
//! policy: with `phy_deleted` rows are deleted, otherwise they are marked
//! `Deleted` and kept. Repositories are looked up by name in a
//! [`RepositoryCatalog`] when the process starts.

use std::collections::HashMap;
use std::sync::Arc;

use super::config::{TransactionConfig, MEMORY_REPOSITORY};
use super::memory::InMemoryTransRepository;
use super::model::{Participant, ParticipantStatus, Transaction, TransactionStatus, TransactionType};
use super::repository::TransRepository;
use super::TransactionError;

type RepositoryFactory = Box<dyn Fn(&TransactionConfig) -> anyhow::Result<Arc<dyn TransRepository>> + Send + Sync>;

/// Named repository constructors.
#[derive(Default)]
pub struct RepositoryCatalog {
    factories: HashMap<String, RepositoryFactory>,
}

impl RepositoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the repositories compiled into this crate.
    #[must_use]
    pub fn builtin() -> Self {
        let catalog = Self::new().register(MEMORY_REPOSITORY, |_| {
            Ok(Arc::new(InMemoryTransRepository::new()) as Arc<dyn TransRepository>)
        });
        #[cfg(feature = "redb")]
        let catalog = catalog.register(super::config::REDB_REPOSITORY, |config| {
            let repo = super::redb_repository::RedbTransRepository::open(&config.redb_path)?;
            Ok(Arc::new(repo) as Arc<dyn TransRepository>)
        });
        catalog
    }

    #[must_use]
    pub fn register<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&TransactionConfig) -> anyhow::Result<Arc<dyn TransRepository>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
        self
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

pub struct TransLogStore {
    repo: Arc<dyn TransRepository>,
    phy_deleted: bool,
}

impl TransLogStore {
    #[must_use]
    pub fn new(repo: Arc<dyn TransRepository>, phy_deleted: bool) -> Self {
        Self { repo, phy_deleted }
    }

    /// Builds the store from the repository named in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::RepositoryUnavailable`] when the name is
    /// not in the catalog or its constructor fails. Callers treat this as
    /// fatal at startup.
    pub fn open(config: &TransactionConfig, catalog: &RepositoryCatalog) -> Result<Self, TransactionError> {
        let factory = catalog
            .factories
            .get(&config.repository)
            .ok_or_else(|| TransactionError::RepositoryUnavailable {
                name: config.repository.clone(),
                reason: "no repository registered under this name".to_string(),
            })?;
        let repo = factory(config).map_err(|e| TransactionError::RepositoryUnavailable {
            name: config.repository.clone(),
            reason: format!("{e:#}"),
        })?;
        tracing::info!(repository = %config.repository, phy_deleted = config.phy_deleted, "transaction log store opened");
        Ok(Self::new(repo, config.phy_deleted))
    }

    #[must_use]
    pub fn phy_deleted(&self) -> bool {
        self.phy_deleted
    }

    pub async fn create_transaction(&self, transaction: &Transaction) -> Result<(), TransactionError> {
        Ok(self.repo.create_transaction(transaction).await?)
    }

    pub async fn load_transaction(&self, trans_id: &str) -> Result<Option<Transaction>, TransactionError> {
        Ok(self.repo.find_by_trans_id(trans_id).await?)
    }

    /// Returns `false` when the update was not applied.
    pub async fn update_transaction_status(
        &self,
        trans_id: &str,
        status: TransactionStatus,
        now: u64,
    ) -> Result<bool, TransactionError> {
        let applied = self.repo.update_transaction_status(trans_id, status, now).await?;
        if !applied {
            tracing::debug!(trans_id, ?status, "transaction status update not applied");
        }
        Ok(applied)
    }

    /// Removes the transaction row, or marks it `Deleted`.
    pub async fn remove_transaction(&self, trans_id: &str, now: u64) -> Result<(), TransactionError> {
        if self.phy_deleted {
            self.repo.remove_transaction(trans_id).await?;
        } else {
            self.repo
                .update_transaction_status(trans_id, TransactionStatus::Deleted, now)
                .await?;
        }
        Ok(())
    }

    pub async fn create_participant(&self, participant: &Participant) -> Result<(), TransactionError> {
        Ok(self.repo.create_participant(participant).await?)
    }

    pub async fn load_participant(
        &self,
        trans_id: &str,
        participant_id: &str,
    ) -> Result<Option<Participant>, TransactionError> {
        Ok(self.repo.find_participant(trans_id, participant_id).await?)
    }

    pub async fn participants_of(&self, trans_id: &str) -> Result<Vec<Participant>, TransactionError> {
        Ok(self.repo.find_participants(trans_id).await?)
    }

    /// Returns `false` when the row is gone or the transition would go backward.
    pub async fn update_participant_status(
        &self,
        participant: &Participant,
        status: ParticipantStatus,
        now: u64,
    ) -> Result<bool, TransactionError> {
        let applied = self
            .repo
            .update_participant_status(&participant.trans_id, &participant.participant_id, status, now)
            .await?;
        if !applied {
            tracing::warn!(
                trans_id = %participant.trans_id,
                participant_id = %participant.participant_id,
                ?status,
                "participant status update rejected"
            );
        }
        Ok(applied)
    }

    /// Removes the participant row, or marks it `Deleted`.
    pub async fn remove_participant(&self, participant: &Participant, now: u64) -> Result<(), TransactionError> {
        if self.phy_deleted {
            self.repo
                .remove_participant(&participant.trans_id, &participant.participant_id)
                .await?;
        } else {
            self.repo
                .update_participant_status(
                    &participant.trans_id,
                    &participant.participant_id,
                    ParticipantStatus::Deleted,
                    now,
                )
                .await?;
        }
        Ok(())
    }

    pub async fn list_participants(
        &self,
        older_than: u64,
        transaction_type: TransactionType,
        limit: usize,
    ) -> Result<Vec<Participant>, TransactionError> {
        Ok(self
            .repo
            .list_participants(older_than, transaction_type, limit)
            .await?)
    }

    /// Takes the recovery lock on `participant` for `owner`.
    pub async fn lock_participant(
        &self,
        participant: &Participant,
        owner: &str,
        now: u64,
    ) -> Result<bool, TransactionError> {
        Ok(self.repo.lock_participant(participant, owner, now).await?)
    }

    pub async fn list_transactions(
        &self,
        older_than: u64,
        statuses: &[TransactionStatus],
        limit: usize,
    ) -> Result<Vec<Transaction>, TransactionError> {
        Ok(self.repo.list_transactions(older_than, statuses, limit).await?)
    }

    /// Deletes a transaction and all of its participants regardless of
    /// `phy_deleted`. Used to purge rows kept after soft deletion.
    pub async fn purge_transaction(&self, trans_id: &str) -> Result<usize, TransactionError> {
        let participants = self.repo.find_participants(trans_id).await?;
        for p in &participants {
            self.repo.remove_participant(&p.trans_id, &p.participant_id).await?;
        }
        self.repo.remove_transaction(trans_id).await?;
        Ok(participants.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcc::repository::contract::participant;

    fn memory_store(phy_deleted: bool) -> TransLogStore {
        TransLogStore::new(Arc::new(InMemoryTransRepository::new()), phy_deleted)
    }

    #[test]
    fn unknown_repository_is_unavailable() {
        let config = TransactionConfig {
            repository: "zookeeper".into(),
            ..TransactionConfig::default()
        };
        let err = TransLogStore::open(&config, &RepositoryCatalog::builtin()).err().unwrap();
        assert!(matches!(err, TransactionError::RepositoryUnavailable { ref name, .. } if name == "zookeeper"));
    }

    #[test]
    fn failing_factory_is_unavailable() {
        let catalog = RepositoryCatalog::new().register("broken", |_| anyhow::bail!("disk full"));
        let config = TransactionConfig {
            repository: "broken".into(),
            ..TransactionConfig::default()
        };
        let err = TransLogStore::open(&config, &catalog).err().unwrap();
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn builtin_catalog_has_memory_repository() {
        let catalog = RepositoryCatalog::builtin();
        assert!(catalog.contains(MEMORY_REPOSITORY));
        assert!(TransLogStore::open(&TransactionConfig::default(), &catalog).is_ok());
    }

    #[tokio::test]
    async fn soft_delete_keeps_rows_marked_deleted() {
        let store = memory_store(false);
        store.create_transaction(&Transaction::begin("T", 0)).await.unwrap();
        let p = participant("T", "P", 0);
        store.create_participant(&p).await.unwrap();
        store
            .update_participant_status(&p, ParticipantStatus::Confirmed, 1)
            .await
            .unwrap();
        store
            .update_transaction_status("T", TransactionStatus::Confirming, 1)
            .await
            .unwrap();
        store
            .update_transaction_status("T", TransactionStatus::Committed, 2)
            .await
            .unwrap();

        store.remove_participant(&p, 3).await.unwrap();
        store.remove_transaction("T", 3).await.unwrap();

        let p = store.load_participant("T", "P").await.unwrap().unwrap();
        assert_eq!(p.status, ParticipantStatus::Deleted);
        let t = store.load_transaction("T").await.unwrap().unwrap();
        assert_eq!(t.status, TransactionStatus::Deleted);

        assert_eq!(store.purge_transaction("T").await.unwrap(), 1);
        assert!(store.load_transaction("T").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn physical_delete_removes_rows() {
        let store = memory_store(true);
        store.create_transaction(&Transaction::begin("T", 0)).await.unwrap();
        let p = participant("T", "P", 0);
        store.create_participant(&p).await.unwrap();

        store.remove_participant(&p, 1).await.unwrap();
        store.remove_transaction("T", 1).await.unwrap();
        assert!(store.load_participant("T", "P").await.unwrap().is_none());
        assert!(store.load_transaction("T").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn backward_participant_update_is_rejected() {
        let store = memory_store(true);
        let p = participant("T", "P", 0);
        store.create_participant(&p).await.unwrap();
        assert!(store
            .update_participant_status(&p, ParticipantStatus::Cancelled, 1)
            .await
            .unwrap());
        assert!(!store
            .update_participant_status(&p, ParticipantStatus::Confirmed, 2)
            .await
            .unwrap());
    }
}
