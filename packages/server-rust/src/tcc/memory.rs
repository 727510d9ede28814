//! In-process [`TransRepository`] backed by `DashMap`.
//!
//! Row updates run under the shard lock of `get_mut`, which makes the
//! forward-only check and the lock's version compare-and-swap atomic per row.

use async_trait::async_trait;
use dashmap::DashMap;

use super::model::{Participant, ParticipantStatus, Transaction, TransactionStatus, TransactionType};
use super::repository::TransRepository;

type ParticipantKey = (String, String);

#[derive(Debug, Default)]
pub struct InMemoryTransRepository {
    transactions: DashMap<String, Transaction>,
    participants: DashMap<ParticipantKey, Participant>,
}

impl InMemoryTransRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(trans_id: &str, participant_id: &str) -> ParticipantKey {
    (trans_id.to_string(), participant_id.to_string())
}

#[async_trait]
impl TransRepository for InMemoryTransRepository {
    async fn create_transaction(&self, transaction: &Transaction) -> anyhow::Result<()> {
        self.transactions
            .insert(transaction.trans_id.clone(), transaction.clone());
        Ok(())
    }

    async fn find_by_trans_id(&self, trans_id: &str) -> anyhow::Result<Option<Transaction>> {
        Ok(self.transactions.get(trans_id).map(|t| t.clone()))
    }

    async fn update_transaction_status(
        &self,
        trans_id: &str,
        status: TransactionStatus,
        now: u64,
    ) -> anyhow::Result<bool> {
        let Some(mut row) = self.transactions.get_mut(trans_id) else {
            return Ok(false);
        };
        if !row.status.can_transition_to(status) {
            return Ok(false);
        }
        row.status = status;
        row.updated_at = now;
        Ok(true)
    }

    async fn remove_transaction(&self, trans_id: &str) -> anyhow::Result<()> {
        self.transactions.remove(trans_id);
        Ok(())
    }

    async fn create_participant(&self, participant: &Participant) -> anyhow::Result<()> {
        self.participants.insert(
            key(&participant.trans_id, &participant.participant_id),
            participant.clone(),
        );
        Ok(())
    }

    async fn find_participant(&self, trans_id: &str, participant_id: &str) -> anyhow::Result<Option<Participant>> {
        Ok(self
            .participants
            .get(&key(trans_id, participant_id))
            .map(|p| p.clone()))
    }

    async fn update_participant_status(
        &self,
        trans_id: &str,
        participant_id: &str,
        status: ParticipantStatus,
        now: u64,
    ) -> anyhow::Result<bool> {
        let Some(mut row) = self.participants.get_mut(&key(trans_id, participant_id)) else {
            return Ok(false);
        };
        if !row.status.can_transition_to(status) {
            return Ok(false);
        }
        row.status = status;
        row.updated_at = now;
        Ok(true)
    }

    async fn remove_participant(&self, trans_id: &str, participant_id: &str) -> anyhow::Result<()> {
        self.participants.remove(&key(trans_id, participant_id));
        Ok(())
    }

    async fn list_participants(
        &self,
        older_than: u64,
        transaction_type: TransactionType,
        limit: usize,
    ) -> anyhow::Result<Vec<Participant>> {
        let mut found: Vec<Participant> = self
            .participants
            .iter()
            .filter(|p| {
                p.status == ParticipantStatus::Tried
                    && p.transaction_type == transaction_type
                    && p.updated_at < older_than
            })
            .map(|p| p.clone())
            .collect();
        found.sort_by(|a, b| {
            (a.updated_at, &a.trans_id, &a.participant_id).cmp(&(b.updated_at, &b.trans_id, &b.participant_id))
        });
        found.truncate(limit);
        Ok(found)
    }

    async fn lock_participant(&self, participant: &Participant, owner: &str, now: u64) -> anyhow::Result<bool> {
        let Some(mut row) = self
            .participants
            .get_mut(&key(&participant.trans_id, &participant.participant_id))
        else {
            return Ok(false);
        };
        if row.status != ParticipantStatus::Tried || row.version != participant.version {
            return Ok(false);
        }
        row.version += 1;
        row.lock_owner = Some(owner.to_string());
        row.retried += 1;
        row.updated_at = now;
        Ok(true)
    }

    async fn find_participants(&self, trans_id: &str) -> anyhow::Result<Vec<Participant>> {
        Ok(self
            .participants
            .iter()
            .filter(|p| p.trans_id == trans_id)
            .map(|p| p.clone())
            .collect())
    }

    async fn list_transactions(
        &self,
        older_than: u64,
        statuses: &[TransactionStatus],
        limit: usize,
    ) -> anyhow::Result<Vec<Transaction>> {
        let mut found: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|t| statuses.contains(&t.status) && t.updated_at < older_than)
            .map(|t| t.clone())
            .collect();
        found.sort_by(|a, b| (a.updated_at, &a.trans_id).cmp(&(b.updated_at, &b.trans_id)));
        found.truncate(limit);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::tcc::repository::contract;

    #[tokio::test]
    async fn keyed_crud() {
        contract::keyed_crud(&InMemoryTransRepository::new()).await;
    }

    #[tokio::test]
    async fn forward_only_updates() {
        contract::forward_only_updates(&InMemoryTransRepository::new()).await;
    }

    #[tokio::test]
    async fn recovery_scan_and_lock() {
        contract::recovery_scan_and_lock(&InMemoryTransRepository::new()).await;
    }

    #[tokio::test]
    async fn transaction_scan() {
        contract::transaction_scan(&InMemoryTransRepository::new()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_lockers_have_one_winner() {
        let repo = Arc::new(InMemoryTransRepository::new());
        let participant = contract::participant("T", "P", 0);
        repo.create_participant(&participant).await.unwrap();

        let attempts: Vec<_> = (0..16)
            .map(|i| {
                let repo = repo.clone();
                let snapshot = participant.clone();
                tokio::spawn(async move { repo.lock_participant(&snapshot, &format!("node-{i}"), 1).await.unwrap() })
            })
            .collect();
        let mut winners = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
