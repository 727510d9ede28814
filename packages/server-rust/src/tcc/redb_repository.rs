//! Embedded [`TransRepository`] on a `redb` database file.
//!
//! Rows are `MsgPack`-encoded. Each operation runs on the blocking pool in
//! its own `redb` transaction; read-check-write sequences (status updates,
//! the participant lock) happen inside one write transaction, which `redb`
//! serializes.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::model::{Participant, ParticipantStatus, Transaction, TransactionStatus, TransactionType};
use super::repository::TransRepository;

const TRANSACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("tcc_transactions");
/// Keyed by `{trans_id}/{participant_id}` so one transaction's rows are contiguous.
const PARTICIPANTS: TableDefinition<&str, &[u8]> = TableDefinition::new("tcc_participants");

pub struct RedbTransRepository {
    db: Arc<Database>,
}

impl RedbTransRepository {
    /// Opens (or creates) the database at `path` and its tables.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let db = Database::create(path).with_context(|| format!("opening {}", path.display()))?;
        let init = db.begin_write()?;
        {
            init.open_table(TRANSACTIONS)?;
            init.open_table(PARTICIPANTS)?;
        }
        init.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, op: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .context("redb task panicked")?
    }
}

fn participant_key(trans_id: &str, participant_id: &str) -> String {
    format!("{trans_id}/{participant_id}")
}

fn encode<T: Serialize>(row: &T) -> anyhow::Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(row)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

fn put<T: Serialize>(db: &Database, table: TableDefinition<&str, &[u8]>, key: &str, row: &T) -> anyhow::Result<()> {
    let bytes = encode(row)?;
    let write = db.begin_write()?;
    {
        let mut table = write.open_table(table)?;
        table.insert(key, bytes.as_slice())?;
    }
    write.commit()?;
    Ok(())
}

fn get<T: DeserializeOwned>(db: &Database, table: TableDefinition<&str, &[u8]>, key: &str) -> anyhow::Result<Option<T>> {
    let read = db.begin_read()?;
    let table = read.open_table(table)?;
    let row = table.get(key)?;
    row.map(|guard| decode(guard.value())).transpose()
}

fn delete(db: &Database, table: TableDefinition<&str, &[u8]>, key: &str) -> anyhow::Result<()> {
    let write = db.begin_write()?;
    {
        let mut table = write.open_table(table)?;
        table.remove(key)?;
    }
    write.commit()?;
    Ok(())
}

/// Reads the row at `key`, lets `change` modify it, and writes it back in the
/// same write transaction. `change` returns `false` to leave the row as is.
fn modify<T, F>(db: &Database, table: TableDefinition<&str, &[u8]>, key: &str, change: F) -> anyhow::Result<bool>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce(&mut T) -> bool,
{
    let write = db.begin_write()?;
    let applied = {
        let mut table = write.open_table(table)?;
        let current: Option<T> = {
            let row = table.get(key)?;
            row.map(|guard| decode(guard.value())).transpose()?
        };
        match current {
            Some(mut row) => {
                let changed = change(&mut row);
                if changed {
                    let bytes = encode(&row)?;
                    table.insert(key, bytes.as_slice())?;
                }
                changed
            }
            None => false,
        }
    };
    if applied {
        write.commit()?;
    } else {
        write.abort()?;
    }
    Ok(applied)
}

fn scan<T: DeserializeOwned>(db: &Database, table: TableDefinition<&str, &[u8]>) -> anyhow::Result<Vec<T>> {
    let read = db.begin_read()?;
    let table = read.open_table(table)?;
    let mut rows = Vec::new();
    for entry in table.iter()? {
        let (_, value) = entry?;
        rows.push(decode(value.value())?);
    }
    Ok(rows)
}

#[async_trait]
impl TransRepository for RedbTransRepository {
    async fn create_transaction(&self, transaction: &Transaction) -> anyhow::Result<()> {
        let row = transaction.clone();
        self.blocking(move |db| put(db, TRANSACTIONS, &row.trans_id, &row)).await
    }

    async fn find_by_trans_id(&self, trans_id: &str) -> anyhow::Result<Option<Transaction>> {
        let key = trans_id.to_string();
        self.blocking(move |db| get(db, TRANSACTIONS, &key)).await
    }

    async fn update_transaction_status(
        &self,
        trans_id: &str,
        status: TransactionStatus,
        now: u64,
    ) -> anyhow::Result<bool> {
        let key = trans_id.to_string();
        self.blocking(move |db| {
            modify(db, TRANSACTIONS, &key, |row: &mut Transaction| {
                if !row.status.can_transition_to(status) {
                    return false;
                }
                row.status = status;
                row.updated_at = now;
                true
            })
        })
        .await
    }

    async fn remove_transaction(&self, trans_id: &str) -> anyhow::Result<()> {
        let key = trans_id.to_string();
        self.blocking(move |db| delete(db, TRANSACTIONS, &key)).await
    }

    async fn create_participant(&self, participant: &Participant) -> anyhow::Result<()> {
        let row = participant.clone();
        self.blocking(move |db| {
            put(
                db,
                PARTICIPANTS,
                &participant_key(&row.trans_id, &row.participant_id),
                &row,
            )
        })
        .await
    }

    async fn find_participant(&self, trans_id: &str, participant_id: &str) -> anyhow::Result<Option<Participant>> {
        let key = participant_key(trans_id, participant_id);
        self.blocking(move |db| get(db, PARTICIPANTS, &key)).await
    }

    async fn update_participant_status(
        &self,
        trans_id: &str,
        participant_id: &str,
        status: ParticipantStatus,
        now: u64,
    ) -> anyhow::Result<bool> {
        let key = participant_key(trans_id, participant_id);
        self.blocking(move |db| {
            modify(db, PARTICIPANTS, &key, |row: &mut Participant| {
                if !row.status.can_transition_to(status) {
                    return false;
                }
                row.status = status;
                row.updated_at = now;
                true
            })
        })
        .await
    }

    async fn remove_participant(&self, trans_id: &str, participant_id: &str) -> anyhow::Result<()> {
        let key = participant_key(trans_id, participant_id);
        self.blocking(move |db| delete(db, PARTICIPANTS, &key)).await
    }

    async fn list_participants(
        &self,
        older_than: u64,
        transaction_type: TransactionType,
        limit: usize,
    ) -> anyhow::Result<Vec<Participant>> {
        self.blocking(move |db| {
            let mut found: Vec<Participant> = scan::<Participant>(db, PARTICIPANTS)?
                .into_iter()
                .filter(|p| {
                    p.status == ParticipantStatus::Tried
                        && p.transaction_type == transaction_type
                        && p.updated_at < older_than
                })
                .collect();
            found.sort_by(|a, b| {
                (a.updated_at, &a.trans_id, &a.participant_id).cmp(&(b.updated_at, &b.trans_id, &b.participant_id))
            });
            found.truncate(limit);
            Ok(found)
        })
        .await
    }

    async fn lock_participant(&self, participant: &Participant, owner: &str, now: u64) -> anyhow::Result<bool> {
        let key = participant_key(&participant.trans_id, &participant.participant_id);
        let expected = participant.version;
        let owner = owner.to_string();
        self.blocking(move |db| {
            modify(db, PARTICIPANTS, &key, |row: &mut Participant| {
                if row.status != ParticipantStatus::Tried || row.version != expected {
                    return false;
                }
                row.version += 1;
                row.lock_owner = Some(owner);
                row.retried += 1;
                row.updated_at = now;
                true
            })
        })
        .await
    }

    async fn find_participants(&self, trans_id: &str) -> anyhow::Result<Vec<Participant>> {
        let prefix = format!("{trans_id}/");
        self.blocking(move |db| {
            let read = db.begin_read()?;
            let table = read.open_table(PARTICIPANTS)?;
            let mut rows = Vec::new();
            for entry in table.range(prefix.as_str()..)? {
                let (key, value) = entry?;
                if !key.value().starts_with(&prefix) {
                    break;
                }
                rows.push(decode(value.value())?);
            }
            Ok(rows)
        })
        .await
    }

    async fn list_transactions(
        &self,
        older_than: u64,
        statuses: &[TransactionStatus],
        limit: usize,
    ) -> anyhow::Result<Vec<Transaction>> {
        let statuses = statuses.to_vec();
        self.blocking(move |db| {
            let mut found: Vec<Transaction> = scan::<Transaction>(db, TRANSACTIONS)?
                .into_iter()
                .filter(|t| statuses.contains(&t.status) && t.updated_at < older_than)
                .collect();
            found.sort_by(|a, b| (a.updated_at, &a.trans_id).cmp(&(b.updated_at, &b.trans_id)));
            found.truncate(limit);
            Ok(found)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcc::repository::contract;

    fn open() -> (tempfile::TempDir, RedbTransRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = RedbTransRepository::open(dir.path().join("tcc.redb")).unwrap();
        (dir, repo)
    }

    #[tokio::test]
    async fn keyed_crud() {
        let (_dir, repo) = open();
        contract::keyed_crud(&repo).await;
    }

    #[tokio::test]
    async fn forward_only_updates() {
        let (_dir, repo) = open();
        contract::forward_only_updates(&repo).await;
    }

    #[tokio::test]
    async fn recovery_scan_and_lock() {
        let (_dir, repo) = open();
        contract::recovery_scan_and_lock(&repo).await;
    }

    #[tokio::test]
    async fn transaction_scan() {
        let (_dir, repo) = open();
        contract::transaction_scan(&repo).await;
    }

    #[tokio::test]
    async fn rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tcc.redb");
        {
            let repo = RedbTransRepository::open(&path).unwrap();
            repo.create_transaction(&Transaction::begin("T9", 7)).await.unwrap();
            repo.create_participant(&contract::participant("T9", "P1", 7)).await.unwrap();
        }
        let repo = RedbTransRepository::open(&path).unwrap();
        assert!(repo.find_by_trans_id("T9").await.unwrap().is_some());
        assert_eq!(repo.find_participants("T9").await.unwrap().len(), 1);
        // Prefix scan must not pick up a transaction id that merely shares a prefix.
        repo.create_participant(&contract::participant("T99", "P1", 7)).await.unwrap();
        assert_eq!(repo.find_participants("T9").await.unwrap().len(), 1);
    }
}
