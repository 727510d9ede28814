//! The recovery scan as a [`BackgroundRunnable`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::coordinator::{RecoveryReport, TccCoordinator};
use super::TransactionError;
use crate::service::BackgroundRunnable;

/// On-demand work for the recovery worker.
pub enum RecoveryCommand {
    /// Run a recovery pass now.
    Scan {
        reply: oneshot::Sender<Result<RecoveryReport, TransactionError>>,
    },
    /// Purge finished transactions last updated before `older_than`.
    Purge {
        older_than: u64,
        reply: oneshot::Sender<Result<usize, TransactionError>>,
    },
}

/// Runs a recovery pass on every tick. With deferred cleanup it also purges
/// finished transactions older than the recovery delay.
pub struct RecoveryRunnable {
    coordinator: Arc<TccCoordinator>,
}

impl RecoveryRunnable {
    #[must_use]
    pub fn new(coordinator: Arc<TccCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl BackgroundRunnable for RecoveryRunnable {
    type Task = RecoveryCommand;

    fn name(&self) -> &'static str {
        "tcc-recovery"
    }

    async fn run(&mut self, task: RecoveryCommand) {
        match task {
            RecoveryCommand::Scan { reply } => {
                let report = self.coordinator.recover(self.coordinator.now()).await;
                let _ = reply.send(report);
            }
            RecoveryCommand::Purge { older_than, reply } => {
                let _ = reply.send(self.coordinator.purge(older_than).await);
            }
        }
    }

    async fn on_tick(&mut self) {
        let now = self.coordinator.now();
        if let Err(e) = self.coordinator.recover(now).await {
            tracing::error!(error = %e, "recovery pass failed");
        }
        if !self.coordinator.config().cleanup_immediately {
            let older_than = now.saturating_sub(self.coordinator.config().recover_delay_ms);
            if let Err(e) = self.coordinator.purge(older_than).await {
                tracing::error!(error = %e, "purge failed");
            }
        }
    }
}
