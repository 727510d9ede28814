//! Background worker for periodic and on-demand tasks.
//!
//! A [`BackgroundWorker`] owns one [`BackgroundRunnable`] on a dedicated tokio
//! task. Tasks submitted through the handle and periodic ticks are handled
//! strictly one at a time, so a runnable never races with itself.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

/// Channel capacity for submitted tasks.
const TASK_QUEUE_CAPACITY: usize = 64;

/// Work executed by a [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    /// Short name used in log fields.
    fn name(&self) -> &'static str;

    /// Handles one submitted task.
    async fn run(&mut self, task: Self::Task);

    /// Called on every tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once after the loop exits. Default is a no-op.
    async fn shutdown(&mut self) {}
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker {0} is stopped")]
    Stopped(&'static str),
}

/// Handle to a running background loop.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    name: &'static str,
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the loop. The first tick fires one full `tick_interval` after start.
    pub fn start(mut runnable: R, tick_interval: Duration) -> Self {
        let name = runnable.name();
        let (tx, mut rx) = mpsc::channel::<R::Task>(TASK_QUEUE_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(tick_interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticks.tick().await;
            tracing::debug!(worker = name, interval_ms = tick_interval.as_millis(), "worker started");

            loop {
                tokio::select! {
                    task = rx.recv() => match task {
                        Some(task) => runnable.run(task).await,
                        None => break,
                    },
                    _ = ticks.tick() => runnable.on_tick().await,
                    _ = &mut shutdown_rx => break,
                }
            }

            runnable.shutdown().await;
            tracing::debug!(worker = name, "worker stopped");
        });

        Self {
            name,
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Queues a task for the runnable.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Stopped`] once the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> Result<(), WorkerError> {
        let tx = self.tx.as_ref().ok_or(WorkerError::Stopped(self.name))?;
        tx.send(task).await.map_err(|_| WorkerError::Stopped(self.name))
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signals the loop to exit and waits for `shutdown` to complete.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(worker = self.name, %err, "worker task ended abnormally");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Default, Clone)]
    struct Counters {
        runs: Arc<AtomicU32>,
        ticks: Arc<AtomicU32>,
        shutdowns: Arc<AtomicU32>,
    }

    struct Recorder(Counters);

    #[async_trait]
    impl BackgroundRunnable for Recorder {
        type Task = u32;

        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn run(&mut self, amount: u32) {
            self.0.runs.fetch_add(amount, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.0.ticks.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn runs_submitted_tasks_then_shuts_down_once() {
        let counters = Counters::default();
        let mut worker = BackgroundWorker::start(Recorder(counters.clone()), Duration::from_secs(60));

        worker.submit(1).await.unwrap();
        worker.submit(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counters.runs.load(Ordering::SeqCst), 3);
        assert!(worker.is_running());

        worker.stop().await;
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn ticks_fire_after_the_first_interval() {
        let counters = Counters::default();
        let mut worker = BackgroundWorker::start(Recorder(counters.clone()), Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(110)).await;
        worker.stop().await;

        assert!(counters.ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn submit_after_stop_fails() {
        let mut worker = BackgroundWorker::start(Recorder(Counters::default()), Duration::from_secs(60));
        worker.stop().await;
        assert!(matches!(worker.submit(1).await, Err(WorkerError::Stopped("recorder"))));
    }
}
