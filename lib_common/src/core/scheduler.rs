//! # Cancellable Delayed Tasks
//!
//! A [`TaskSlot`] owns at most one pending delayed task. Scheduling again
//! cancels the previous task first; dropping the slot cancels whatever is
//! pending. Each schedule gets a fresh generation number so a task that fired
//! just before being cancelled can be recognised as stale by its receiver.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Debug, Default)]
pub struct TaskSlot {
    token: Option<CancellationToken>,
    generation: u64,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the task built by `make_task` after `delay` unless cancelled or
    /// rescheduled first. The builder receives the new generation.
    ///
    /// Returns the generation of the new task.
    pub fn schedule<M, F>(&mut self, delay: Duration, make_task: M) -> u64
    where
        M: FnOnce(u64) -> F,
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.generation += 1;

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let generation = self.generation;
        let task = make_task(generation);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {
                    trace!("Delayed task {} cancelled", generation);
                }
                _ = sleep(delay) => task.await,
            }
        });

        self.token = Some(token);
        generation
    }

    pub fn cancel(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.token.is_some()
    }

    /// Whether `generation` is the task currently armed in this slot.
    pub fn is_current(&self, generation: u64) -> bool {
        self.is_armed() && self.generation == generation
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut slot = TaskSlot::new();
        let generation = slot.schedule(Duration::from_secs(5), |_| async move {
            let _ = tx.send(());
        });
        assert!(slot.is_current(generation));
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(rx.try_recv().is_err());
        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_cancels_previous() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut slot = TaskSlot::new();

        let first_tx = tx.clone();
        let first = slot.schedule(Duration::from_secs(5), |_| async move {
            let _ = first_tx.send(1);
        });
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(3)).await;
        let second = slot.schedule(Duration::from_secs(5), |_| async move {
            let _ = tx.send(2);
        });
        assert!(!slot.is_current(first));
        assert!(slot.is_current(second));
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(rx.recv().await, Some(2));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels() {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let mut slot = TaskSlot::new();
        slot.schedule(Duration::from_secs(1), |_| async move {
            let _ = tx.send(());
        });
        drop(slot);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(rx.recv().await.is_none());
    }
}
