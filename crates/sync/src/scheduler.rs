//! Periodic background tasks with an explicit lifecycle.

use core::future::Future;

use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A task running `tick` every `period` until stopped.
///
/// The first tick fires immediately. A tick that overruns its period delays
/// the next one instead of bunching up missed ticks. Dropping the task
/// cancels it without waiting; [`PeriodicTask::stop`] also waits for the
/// tick in flight to finish.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(period);

            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    () = cancelled.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }

            debug!(task = name, "Periodic task stopped");
        });

        debug!(task = name, ?period, "Periodic task started");

        Self {
            name,
            token,
            handle: Some(handle),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Cancels the task and waits for it to wind down.
    pub async fn stop(mut self) {
        self.token.cancel();

        let Some(handle) = self.handle.take() else {
            return;
        };

        if let Err(err) = handle.await {
            warn!(task = self.name, %err, "Periodic task ended abnormally");
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn counting_task(period: Duration) -> (PeriodicTask, Arc<AtomicUsize>) {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);

        let task = PeriodicTask::spawn("counter", period, move || {
            let counter = Arc::clone(&counter);
            async move {
                let _prev = counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        (task, ticks)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_stopped() {
        let (task, ticks) = counting_task(Duration::from_secs(5));

        time::sleep(Duration::from_secs(12)).await;
        assert!(task.is_running());

        task.stop().await;
        let after_stop = ticks.load(Ordering::SeqCst);
        assert_eq!(after_stop, 3);

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let (task, ticks) = counting_task(Duration::from_secs(1));

        time::sleep(Duration::from_millis(1500)).await;
        drop(task);

        let at_drop = ticks.load(Ordering::SeqCst);
        time::sleep(Duration::from_secs(10)).await;

        assert_eq!(ticks.load(Ordering::SeqCst), at_drop);
    }
}
