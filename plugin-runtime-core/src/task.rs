// Cancellable periodic background task owned by a plugin
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

pub struct BackgroundTask {
    name: String,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Run `tick` every `period`, first after one full period.
    ///
    /// An in-flight tick is abandoned when the task is stopped.
    pub fn spawn_interval<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let period = period.max(Duration::from_millis(1));
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    () = tick() => {}
                }
            }
            debug!(task = %task_name, "Background task exited");
        });

        Self { name, shutdown, handle }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal shutdown and wait for the task to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(task = %self.name, error = %e, "Background task ended abnormally");
        }
    }
}

/// Aborts the wrapped task when dropped
pub(crate) struct AbortOnDrop<T>(pub(crate) JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
