#![forbid(unsafe_code)]

//! Background task management for the engine's periodic activities. Loops
//! are tokio tasks parked on `select!` over their cadence and a shared
//! cooperative shutdown signal; stop waits for each loop up to a deadline
//! and aborts stragglers.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

pub(crate) struct Scheduler {
    shutdown: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Receiver the loops watch; flips to `true` exactly once, at stop.
    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn spawn<F>(&mut self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(loop_name = name, "scheduler loop started");
        self.handles.push((name, tokio::spawn(fut)));
    }

    /// Signal shutdown and wait for every loop, bounded by `deadline`.
    pub(crate) async fn stop(self, deadline: Instant) {
        let _ = self.shutdown.send(true);
        for (name, mut handle) in self.handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(_) => debug!(loop_name = name, "scheduler loop stopped"),
                Err(_) => {
                    warn!(loop_name = name, "scheduler loop missed the stop deadline");
                    handle.abort();
                }
            }
        }
    }

    /// Abort every loop without waiting. Models an unclean exit.
    pub(crate) fn abort(self) {
        for (_, handle) in &self.handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn loops_stop_on_signal() {
        let mut s = Scheduler::new();
        let ticks = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&ticks);
        let mut signal = s.shutdown_signal();
        s.spawn("ticker", async move {
            let mut interval = tokio::time::interval(Duration::from_millis(5));
            loop {
                tokio::select! {
                    _ = interval.tick() => { seen.fetch_add(1, Ordering::SeqCst); }
                    _ = signal.changed() => break,
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        s.stop(Instant::now() + Duration::from_millis(100)).await;
        let after_stop = ticks.load(Ordering::SeqCst);
        assert!(after_stop > 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop, "loop kept ticking");
    }
}
