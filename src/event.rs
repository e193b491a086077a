//! ManagedEvent scheduler (§4.2): a cooperatively cancelable periodic task.
//!
//! Grounded on the Go original's `mngr/event/event.go` `TimedEvent` (a
//! `time.Ticker` goroutine publishing to subscribers), generalized into a
//! `tokio`-task-plus-callback shape since this server has no pub-sub bus to
//! reuse the ticker through — each periodic emission owns its own callback.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

type BoxedCallback = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// A periodic task that invokes `callback` every `interval` until [`ManagedEvent::stop`]
/// is called. Stop is idempotent: calling it twice, or after the task has
/// already exited on its own, is a no-op.
pub struct ManagedEvent {
    cancel: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl ManagedEvent {
    /// Starts firing `callback` every `interval`, on its own `tokio` task.
    pub fn start<F, Fut>(interval: Duration, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: BoxedCallback = Box::new(move || Box::pin(callback()));
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        callback().await;
                    }
                    result = cancel_rx.changed() => {
                        match result {
                            Ok(()) if *cancel_rx.borrow() => break,
                            Ok(()) => continue,
                            Err(_) => break,
                        }
                    }
                }
            }
        });

        Self {
            cancel: cancel_tx,
            handle: Some(handle),
        }
    }

    /// Stops the event. Idempotent: a second call observes the channel is
    /// already at `true` (or the task has already exited) and does nothing.
    pub fn stop(&mut self) {
        let _ = self.cancel.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for ManagedEvent {
    fn drop(&mut self) {
        self.stop();
    }
}
