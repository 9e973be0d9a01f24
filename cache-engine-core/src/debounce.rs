//! A generic debounce helper: cancel-and-reschedule around any async
//! closure, with only the final invocation's outcome resolving the
//! caller's future. Used to coalesce prefetch warm-ups that land within
//! `debounce_ms` of one another.

use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tokio::time::{sleep, Duration};

/// Coalesces bursts of calls to `schedule` into a single run of `f`
/// `delay` after the last call in the burst. Earlier callers in the same
/// burst receive the same outcome as the call that actually runs.
pub struct Debouncer<T> {
    delay: Duration,
    pending: Mutex<Option<oneshot::Sender<()>>>,
    waiters: Arc<Mutex<Vec<oneshot::Sender<Arc<T>>>>>,
}

impl<T> Debouncer<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            pending: Mutex::new(None),
            waiters: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Schedule `f` to run after the debounce delay, canceling any
    /// previously-scheduled run that hasn't fired yet. Resolves once the
    /// run that actually executes completes.
    pub async fn schedule<F, Fut>(&self, f: F) -> Arc<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = T> + Send,
    {
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        if let Some(previous) = self.pending.lock().await.replace(cancel_tx) {
            let _ = previous.send(());
        }

        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.waiters.lock().await.push(waiter_tx);

        let delay = self.delay;
        let waiters = self.waiters.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(delay) => {}
                _ = &mut cancel_rx => return,
            }
            let result = Arc::new(f().await);
            for waiter in waiters.lock().await.drain(..) {
                let _ = waiter.send(result.clone());
            }
        });

        waiter_rx.await.expect("debounced run always completes or is replaced")
    }
}
