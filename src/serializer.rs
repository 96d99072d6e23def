//! Operation serializer (C5): a per-modem FIFO of asynchronous operations.
//! At most one operation runs against a given modem at a time (spec.md §5,
//! invariant 1); the next begins only once the current completes or is
//! cancelled. Sub-operations called from within an operation run inline on
//! the caller's own future and never re-enter the queue.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::error::Error;

struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A cooperative cancellation token. Operations check it at their own
/// suspension points; it never aborts in-flight wire I/O (spec.md §5).
#[derive(Clone)]
pub struct CancellationToken(Arc<Inner>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(Inner { cancelled: AtomicBool::new(false), notify: Notify::new() }))
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Return `Err(Error::Cancelled)` if cancellation has been requested;
    /// operations call this at every suspension point.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve once cancellation is requested. Useful in a `select!` arm
    /// racing a suspension point against cancellation.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.0.notify.notified().await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// The per-modem FIFO. Cloning shares the same underlying lock, so every
/// `Modem` can hand out cheap handles to its own serializer.
#[derive(Clone)]
pub struct Serializer {
    lock: Arc<Mutex<()>>,
}

impl Serializer {
    pub fn new() -> Self {
        Self { lock: Arc::new(Mutex::new(())) }
    }

    /// Run `op` against this modem's queue, awaiting completion inline.
    /// Concurrent callers of `run`/`submit` are admitted to the critical
    /// section in the order their futures were created, giving the FIFO
    /// ordering spec.md §4.5 requires.
    pub async fn run<F, Fut, T>(&self, op: F) -> Result<T, Error>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let _guard = self.lock.lock().await;
        op(CancellationToken::new()).await
    }

    /// Submit `op` to run on a background task, returning a token the
    /// caller can cancel and a handle to await the result. Used when the
    /// submitter needs to keep running (e.g. to observe a sleep-imminent
    /// timeout) while the operation is in flight.
    pub fn submit<F, Fut, T>(&self, op: F) -> (CancellationToken, JoinHandle<Result<T, Error>>)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
        T: Send + 'static,
    {
        let token = CancellationToken::new();
        let token_for_op = token.clone();
        let lock = self.lock.clone();
        let handle = tokio::spawn(async move {
            let _guard = lock.lock().await;
            op(token_for_op).await
        });
        (token, handle)
    }
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test]
    async fn operations_run_one_at_a_time() {
        let serializer = Serializer::new();
        let counter = Arc::new(AtomicU32::new(0));
        let max_concurrent = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let serializer = serializer.clone();
            let counter = counter.clone();
            let max_concurrent = max_concurrent.clone();
            handles.push(tokio::spawn(async move {
                serializer
                    .run(|_token| async move {
                        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        max_concurrent.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        counter.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, Error>(())
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_is_observed_cooperatively() {
        let serializer = Serializer::new();
        let (token, handle) = serializer.submit(|token| async move {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                token.check()?;
            }
            #[allow(unreachable_code)]
            Ok::<(), Error>(())
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
