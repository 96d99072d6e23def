//! Sleep/resume coordination (C11): acquire a delay-inhibitor against the
//! host's sleep subsystem, quiesce modems on sleep-imminent, and re-scan on
//! resume (spec.md §4.11). The original supports two backends (UPower and
//! ChromeOS `powerd`); this crate implements the frontend contract plus the
//! UPower D-Bus backend, the one reachable on a stock Linux host, behind a
//! `SleepBackend` seam a `powerd` implementation could later slot into.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use tokio::sync::{mpsc, Notify};
use zbus::Connection;

use crate::modem::Modem;

const DEFAULT_QUIESCE_TIMEOUT: Duration = Duration::from_secs(5);

/// A completion token handed to each modem's quiescing operation, with a
/// finite timeout the coordinator enforces regardless of whether every
/// modem reports back.
#[derive(Clone)]
pub struct SleepContext {
    done: Arc<Notify>,
    extra: Arc<tokio::sync::Mutex<Duration>>,
}

impl SleepContext {
    fn new() -> Self {
        Self { done: Arc::new(Notify::new()), extra: Arc::new(tokio::sync::Mutex::new(Duration::ZERO)) }
    }

    pub fn complete(&self) {
        self.done.notify_one();
    }

    /// Allow an operation legitimately approaching completion to extend the
    /// wait, up to its own limit (spec.md §4.11).
    pub async fn timeout_backoff(&self, extra_seconds: u64) {
        let mut extra = self.extra.lock().await;
        *extra += Duration::from_secs(extra_seconds);
    }

    async fn extra(&self) -> Duration {
        *self.extra.lock().await
    }
}

/// The backend-specific inhibitor/signal source. The UPower implementation
/// is the only one built; `powerd` is ChromeOS-only and out of scope here.
#[async_trait]
pub trait SleepBackend: Send + Sync {
    async fn acquire_inhibitor(&self, reason: &str) -> Result<(), String>;
    async fn release_inhibitor(&self);
}

pub struct UPowerBackend {
    connection: Connection,
    fd: tokio::sync::Mutex<Option<zbus::zvariant::OwnedFd>>,
}

impl UPowerBackend {
    pub async fn connect() -> Result<Self, zbus::Error> {
        let connection = Connection::system().await?;
        Ok(Self { connection, fd: tokio::sync::Mutex::new(None) })
    }
}

#[async_trait]
impl SleepBackend for UPowerBackend {
    async fn acquire_inhibitor(&self, reason: &str) -> Result<(), String> {
        let reply = self
            .connection
            .call_method(
                Some("org.freedesktop.login1"),
                "/org/freedesktop/login1",
                Some("org.freedesktop.login1.Manager"),
                "Inhibit",
                &("sleep", "cellbroker", reason, "delay"),
            )
            .await
            .map_err(|e| e.to_string())?;
        let fd: zbus::zvariant::OwnedFd = reply.body().map_err(|e| e.to_string())?;
        *self.fd.lock().await = Some(fd);
        Ok(())
    }

    async fn release_inhibitor(&self) {
        self.fd.lock().await.take();
    }
}

/// Fans `sleeping`/`resuming` events out to every registered modem.
pub struct SleepCoordinator<B: SleepBackend> {
    backend: B,
    modems: tokio::sync::RwLock<Vec<Arc<Modem>>>,
    quiesce_timeout: Duration,
}

impl<B: SleepBackend> SleepCoordinator<B> {
    pub fn new(backend: B) -> Self {
        Self { backend, modems: tokio::sync::RwLock::new(Vec::new()), quiesce_timeout: DEFAULT_QUIESCE_TIMEOUT }
    }

    pub async fn start(&self) -> Result<(), String> {
        self.backend.acquire_inhibitor("device quiescing needed").await
    }

    pub async fn register_modem(&self, modem: Arc<Modem>) {
        self.modems.write().await.push(modem);
    }

    /// Drive the sleep-imminent sequence: fan `SleepContext` out to every
    /// modem's quiescing operation, wait up to the timeout for completions,
    /// then drop the inhibitor regardless.
    pub async fn on_sleeping(&self, quiesce: impl Fn(Arc<Modem>, SleepContext) + Send + Sync + 'static) {
        let context = SleepContext::new();
        let modems = self.modems.read().await.clone();
        let count = modems.len();
        let (ack_tx, mut ack_rx) = mpsc::channel::<()>(count.max(1));

        for modem in modems {
            let context = context.clone();
            let ack_tx = ack_tx.clone();
            let quiesce = &quiesce;
            quiesce(modem, context.clone());
            tokio::spawn(async move {
                context.done.notified().await;
                let _ = ack_tx.send(()).await;
            });
        }
        drop(ack_tx);

        let mut remaining = self.quiesce_timeout;
        let mut acked = 0usize;
        while acked < count {
            match tokio::time::timeout(remaining, ack_rx.recv()).await {
                Ok(Some(())) => {
                    acked += 1;
                    remaining = self.quiesce_timeout + context.extra().await;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!("sleep quiesce timed out with {} of {count} modems unacknowledged", count - acked);
                    break;
                }
            }
        }

        self.backend.release_inhibitor().await;
    }

    pub async fn on_resuming(&self) -> Result<(), String> {
        self.backend.acquire_inhibitor("device quiescing needed").await?;
        let modems = self.modems.read().await.clone();
        for modem in modems {
            if let Err(e) = modem.enable().await {
                info!("modem {} re-enable on resume failed: {e}", modem.id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockBackend {
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    #[async_trait]
    impl SleepBackend for MockBackend {
        async fn acquire_inhibitor(&self, _reason: &str) -> Result<(), String> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn release_inhibitor(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn sleeping_with_no_modems_releases_immediately() {
        let coordinator =
            SleepCoordinator::new(MockBackend { acquired: AtomicUsize::new(0), released: AtomicUsize::new(0) });
        coordinator.start().await.unwrap();
        coordinator.on_sleeping(|_modem, ctx| ctx.complete()).await;
        assert_eq!(coordinator.backend.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_backoff_extends_the_wait() {
        let ctx = SleepContext::new();
        ctx.timeout_backoff(3).await;
        assert_eq!(ctx.extra().await, Duration::from_secs(3));
    }
}
