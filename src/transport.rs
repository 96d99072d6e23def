//! Transport abstraction (C4): the uniform capability surface modem logic
//! consumes regardless of whether the active backend is AT-over-serial or
//! QMI-over-character-device. Backend selection is a single switch at
//! modem-construction time (spec.md §4.4); everything above this module is
//! written against [`Transport`] only.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::at::{AtCommand, AtPort};
use crate::error::Error;
use crate::qmi::tlv::Tlv;
use crate::qmi::{ClientHandle, QmiPort, Service};

/// An event a caller can subscribe to regardless of backend: an AT
/// unsolicited regex, or a QMI (service, message-id) indication.
pub enum EventSubscription<'a> {
    AtUnsolicited { pattern: &'a str, handler: crate::at::unsolicited::Handler },
    QmiIndication { service: Service, message_id: u16, handler: crate::qmi::port::IndicationListener },
}

/// Transport-agnostic lifecycle and command contract (spec.md §4.4).
#[async_trait]
pub trait Transport: Send + Sync {
    fn is_open(&self) -> bool;
    async fn close(&self);
    async fn subscribe(&self, event: EventSubscription<'_>);
}

/// An AT-backed session.
pub struct AtSession<IO> {
    port: AtPort<IO>,
    open: std::sync::atomic::AtomicBool,
}

impl<IO> AtSession<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(port: AtPort<IO>) -> Self {
        Self { port, open: std::sync::atomic::AtomicBool::new(true) }
    }

    pub async fn command(&self, cmd: &AtCommand) -> Result<Vec<String>, Error> {
        self.port.send(cmd).await.map_err(Error::from)
    }

    pub fn port(&self) -> &AtPort<IO> {
        &self.port
    }
}

#[async_trait]
impl<IO> Transport for AtSession<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    fn is_open(&self) -> bool {
        self.open.load(std::sync::atomic::Ordering::Relaxed)
    }

    async fn close(&self) {
        self.open.store(false, std::sync::atomic::Ordering::Relaxed);
        self.port.clear_unsolicited().await;
    }

    async fn subscribe(&self, event: EventSubscription<'_>) {
        if let EventSubscription::AtUnsolicited { pattern, handler } = event {
            self.port.register_unsolicited(pattern, handler).await;
        }
    }
}

/// A QMI-backed session.
pub struct QmiSession<IO> {
    port: QmiPort<IO>,
    open: std::sync::atomic::AtomicBool,
}

impl<IO> QmiSession<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(port: QmiPort<IO>) -> Self {
        Self { port, open: std::sync::atomic::AtomicBool::new(true) }
    }

    pub async fn allocate_client(&self, service: Service) -> Result<ClientHandle, Error> {
        self.port.allocate_client(service).await.map_err(Error::from)
    }

    pub async fn invoke(
        &self,
        client: ClientHandle,
        message_id: u16,
        input: &[Tlv],
        timeout: Duration,
    ) -> Result<Vec<Tlv>, Error> {
        self.port.send_request(client, message_id, input, timeout).await.map_err(Error::from)
    }

    pub fn port(&self) -> &QmiPort<IO> {
        &self.port
    }
}

#[async_trait]
impl<IO> Transport for QmiSession<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    fn is_open(&self) -> bool {
        self.open.load(std::sync::atomic::Ordering::Relaxed)
    }

    async fn close(&self) {
        self.open.store(false, std::sync::atomic::Ordering::Relaxed);
        for service in [Service::Dms, Service::Nas, Service::Wms, Service::Wds, Service::Pds] {
            self.port.clear_indications(service).await;
        }
    }

    async fn subscribe(&self, event: EventSubscription<'_>) {
        if let EventSubscription::QmiIndication { service, message_id, handler } = event {
            self.port.on_indication(service, message_id, handler).await;
        }
    }
}
