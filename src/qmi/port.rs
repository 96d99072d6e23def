//! The QMI port: device open, control-service client allocation, a
//! background reader that correlates responses to outstanding transactions
//! by (service, client, transaction-id) and dispatches indications to
//! registered listeners.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;

use super::frame::{self, ControlFlags, QmuxFrame};
use super::tlv::{self, Tlv};
use super::{ClientHandle, QmiError, Service};

const CTL_GET_CLIENT_ID: u16 = 0x0022;
const CTL_RELEASE_CLIENT_ID: u16 = 0x0023;

pub type IndicationListener = Box<dyn Fn(&[Tlv]) + Send + Sync>;

struct Shared {
    clients: HashMap<Service, ClientHandle>,
    tx_counters: HashMap<(u8, u8), u16>,
    pending: HashMap<(u8, u8, u16), oneshot::Sender<Result<Vec<Tlv>, QmiError>>>,
    indications: HashMap<(u8, u16), Vec<IndicationListener>>,
}

impl Shared {
    fn next_transaction(&mut self, service: u8, client_id: u8) -> u16 {
        let counter = self.tx_counters.entry((service, client_id)).or_insert(0);
        *counter = counter.wrapping_add(1);
        if *counter == 0 {
            *counter = 1;
        }
        *counter
    }
}

pub struct QmiPort<IO> {
    shared: Arc<Mutex<Shared>>,
    writer: Arc<Mutex<tokio::io::WriteHalf<IO>>>,
    _reader_task: Arc<tokio::task::JoinHandle<()>>,
}

impl<IO> Clone for QmiPort<IO> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            writer: self.writer.clone(),
            _reader_task: self._reader_task.clone(),
        }
    }
}

impl<IO> QmiPort<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Open the device and spawn the background frame reader. Required
    /// service clients are allocated separately via [`Self::allocate_client`]
    /// so that callers control ordering and can gate on version info.
    pub async fn open(io: IO) -> Result<Self, QmiError> {
        let (read_half, write_half) = tokio::io::split(io);
        let shared = Arc::new(Mutex::new(Shared {
            clients: HashMap::new(),
            tx_counters: HashMap::new(),
            pending: HashMap::new(),
            indications: HashMap::new(),
        }));

        let reader_shared = shared.clone();
        let reader_task = tokio::spawn(reader_loop(read_half, reader_shared));

        Ok(Self { shared, writer: Arc::new(Mutex::new(write_half)), _reader_task: Arc::new(reader_task) })
    }

    /// Allocate a client id for `service` via the control service's
    /// get-client-id request, idempotent per spec.md §4.3. Version is left
    /// at (0, 0); callers should refresh it after the first service-level
    /// "get supported messages"/version probe if they need version gating.
    pub async fn allocate_client(&self, service: Service) -> Result<ClientHandle, QmiError> {
        {
            let guard = self.shared.lock().await;
            if let Some(existing) = guard.clients.get(&service) {
                return Ok(*existing);
            }
        }

        let body = tlv::encode(&[Tlv::u8(0x01, service.id())]);
        let output = self
            .send_raw(Service::Ctl.id(), 0, CTL_GET_CLIENT_ID, body, Duration::from_secs(5))
            .await?;
        let client_tlv = tlv::find(&output, 0x01)
            .ok_or_else(|| QmiError::Framing("get-client-id response missing client-id tlv".into()))?;
        if client_tlv.value.len() < 2 {
            return Err(QmiError::Framing("client-id tlv too short".into()));
        }
        let client_id = client_tlv.value[1];

        let handle = ClientHandle { service, client_id, version: (0, 0) };
        self.shared.lock().await.clients.insert(service, handle);
        Ok(handle)
    }

    /// Record a (major, minor) version for an already-allocated client,
    /// used by version-gated callers (spec.md §4.3).
    pub async fn set_client_version(&self, service: Service, version: (u16, u16)) {
        if let Some(handle) = self.shared.lock().await.clients.get_mut(&service) {
            handle.version = version;
        }
    }

    pub async fn release_client(&self, service: Service) -> Result<(), QmiError> {
        let handle = {
            let mut guard = self.shared.lock().await;
            guard.clients.remove(&service)
        };
        if let Some(handle) = handle {
            let body = tlv::encode(&[
                Tlv::u8(0x01, handle.service.id()),
                Tlv::u8(0x02, handle.client_id),
            ]);
            let _ = self
                .send_raw(Service::Ctl.id(), 0, CTL_RELEASE_CLIENT_ID, body, Duration::from_secs(5))
                .await;
        }
        Ok(())
    }

    /// Send a request on an allocated client and await the matching
    /// response by transaction id.
    pub async fn send_request(
        &self,
        client: ClientHandle,
        message_id: u16,
        input_tlvs: &[Tlv],
        timeout_dur: Duration,
    ) -> Result<Vec<Tlv>, QmiError> {
        let body = tlv::encode(input_tlvs);
        self.send_raw(client.service.id(), client.client_id, message_id, body, timeout_dur).await
    }

    /// Register a listener for indications carrying `message_id` on
    /// `service`. Listeners are attached/detached by higher layers during
    /// enable/disable.
    pub async fn on_indication(&self, service: Service, message_id: u16, listener: IndicationListener) {
        self.shared
            .lock()
            .await
            .indications
            .entry((service.id(), message_id))
            .or_default()
            .push(listener);
    }

    pub async fn clear_indications(&self, service: Service) {
        self.shared.lock().await.indications.retain(|(svc, _), _| *svc != service.id());
    }

    /// Unregister just the listeners for one (service, message-id) pair,
    /// leaving other indications on the same service untouched — used when
    /// a caller wants to stop one specific indication stream (e.g. signal
    /// thresholds) without clearing the service's other subscriptions.
    pub async fn clear_indication(&self, service: Service, message_id: u16) {
        self.shared.lock().await.indications.remove(&(service.id(), message_id));
    }

    async fn send_raw(
        &self,
        service: u8,
        client_id: u8,
        message_id: u16,
        body: Vec<u8>,
        timeout_dur: Duration,
    ) -> Result<Vec<Tlv>, QmiError> {
        if timeout_dur.is_zero() {
            return Err(QmiError::Timeout);
        }

        let transaction_id = {
            let mut guard = self.shared.lock().await;
            guard.next_transaction(service, client_id)
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.shared.lock().await;
            guard.pending.insert((service, client_id, transaction_id), tx);
        }

        let frame = QmuxFrame {
            service,
            client_id,
            control_flags: ControlFlags::Request,
            transaction_id,
            message_id,
            body,
        };
        let bytes = frame::encode(&frame);

        trace!("QMI -> service {service:#x} client {client_id} msg {message_id:#06x} txn {transaction_id}");
        {
            let mut writer = self.writer.lock().await;
            writer.write_all(&bytes).await.map_err(|_| QmiError::PortClosed)?;
            writer.flush().await.map_err(|_| QmiError::PortClosed)?;
        }

        match timeout(timeout_dur, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(QmiError::PortClosed),
            Err(_) => {
                self.shared.lock().await.pending.remove(&(service, client_id, transaction_id));
                Err(QmiError::Timeout)
            }
        }
    }
}

async fn reader_loop<R: AsyncRead + Unpin>(mut reader: R, shared: Arc<Mutex<Shared>>) {
    loop {
        let mut header = [0u8; 3];
        if reader.read_exact(&mut header).await.is_err() {
            warn!("QMI port closed while reading frame header");
            return;
        }
        let total = match frame::declared_len(&header) {
            Ok(n) => n,
            Err(e) => {
                warn!("QMI framing error: {e}");
                return;
            }
        };
        let Some(rest_len) = total.checked_sub(3) else {
            warn!("QMI framing error: declared frame shorter than its own header");
            return;
        };
        let mut rest = vec![0u8; rest_len];
        if reader.read_exact(&mut rest).await.is_err() {
            warn!("QMI port closed mid-frame");
            return;
        }
        let mut full = header.to_vec();
        full.extend_from_slice(&rest);

        let parsed = match frame::decode(&full) {
            Ok(f) => f,
            Err(e) => {
                warn!("QMI framing error: {e}");
                continue;
            }
        };

        let tlvs = match tlv::decode(&parsed.body) {
            Ok(t) => t,
            Err(e) => {
                warn!("QMI tlv decode error: {e}");
                continue;
            }
        };

        match parsed.control_flags {
            ControlFlags::Indication => {
                dispatch_indication(&shared, &parsed, &tlvs).await;
            }
            ControlFlags::Response => {
                let key = (parsed.service, parsed.client_id, parsed.transaction_id);
                let sender = shared.lock().await.pending.remove(&key);
                if let Some(sender) = sender {
                    let result = match tlv::read_result(&tlvs) {
                        Some(r) if !r.success => Err(QmiError::ProtocolError { code: r.error_code }),
                        _ => Ok(tlvs),
                    };
                    let _ = sender.send(result);
                } else {
                    warn!(
                        "QMI response for unknown transaction {} on service {:#x}",
                        parsed.transaction_id, parsed.service
                    );
                }
            }
            ControlFlags::Request => {
                warn!("QMI port received a request-flagged frame, ignoring");
            }
        }
    }
}

async fn dispatch_indication(shared: &Arc<Mutex<Shared>>, frame: &QmuxFrame, tlvs: &[Tlv]) {
    let guard = shared.lock().await;
    if let Some(listeners) = guard.indications.get(&(frame.service, frame.message_id)) {
        for listener in listeners {
            listener(tlvs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::duplex;

    #[tokio::test]
    async fn allocate_client_is_idempotent() {
        let (client_io, mut server) = duplex(4096);
        let port = QmiPort::open(client_io).await.unwrap();

        let server_task = tokio::spawn(async move {
            let mut header = [0u8; 3];
            server.read_exact(&mut header).await.unwrap();
            let total = frame::declared_len(&header).unwrap();
            let mut rest = vec![0u8; total - 3];
            server.read_exact(&mut rest).await.unwrap();
            let mut full = header.to_vec();
            full.extend_from_slice(&rest);
            let req = frame::decode(&full).unwrap();

            let body = tlv::encode(&[
                Tlv::new(0x02, vec![0, 0, 0, 0]),
                Tlv::new(0x01, vec![Service::Dms.id(), 5]),
            ]);
            let resp = QmuxFrame {
                service: req.service,
                client_id: req.client_id,
                control_flags: ControlFlags::Response,
                transaction_id: req.transaction_id,
                message_id: req.message_id,
                body,
            };
            server.write_all(&frame::encode(&resp)).await.unwrap();
        });

        let handle = port.allocate_client(Service::Dms).await.unwrap();
        assert_eq!(handle.client_id, 5);

        let again = port.allocate_client(Service::Dms).await.unwrap();
        assert_eq!(again.client_id, 5);

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn send_request_zero_timeout_fails_fast() {
        let (client_io, _server) = duplex(64);
        let port = QmiPort::open(client_io).await.unwrap();
        let handle = ClientHandle { service: Service::Dms, client_id: 1, version: (1, 0) };
        let err = port.send_request(handle, 0x0020, &[], Duration::from_secs(0)).await.unwrap_err();
        assert_eq!(err, QmiError::Timeout);
    }

    #[tokio::test]
    async fn indication_dispatches_to_listener() {
        let (client_io, mut server) = duplex(4096);
        let port = QmiPort::open(client_io).await.unwrap();

        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        port.on_indication(
            Service::Nas,
            0x0051,
            Box::new(move |_tlvs| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await;

        let frame = QmuxFrame {
            service: Service::Nas.id(),
            client_id: 2,
            control_flags: ControlFlags::Indication,
            transaction_id: 0,
            message_id: 0x0051,
            body: vec![],
        };
        server.write_all(&frame::encode(&frame)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_indication_removes_only_that_message_id() {
        let (client_io, mut server) = duplex(4096);
        let port = QmiPort::open(client_io).await.unwrap();

        let signal_hits = Arc::new(AtomicU32::new(0));
        let signal_hits2 = signal_hits.clone();
        port.on_indication(Service::Nas, 0x004F, Box::new(move |_tlvs| {
            signal_hits2.fetch_add(1, Ordering::SeqCst);
        }))
        .await;
        let serving_hits = Arc::new(AtomicU32::new(0));
        let serving_hits2 = serving_hits.clone();
        port.on_indication(Service::Nas, 0x0024, Box::new(move |_tlvs| {
            serving_hits2.fetch_add(1, Ordering::SeqCst);
        }))
        .await;

        port.clear_indication(Service::Nas, 0x004F).await;

        for message_id in [0x004Fu16, 0x0024] {
            let frame = QmuxFrame {
                service: Service::Nas.id(),
                client_id: 2,
                control_flags: ControlFlags::Indication,
                transaction_id: 0,
                message_id,
                body: vec![],
            };
            server.write_all(&frame::encode(&frame)).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(signal_hits.load(Ordering::SeqCst), 0);
        assert_eq!(serving_hits.load(Ordering::SeqCst), 1);
    }
}
