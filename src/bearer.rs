//! Bearer engine (C7): connect/disconnect sequencing for a data session,
//! backend-specific per spec.md §4.7, producing an IP configuration the
//! host applies (this crate never touches the host network interface
//! itself).

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::RwLock;

use crate::at::AtCommand;
use crate::error::Error;
use crate::modem::{Backend, Modem, PortKind, State};
use crate::qmi::tlv::{self, Tlv};
use crate::qmi::{QmiError, Service, QMI_ERR_CALL_FAILED, QMI_ERR_NO_EFFECT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
    Dual,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpMethod {
    Static,
    Dhcp,
}

#[derive(Debug, Clone, Default)]
pub struct IpConfig {
    pub method: Option<IpMethod>,
    pub address: Option<String>,
    pub prefix: Option<u8>,
    pub gateway: Option<String>,
    pub dns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BearerConfig {
    pub apn: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub ip_family: IpFamily,
}

#[derive(Debug, Clone)]
pub struct Bearer {
    pub id: u64,
    pub config: BearerConfig,
    pub state: BearerState,
    /// Weak reference to the data port by device path; the port itself is
    /// owned by the Modem (spec.md §3).
    pub data_port: Option<String>,
    pub packet_data_handle: u32,
    pub ip_v4: IpConfig,
    pub ip_v6: IpConfig,
}

impl Bearer {
    fn new(id: u64, config: BearerConfig) -> Self {
        Self {
            id,
            config,
            state: BearerState::Disconnected,
            data_port: None,
            packet_data_handle: 0,
            ip_v4: IpConfig::default(),
            ip_v6: IpConfig::default(),
        }
    }
}

/// Create a bearer on `modem`, failing with `TooMany` once the configured
/// cap is reached (spec.md §8 boundary behavior).
pub async fn create(modem: &Modem, config: BearerConfig) -> Result<u64, Error> {
    let mut state = modem.state.write().await;
    if state.bearers.len() >= state.max_bearers {
        return Err(Error::TooMany("bearer list full".into()));
    }
    let id = state.bearers.len() as u64 + 1;
    state.bearers.push(Bearer::new(id, config));
    Ok(id)
}

async fn find_data_port(modem: &Modem) -> Option<String> {
    let state = modem.state.read().await;
    state
        .ports
        .iter()
        .find(|p| p.kind == PortKind::NetworkData)
        .map(|p| p.device_path.clone())
        .or_else(|| state.ports.first().map(|p| p.device_path.clone()))
}

async fn backend_of(modem: &Modem) -> Result<Backend, Error> {
    let state = modem.state.read().await;
    match &state.backend {
        Some(Backend::At(at)) => Ok(Backend::At(at.clone())),
        Some(Backend::Qmi(qmi)) => Ok(Backend::Qmi(qmi.clone())),
        None => Err(Error::WrongState("transport not open".into())),
    }
}

/// Connect `bearer_id` on `modem`. Requires `Enabled` or later.
pub async fn connect(modem: &Modem, bearer_id: u64) -> Result<(), Error> {
    let lifecycle = modem.lifecycle().await;
    if !lifecycle.requires_open_transport() {
        return Err(Error::WrongState("connect requires an enabled modem".into()));
    }

    set_bearer_state(modem, bearer_id, BearerState::Connecting).await?;

    let backend = backend_of(modem).await?;
    let data_port = find_data_port(modem).await;
    let config = bearer_config(modem, bearer_id).await?;

    let result = match &backend {
        Backend::At(at) => connect_at(at, &config).await,
        Backend::Qmi(qmi) => connect_qmi(qmi, &config).await,
    };

    let mut state = modem.state.write().await;
    let bearer = state
        .bearers
        .iter_mut()
        .find(|b| b.id == bearer_id)
        .ok_or_else(|| Error::not_found(format!("bearer {bearer_id}")))?;

    match result {
        Ok(handle) => {
            bearer.state = BearerState::Connected;
            bearer.data_port = data_port.clone();
            bearer.packet_data_handle = handle;
            bearer.ip_v4 = IpConfig { method: Some(IpMethod::Dhcp), ..Default::default() };
            if matches!(config.ip_family, IpFamily::V6 | IpFamily::Dual | IpFamily::Any) {
                bearer.ip_v6 = IpConfig { method: Some(IpMethod::Dhcp), ..Default::default() };
            }
            if let Some(path) = &data_port {
                if let Some(port) = state.ports.iter_mut().find(|p| &p.device_path == path) {
                    port.connected = true;
                }
            }
            info!("modem {} bearer {bearer_id} connected", modem.id);
            Ok(())
        }
        Err(e) => {
            bearer.state = BearerState::Disconnected;
            Err(e)
        }
    }
}

/// Disconnect `bearer_id`.
pub async fn disconnect(modem: &Modem, bearer_id: u64) -> Result<(), Error> {
    set_bearer_state(modem, bearer_id, BearerState::Disconnecting).await?;
    let backend = backend_of(modem).await?;
    let handle = {
        let state = modem.state.read().await;
        state.bearers.iter().find(|b| b.id == bearer_id).map(|b| b.packet_data_handle).unwrap_or(0)
    };

    let result = match &backend {
        Backend::At(at) => at.command(&AtCommand::new("AT%DPDNACT=0", Duration::from_secs(10))).await.map(|_| ()),
        Backend::Qmi(qmi) => {
            let client = qmi.allocate_client(Service::Wds).await?;
            let input = [Tlv::u32_le(0x01, handle)];
            qmi.invoke(client, 0x0021, &input, Duration::from_secs(10)).await.map(|_| ())
        }
    };

    report_disconnected(modem, bearer_id).await;
    result
}

async fn set_bearer_state(modem: &Modem, bearer_id: u64, new_state: BearerState) -> Result<(), Error> {
    let mut state = modem.state.write().await;
    let bearer = state
        .bearers
        .iter_mut()
        .find(|b| b.id == bearer_id)
        .ok_or_else(|| Error::not_found(format!("bearer {bearer_id}")))?;
    bearer.state = new_state;
    Ok(())
}

async fn bearer_config(modem: &Modem, bearer_id: u64) -> Result<BearerConfig, Error> {
    let state = modem.state.read().await;
    state
        .bearers
        .iter()
        .find(|b| b.id == bearer_id)
        .map(|b| b.config.clone())
        .ok_or_else(|| Error::not_found(format!("bearer {bearer_id}")))
}

async fn connect_at<IO>(at: &std::sync::Arc<crate::transport::AtSession<IO>>, config: &BearerConfig) -> Result<u32, Error>
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
{
    let quoted = format!("AT%APNN=\"{}\"", config.apn);
    at.command(&AtCommand::new(quoted, Duration::from_secs(6))).await?;
    at.command(&AtCommand::new("AT%DPDNACT=1", Duration::from_secs(10))).await?;
    // The AT backend's modem doesn't hand back a packet-data-handle; any
    // non-zero placeholder satisfies the "connected iff non-zero" invariant.
    Ok(1)
}

async fn connect_qmi<IO>(qmi: &std::sync::Arc<crate::transport::QmiSession<IO>>, config: &BearerConfig) -> Result<u32, Error>
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
{
    let client = qmi.allocate_client(Service::Wds).await?;

    let mut input = vec![Tlv::string(0x14, &config.apn)];
    if let Some(user) = &config.user {
        input.push(Tlv::string(0x17, user));
    }
    if let Some(password) = &config.password {
        input.push(Tlv::string(0x18, password));
    }
    let family_byte = match config.ip_family {
        IpFamily::V4 => 0x04,
        IpFamily::V6 => 0x06,
        IpFamily::Dual | IpFamily::Any => 0x08,
    };
    input.push(Tlv::u8(0x19, family_byte));

    match qmi.invoke(client, 0x0020, &input, Duration::from_secs(10)).await {
        Ok(output) => {
            let handle = tlv::find(&output, 0x01)
                .and_then(|t| t.value.get(0..4))
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .unwrap_or(1);
            Ok(handle)
        }
        Err(Error::Qmi(QmiError::ProtocolError { code })) if code == QMI_ERR_NO_EFFECT => Ok(1),
        Err(Error::Qmi(QmiError::ProtocolError { code })) if code == QMI_ERR_CALL_FAILED => {
            Err(Error::ProtocolError { code: code as i32 })
        }
        Err(e) => Err(e),
    }
}

/// Invoked when a specific bearer's data session ends, including the
/// explicit `disconnect()` path above. Moves the bearer to `Disconnected`
/// and clears its data-port reference, emitting a property-change (left to
/// the object registry layer to publish).
pub async fn report_disconnected(modem: &Modem, bearer_id: u64) {
    report_one_disconnected(&modem.state, modem.id, bearer_id).await;
}

/// Invoked when a PDN-disconnected notification arrives with no specific
/// bearer identified: `%STATCM` code `4` on AT, or the QMI WDS
/// packet-service-status indication. Per spec.md §4.7, "every matching
/// bearer's report-disconnection hook is invoked" — the original
/// (`bearer_list_report_disconnect_status_foreach` in
/// `mm-broadband-modem-altair-lte.c`) runs the disconnection hook across
/// every bearer on the modem, not just ones on a particular port, since
/// neither indication identifies which PDN went down.
pub async fn report_all_disconnected(state: &Arc<RwLock<State>>, modem_id: u64) {
    let ids: Vec<u64> = {
        let guard = state.read().await;
        guard
            .bearers
            .iter()
            .filter(|b| b.state != BearerState::Disconnected)
            .map(|b| b.id)
            .collect()
    };
    for id in ids {
        report_one_disconnected(state, modem_id, id).await;
    }
}

async fn report_one_disconnected(state: &Arc<RwLock<State>>, modem_id: u64, bearer_id: u64) {
    let mut state = state.write().await;
    let data_port = state.bearers.iter().find(|b| b.id == bearer_id).and_then(|b| b.data_port.clone());
    if let Some(bearer) = state.bearers.iter_mut().find(|b| b.id == bearer_id) {
        bearer.state = BearerState::Disconnected;
        bearer.packet_data_handle = 0;
        bearer.data_port = None;
        bearer.ip_v4 = IpConfig::default();
        bearer.ip_v6 = IpConfig::default();
    } else {
        warn!("modem {modem_id} report_disconnected for unknown bearer {bearer_id}");
        return;
    }
    if let Some(path) = data_port {
        if let Some(port) = state.ports.iter_mut().find(|p| p.device_path == path) {
            port.connected = false;
        }
    }
    info!("modem {modem_id} bearer {bearer_id} disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, Config};

    fn make_modem() -> Modem {
        Modem::new(Config::new(BackendKind::At, "/dev/ttyUSB2"))
    }

    #[tokio::test]
    async fn bearer_list_caps_at_max() {
        let modem = make_modem();
        modem.state.write().await.max_bearers = 1;
        let cfg = BearerConfig { apn: "internet".into(), user: None, password: None, ip_family: IpFamily::Any };
        create(&modem, cfg.clone()).await.unwrap();
        let err = create(&modem, cfg).await.unwrap_err();
        assert!(matches!(err, Error::TooMany(_)));
    }

    #[tokio::test]
    async fn connect_fails_when_transport_not_open() {
        let modem = make_modem();
        let cfg = BearerConfig { apn: "internet".into(), user: None, password: None, ip_family: IpFamily::Any };
        let id = create(&modem, cfg).await.unwrap();
        let err = connect(&modem, id).await.unwrap_err();
        assert!(matches!(err, Error::WrongState(_)));
    }

    #[tokio::test]
    async fn report_disconnected_clears_handle_and_port() {
        let modem = make_modem();
        let cfg = BearerConfig { apn: "internet".into(), user: None, password: None, ip_family: IpFamily::Any };
        let id = create(&modem, cfg).await.unwrap();
        {
            let mut state = modem.state.write().await;
            let bearer = state.bearers.iter_mut().find(|b| b.id == id).unwrap();
            bearer.state = BearerState::Connected;
            bearer.packet_data_handle = 7;
            bearer.data_port = Some("/dev/ttyUSB2".into());
        }
        report_disconnected(&modem, id).await;
        let state = modem.state.read().await;
        let bearer = state.bearers.iter().find(|b| b.id == id).unwrap();
        assert_eq!(bearer.state, BearerState::Disconnected);
        assert_eq!(bearer.packet_data_handle, 0);
        assert!(bearer.data_port.is_none());
    }

    #[tokio::test]
    async fn report_all_disconnected_fans_out_to_every_connected_bearer() {
        let modem = make_modem();
        modem.state.write().await.max_bearers = 4;
        let cfg = BearerConfig { apn: "internet".into(), user: None, password: None, ip_family: IpFamily::Any };
        let a = create(&modem, cfg.clone()).await.unwrap();
        let b = create(&modem, cfg.clone()).await.unwrap();
        let idle = create(&modem, cfg).await.unwrap();
        {
            let mut state = modem.state.write().await;
            for (id, handle) in [(a, 7u32), (b, 9u32)] {
                let bearer = state.bearers.iter_mut().find(|bearer| bearer.id == id).unwrap();
                bearer.state = BearerState::Connected;
                bearer.packet_data_handle = handle;
                bearer.data_port = Some("/dev/ttyUSB2".into());
            }
        }

        report_all_disconnected(&modem.state, modem.id).await;

        let state = modem.state.read().await;
        for id in [a, b] {
            let bearer = state.bearers.iter().find(|bearer| bearer.id == id).unwrap();
            assert_eq!(bearer.state, BearerState::Disconnected);
            assert_eq!(bearer.packet_data_handle, 0);
            assert!(bearer.data_port.is_none());
        }
        // A bearer that was never connected is left alone, not touched.
        let idle_bearer = state.bearers.iter().find(|bearer| bearer.id == idle).unwrap();
        assert_eq!(idle_bearer.state, BearerState::Disconnected);
    }
}
