//! The ordered probe sequences for each ladder stage (spec.md §4.6). Each
//! step function returns `Ok(())` on success, `Ok(())` after recording the
//! step unsupported when the peer returned a documented "not supported"
//! response, or `Err` for anything else — which the caller in
//! [`super::Modem`] promotes to `Failed`.

use std::sync::Arc;
use std::time::Duration;

use crate::at::{AtCommand, AtPort};
use crate::config::BackendKind;
use crate::device;
use crate::error::Error;
use crate::qmi::tlv::Tlv;
use crate::qmi::{QmiPort, Service};
use crate::serializer::CancellationToken;
use crate::sim::Sim;

use super::{AtBackend, Backend, CapabilityMask, Identity, Modem, PowerState, QmiBackend};

// QMI DMS/NAS message ids used by the ladder. Numeric values follow the
// public QMI message catalog.
const DMS_GET_CAPS: u16 = 0x0021;
const DMS_GET_IDS: u16 = 0x0025;
const DMS_GET_MSR: u16 = 0x0020;
const DMS_SET_OPERATING_MODE: u16 = 0x002D;
const DMS_UIM_GET_PIN_STATUS: u16 = 0x002B;
const NAS_GET_RF_BAND_INFO: u16 = 0x0031;
const NAS_REGISTER_INDICATIONS: u16 = 0x0003;
const NAS_SERVING_SYSTEM_IND: u16 = 0x0024;
const WDS_PACKET_SERVICE_STATUS_IND: u16 = 0x0022;
const WMS_MESSAGE_REPORT_IND: u16 = 0x0001;
// TLV 0x01 value on the WDS packet-service-status indication: the public
// QMI `connection_status` enum (1 = disconnected, 2 = connected, ...).
const WDS_CONNECTION_STATUS_DISCONNECTED: u8 = 0x01;

async fn at_cmd(at: &Arc<AtBackend>, text: &str, timeout: Duration) -> Result<Vec<String>, Error> {
    at.command(&AtCommand::new(text, timeout)).await
}

fn is_unsupported_error(err: &Error) -> bool {
    matches!(err, Error::Unsupported) || matches!(err, Error::At(crate::at::AtError::EquipmentError(4)))
}

/// Whether a WDS packet-service-status indication's TLVs report
/// `disconnected` on its connection-status TLV (0x01).
fn wds_indicates_disconnected(tlvs: &[Tlv]) -> bool {
    crate::qmi::tlv::find(tlvs, 0x01)
        .and_then(|t| t.value.first())
        .is_some_and(|&status| status == WDS_CONNECTION_STATUS_DISCONNECTED)
}

macro_rules! step {
    ($modem:expr, $name:expr, $body:expr) => {{
        match $body {
            Ok(()) => {}
            Err(e) if is_unsupported_error(&e) => {
                $modem.mark_step_unsupported($name).await;
            }
            Err(e) => return Err(Error::step($name, e)),
        }
    }};
}

pub(super) async fn run_initializing(modem: &Modem, token: &CancellationToken) -> Result<(), Error> {
    token.check()?;
    open_transport(modem).await.map_err(|e| Error::step("open_transport", e))?;

    step!(modem, "load_capabilities", load_capabilities(modem).await);
    token.check()?;
    step!(modem, "load_identity", load_identity(modem).await);
    token.check()?;
    step!(modem, "load_sim", load_sim(modem).await);
    token.check()?;
    step!(modem, "load_bands", load_bands(modem).await);
    token.check()?;
    step!(modem, "load_unlock_retries", load_unlock_retries(modem).await);

    let digest = modem.compute_device_identifier().await;
    modem.state.write().await.device_identifier = Some(digest);
    Ok(())
}

pub(super) async fn run_enabling(modem: &Modem, token: &CancellationToken) -> Result<(), Error> {
    step!(modem, "power_up", power_up(modem).await);
    token.check()?;
    setup_unsolicited_handlers(modem).await;
    step!(modem, "enable_unsolicited_events", enable_unsolicited_events(modem).await);
    token.check()?;
    step!(modem, "program_sms_routes", program_sms_routes(modem).await);
    modem.registration.start(modem).await;
    Ok(())
}

/// Program default SMS storage routing (spec.md §4.9), once per enable. A
/// no-op on the AT backend.
async fn program_sms_routes(modem: &Modem) -> Result<(), Error> {
    crate::sms::program_default_routes(modem, crate::sms::Storage::Sim).await
}

pub(super) async fn run_disabling(modem: &Modem, token: &CancellationToken) -> Result<(), Error> {
    modem.registration.stop().await;
    let _ = disable_unsolicited_events(modem).await;
    cleanup_unsolicited_handlers(modem).await;
    token.check()?;
    power_down(modem).await?;
    Ok(())
}

async fn open_transport(modem: &Modem) -> Result<(), Error> {
    let file = device::open_character_device(&modem.config.primary_port)
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;

    let backend = match modem.config.backend {
        BackendKind::At => {
            let port = AtPort::open(file, modem.config.append_lf, &modem.config.init_sequence)
                .await
                .map_err(Error::from)?;
            Backend::At(Arc::new(AtBackend::new(port)))
        }
        BackendKind::Qmi => {
            let port = QmiPort::open(file).await.map_err(Error::from)?;
            let session = Arc::new(QmiBackend::new(port));
            session.allocate_client(Service::Dms).await?;
            session.allocate_client(Service::Nas).await?;
            Backend::Qmi(session)
        }
    };

    let mut state = modem.state.write().await;
    state.backend = Some(backend);
    for port in state.ports.iter_mut() {
        if matches!(port.kind, crate::modem::PortKind::PrimaryAt | crate::modem::PortKind::QmiControl) {
            port.open = true;
        }
    }
    Ok(())
}

async fn load_capabilities(modem: &Modem) -> Result<(), Error> {
    let backend = get_backend(modem).await?;
    let mut caps = CapabilityMask::none();
    match backend {
        Backend::At(at) => {
            // Vendor modems in this family are LTE-only; a real plugin
            // layer would probe +WS46 here.
            let _ = at;
            caps.insert(CapabilityMask::LTE);
        }
        Backend::Qmi(qmi) => {
            let client = qmi.allocate_client(Service::Dms).await?;
            let output = qmi.invoke(client, DMS_GET_CAPS, &[], Duration::from_secs(3)).await?;
            // TLV 0x10 carries the capability list on the public DMS
            // get-capabilities response; absence just leaves caps empty
            // rather than failing the step.
            if let Some(tlv) = crate::qmi::tlv::find(&output, 0x10) {
                for &b in &tlv.value {
                    match b {
                        1 => caps.insert(CapabilityMask::CDMA_EVDO),
                        2 => caps.insert(CapabilityMask::GSM_UMTS),
                        3 => caps.insert(CapabilityMask::GSM_UMTS),
                        4 => caps.insert(CapabilityMask::LTE),
                        _ => {}
                    }
                }
            }
        }
    }
    if caps.is_lte_only() {
        // LTE-only modems short-circuit subsequent band/mode probing
        // (spec.md §4.6 step 2); nothing further to do here, the ladder
        // continues with identity/SIM loads regardless.
    }
    modem.state.write().await.capabilities = caps;
    Ok(())
}

async fn load_identity(modem: &Modem) -> Result<(), Error> {
    let backend = get_backend(modem).await?;
    let mut identity = Identity::default();
    match backend {
        Backend::At(at) => {
            identity.ati_response = join_lines(at_cmd(&at, "ATI", Duration::from_secs(3)).await?);
            identity.ati1_response = join_lines(at_cmd(&at, "ATI1", Duration::from_secs(3)).await?);
            identity.manufacturer = join_lines(at_cmd(&at, "AT+CGMI", Duration::from_secs(3)).await?);
            identity.model = join_lines(at_cmd(&at, "AT+CGMM", Duration::from_secs(3)).await?);
            identity.revision = join_lines(at_cmd(&at, "AT+CGMR", Duration::from_secs(3)).await?);
            identity.equipment_identifier = join_lines(at_cmd(&at, "AT+CGSN", Duration::from_secs(3)).await?);
        }
        Backend::Qmi(qmi) => {
            let client = qmi.allocate_client(Service::Dms).await?;
            let msr = qmi.invoke(client, DMS_GET_MSR, &[], Duration::from_secs(3)).await?;
            identity.manufacturer = find_string_tlv(&msr, 0x01);
            identity.model = find_string_tlv(&msr, 0x02);
            identity.revision = find_string_tlv(&msr, 0x03);
            let ids = qmi.invoke(client, DMS_GET_IDS, &[], Duration::from_secs(3)).await?;
            identity.equipment_identifier = find_string_tlv(&ids, 0x10);
            // QMI identity has no ATI/ATI1 analog; left empty per spec.md §7.
        }
    }
    modem.state.write().await.identity = identity;
    Ok(())
}

async fn load_sim(modem: &Modem) -> Result<(), Error> {
    let backend = get_backend(modem).await?;
    let sim = match backend {
        Backend::At(at) => {
            let cpin = at_cmd(&at, "AT+CPIN?", Duration::from_secs(5)).await?;
            let ccid = at_cmd(&at, "AT+CCID", Duration::from_secs(5)).await.unwrap_or_default();
            Sim::from_at_cpin(join_lines(cpin), join_lines(ccid))
        }
        Backend::Qmi(qmi) => {
            let client = qmi.allocate_client(Service::Dms).await?;
            let output = qmi.invoke(client, DMS_UIM_GET_PIN_STATUS, &[], Duration::from_secs(5)).await?;
            Sim::from_qmi_pin_status(&output)
        }
    };
    let sim = match sim {
        Ok(sim) => sim,
        Err(e) => return Err(Error::SimFailure(e.to_string())),
    };
    modem.state.write().await.sim = Some(sim);
    Ok(())
}

async fn load_bands(modem: &Modem) -> Result<(), Error> {
    let backend = get_backend(modem).await?;
    match backend {
        Backend::At(at) => {
            at_cmd(&at, "AT%BANDCAP=", Duration::from_secs(3)).await?;
            at_cmd(&at, "AT%GETCFG=\"BAND\"", Duration::from_secs(3)).await?;
        }
        Backend::Qmi(qmi) => {
            let client = qmi.allocate_client(Service::Nas).await?;
            qmi.invoke(client, NAS_GET_RF_BAND_INFO, &[], Duration::from_secs(3)).await?;
        }
    }
    Ok(())
}

async fn load_unlock_retries(modem: &Modem) -> Result<(), Error> {
    let backend = get_backend(modem).await?;
    let retries = match backend {
        Backend::At(at) => {
            let lines = at_cmd(&at, "AT%CPININFO", Duration::from_secs(3)).await?;
            crate::sim::parse_cpininfo(&join_lines(lines))
        }
        Backend::Qmi(qmi) => {
            let client = qmi.allocate_client(Service::Dms).await?;
            let output = qmi
                .invoke(client, DMS_UIM_GET_PIN_STATUS, &[], Duration::from_secs(3))
                .await?;
            Some(crate::sim::retries_from_qmi(&output))
        }
    };
    if let (Some(retries), Some(sim)) = (retries, modem.state.write().await.sim.as_mut()) {
        sim.retries = retries;
    }
    Ok(())
}

async fn power_up(modem: &Modem) -> Result<(), Error> {
    let backend = get_backend(modem).await?;
    match backend {
        Backend::At(at) => {
            at.port().flush_cache().await;
            match at_cmd(&at, "AT+CFUN=1", Duration::from_secs(6)).await {
                Ok(_) => {}
                Err(e) if is_unsupported_error(&e) => {}
                Err(e) => return Err(e),
            }
        }
        Backend::Qmi(qmi) => {
            let client = qmi.allocate_client(Service::Dms).await?;
            let input = [Tlv::u8(0x01, 0x06)]; // operating-mode = online
            match qmi.invoke(client, DMS_SET_OPERATING_MODE, &input, Duration::from_secs(6)).await {
                Ok(_) => {}
                Err(Error::Qmi(crate::qmi::QmiError::ProtocolError { code }))
                    if code == crate::qmi::QMI_ERR_NO_EFFECT => {}
                Err(e) => return Err(e),
            }
        }
    }
    modem.state.write().await.power_state = PowerState::On;
    Ok(())
}

async fn power_down(modem: &Modem) -> Result<(), Error> {
    let backend = get_backend(modem).await?;
    match backend {
        Backend::At(at) => {
            at_cmd(&at, "AT+CFUN=4", Duration::from_secs(6)).await?;
        }
        Backend::Qmi(qmi) => {
            let client = qmi.allocate_client(Service::Dms).await?;
            let input = [Tlv::u8(0x01, 0x00)]; // operating-mode = low-power
            qmi.invoke(client, DMS_SET_OPERATING_MODE, &input, Duration::from_secs(6)).await?;
        }
    }
    modem.state.write().await.power_state = PowerState::Low;
    Ok(())
}

// The `%STATCM` code for "PDN disconnected" (spec.md §6 unsolicited
// pattern table). Other documented codes (0 deregistered, 1 registered, 3
// PDN connected) carry no bearer-engine action here.
const STATCM_PDN_DISCONNECTED: u8 = 4;

async fn setup_unsolicited_handlers(modem: &Modem) {
    let backend = match get_backend(modem).await {
        Ok(b) => b,
        Err(_) => return,
    };
    match backend {
        Backend::At(at) => {
            let modem_id = modem.id;
            let state = modem.state.clone();
            at.port()
                .register_unsolicited(
                    r"^%STATCM: (\d+)",
                    Box::new(move |caps| {
                        if let Some(code) = caps.get(1).and_then(|m| m.as_str().parse::<u8>().ok()) {
                            log::info!("modem {modem_id} %STATCM code {code}");
                            if code == STATCM_PDN_DISCONNECTED {
                                let state = state.clone();
                                tokio::spawn(async move {
                                    crate::bearer::report_all_disconnected(&state, modem_id).await;
                                });
                            }
                        }
                    }),
                )
                .await;
            at.port()
                .register_unsolicited(
                    r#"^\+CMTI: "\w+",(\d+)"#,
                    Box::new(move |caps| {
                        if let Some(index) = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) {
                            log::info!("modem {modem_id} new SMS at index {index}");
                        }
                    }),
                )
                .await;
        }
        Backend::Qmi(qmi) => {
            let modem_id = modem.id;
            qmi.port()
                .on_indication(Service::Nas, NAS_SERVING_SYSTEM_IND, Box::new(|_tlvs| {}))
                .await;
            let state = modem.state.clone();
            qmi.port()
                .on_indication(
                    Service::Wds,
                    WDS_PACKET_SERVICE_STATUS_IND,
                    Box::new(move |tlvs| {
                        let disconnected = wds_indicates_disconnected(tlvs);
                        log::info!("modem {modem_id} WDS packet-service-status indication, disconnected={disconnected}");
                        if disconnected {
                            let state = state.clone();
                            tokio::spawn(async move {
                                crate::bearer::report_all_disconnected(&state, modem_id).await;
                            });
                        }
                    }),
                )
                .await;
            qmi.port()
                .on_indication(
                    Service::Wms,
                    WMS_MESSAGE_REPORT_IND,
                    Box::new(move |tlvs| {
                        if let Some(index) = crate::qmi::tlv::find(tlvs, 0x01).and_then(|t| t.value.get(0..4)) {
                            let index = u32::from_le_bytes([index[0], index[1], index[2], index[3]]);
                            log::info!("modem {modem_id} new SMS at index {index}");
                        }
                    }),
                )
                .await;
        }
    }
}

async fn cleanup_unsolicited_handlers(modem: &Modem) {
    if let Ok(backend) = get_backend(modem).await {
        match backend {
            Backend::At(at) => at.port().clear_unsolicited().await,
            Backend::Qmi(qmi) => {
                qmi.port().clear_indications(Service::Nas).await;
                qmi.port().clear_indications(Service::Wds).await;
                qmi.port().clear_indications(Service::Wms).await;
            }
        }
    }
}

async fn enable_unsolicited_events(modem: &Modem) -> Result<(), Error> {
    let backend = get_backend(modem).await?;
    match backend {
        Backend::At(at) => {
            at_cmd(&at, "AT%STATCM=1", Duration::from_secs(6)).await?;
        }
        Backend::Qmi(qmi) => {
            let client = qmi.allocate_client(Service::Nas).await?;
            qmi.invoke(client, NAS_REGISTER_INDICATIONS, &[], Duration::from_secs(5)).await?;
        }
    }
    Ok(())
}

async fn disable_unsolicited_events(modem: &Modem) -> Result<(), Error> {
    let backend = get_backend(modem).await?;
    if let Backend::At(at) = backend {
        at_cmd(&at, "AT%STATCM=0", Duration::from_secs(5)).await?;
    }
    Ok(())
}

/// Clone out the active backend handle under a short read lock; callers do
/// their own I/O without holding the modem lock, per spec.md §5's rule
/// against holding state across a suspension point.
async fn get_backend(modem: &Modem) -> Result<Backend, Error> {
    let state = modem.state.read().await;
    match &state.backend {
        Some(Backend::At(at)) => Ok(Backend::At(at.clone())),
        Some(Backend::Qmi(qmi)) => Ok(Backend::Qmi(qmi.clone())),
        None => Err(Error::Transport("transport not open".into())),
    }
}

fn join_lines(lines: Vec<String>) -> String {
    lines.join(" ")
}

fn find_string_tlv(tlvs: &[Tlv], ty: u8) -> String {
    crate::qmi::tlv::find(tlvs, ty)
        .and_then(|t| t.value.get(1..).map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wds_status_tlv_disconnected_is_detected() {
        let tlvs = vec![Tlv::u8(0x01, WDS_CONNECTION_STATUS_DISCONNECTED)];
        assert!(wds_indicates_disconnected(&tlvs));
    }

    #[test]
    fn wds_status_tlv_connected_is_not_disconnected() {
        let tlvs = vec![Tlv::u8(0x01, 0x02)];
        assert!(!wds_indicates_disconnected(&tlvs));
    }

    #[test]
    fn wds_status_tlv_missing_defaults_to_not_disconnected() {
        assert!(!wds_indicates_disconnected(&[]));
    }
}
