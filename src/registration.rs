//! Registration / signal tracker (C10): normalizes serving-system and
//! signal-strength indications into a per-domain registration snapshot and
//! runs a periodic refresh engine with threshold-based change notification
//! (spec.md §4.10). The original splits "setup rate" from "setup
//! thresholds" as two independently callable operations
//! (`mm-iface-modem-signal.c`); this tracker keeps that split.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::modem::{Backend, Modem, State};
use crate::qmi::tlv::{self, Tlv};
use crate::qmi::Service;

/// NAS `config-signal-info`: programs the RSSI/error-rate threshold vector
/// that gates signal-info indications (spec.md §4.10 "Thresholded
/// indications").
const NAS_CONFIG_SIGNAL_INFO: u16 = 0x0026;
/// NAS signal-info indication, delivered unsolicited once thresholds are
/// programmed. Shares its message id with the `get-signal-info` request
/// (`refresh_once` below), matching how the modem reports both the polled
/// and pushed forms of the same data.
const NAS_SIGNAL_INFO_IND: u16 = 0x004F;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Cs,
    Ps,
    Eps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegState {
    Unknown,
    Idle,
    Searching,
    Home,
    Roaming,
    Denied,
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub state: RegState,
    pub operator_code: Option<String>,
    pub operator_name: Option<String>,
    pub lac: Option<String>,
    pub cell_id: Option<String>,
}

impl Default for RegState {
    fn default() -> Self {
        RegState::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Technology {
    Cdma,
    Evdo,
    Gsm,
    Umts,
    Lte,
    Nr5g,
}

#[derive(Debug, Clone, Copy)]
pub struct Signal {
    pub rssi_dbm: i32,
    pub quality_percent: u8,
}

/// Table lookup from spec.md §4.10: (qmi registration-state, attach-state,
/// roaming) -> normalized state.
pub fn normalize(registration_state: &str, attached: bool, roaming: bool) -> RegState {
    match registration_state {
        "registered" if attached && !roaming => RegState::Home,
        "registered" if attached && roaming => RegState::Roaming,
        "searching" => RegState::Searching,
        "not-registered" => RegState::Idle,
        "denied" => RegState::Denied,
        _ => RegState::Unknown,
    }
}

/// Convert an RSSI in dBm to a 0-100 quality by linear clamping (spec.md
/// §4.10).
pub fn rssi_to_quality(rssi_dbm: i32) -> u8 {
    let clamped = rssi_dbm.clamp(-113, -51);
    let quality = 100 - (clamped + 51) * 100 / (-113 + 51);
    quality.clamp(0, 100) as u8
}

/// Operator-code synthesis, per spec.md §4.10 and the open question in §9.1:
/// the MNC-length heuristic misfires for networks with a leading-zero MNC
/// when the PCS-digit flag isn't reported. Preserved as specified; callers
/// should treat a `heuristic_used = true` result as suspect.
pub struct OperatorCode {
    pub code: String,
    pub heuristic_used: bool,
}

pub fn synthesize_operator_code(mcc: u16, mnc: u16, mnc_includes_pcs_digit: Option<bool>) -> OperatorCode {
    let mcc_str = format!("{mcc:03}");
    match mnc_includes_pcs_digit {
        Some(true) => OperatorCode { code: format!("{mcc_str}{mnc:03}"), heuristic_used: false },
        Some(false) => OperatorCode { code: format!("{mcc_str}{mnc:02}"), heuristic_used: false },
        None => {
            if mnc >= 100 {
                warn!("operator code MNC-length heuristic fired for mnc={mnc}: emitting 3 digits");
                OperatorCode { code: format!("{mcc_str}{mnc:03}"), heuristic_used: true }
            } else {
                OperatorCode { code: format!("{mcc_str}{mnc:02}"), heuristic_used: true }
            }
        }
    }
}

struct Inner {
    snapshots: HashMap<Domain, Snapshot>,
    signals: HashMap<Technology, Signal>,
    rate: Duration,
    rssi_threshold: i32,
    error_rate_threshold: i32,
}

/// Periodic refresh engine plus the normalized registration snapshots it
/// maintains. One instance per modem.
pub struct RegistrationTracker {
    inner: Arc<RwLock<Inner>>,
    refresh_task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl RegistrationTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                snapshots: HashMap::new(),
                signals: HashMap::new(),
                rate: Duration::from_secs(0),
                rssi_threshold: 0,
                error_rate_threshold: 0,
            })),
            refresh_task: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn snapshot(&self, domain: Domain) -> Snapshot {
        self.inner.read().await.snapshots.get(&domain).cloned().unwrap_or_default()
    }

    pub async fn update_snapshot(&self, domain: Domain, snapshot: Snapshot) {
        self.inner.write().await.snapshots.insert(domain, snapshot);
    }

    pub async fn signal(&self, technology: Technology) -> Option<Signal> {
        self.inner.read().await.signals.get(&technology).copied()
    }

    /// Called from the enabling ladder; starts the refresh engine if the
    /// configured rate is non-zero.
    pub async fn start(&self, modem: &Modem) {
        let rate = modem.config.signal_refresh_rate;
        self.set_rate(modem, rate).await;
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.refresh_task.write().await.take() {
            handle.abort();
        }
        self.inner.write().await.signals.clear();
    }

    /// Set the periodic refresh rate in seconds. `rate = 0` disables the
    /// engine and clears all signal records within one tick (spec.md §4.10,
    /// §8 scenario 7).
    pub async fn set_rate(&self, modem: &Modem, rate: Duration) {
        if let Some(handle) = self.refresh_task.write().await.take() {
            handle.abort();
        }
        self.inner.write().await.rate = rate;

        if rate.is_zero() {
            self.inner.write().await.signals.clear();
            return;
        }

        let inner = self.inner.clone();
        let state = modem.state.clone();
        let modem_id = modem.id;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(rate);
            loop {
                ticker.tick().await;
                if let Err(e) = refresh_once(modem_id, &state, &inner).await {
                    warn!("modem {modem_id} signal refresh failed: {e}");
                }
            }
        });
        *self.refresh_task.write().await = Some(handle);
    }

    /// Program RSSI/error-rate thresholds. When both are zero the engine
    /// relies on periodic polling only; when either is non-zero, QMI
    /// `config-signal-info` is invoked with the threshold vector and the
    /// engine subscribes to signal-info indications (spec.md §4.10
    /// "Thresholded indications"). QMI only: this family's AT vendor
    /// command set has no threshold-programming equivalent, so a non-zero
    /// request against an AT-backed modem is `Unsupported` rather than a
    /// silent no-op.
    pub async fn set_thresholds(&self, modem: &Modem, rssi_threshold: i32, error_rate_threshold: i32) -> Result<(), Error> {
        let backend = backend_of(&modem.state).await?;
        let qmi = match backend {
            Backend::Qmi(qmi) => qmi,
            Backend::At(_) if rssi_threshold == 0 && error_rate_threshold == 0 => return Ok(()),
            Backend::At(_) => return Err(Error::Unsupported),
        };

        {
            let mut inner = self.inner.write().await;
            inner.rssi_threshold = rssi_threshold;
            inner.error_rate_threshold = error_rate_threshold;
        }

        let client = qmi.allocate_client(Service::Nas).await?;
        let input = [
            Tlv::u8(0x10, rssi_threshold.clamp(i8::MIN as i32, i8::MAX as i32) as i8 as u8),
            Tlv::u8(0x11, error_rate_threshold.clamp(0, u8::MAX as i32) as u8),
        ];
        qmi.invoke(client, NAS_CONFIG_SIGNAL_INFO, &input, Duration::from_secs(3)).await?;

        if rssi_threshold == 0 && error_rate_threshold == 0 {
            qmi.port().clear_indication(Service::Nas, NAS_SIGNAL_INFO_IND).await;
            info!("modem {} signal-info thresholds cleared, relying on periodic polling", modem.id);
            return Ok(());
        }

        let inner = self.inner.clone();
        let modem_id = modem.id;
        qmi.port()
            .on_indication(
                Service::Nas,
                NAS_SIGNAL_INFO_IND,
                Box::new(move |tlvs| {
                    let readings = parse_qmi_signal(tlvs);
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        let mut guard = inner.write().await;
                        for (tech, rssi) in readings {
                            let quality = rssi_to_quality(rssi);
                            guard.signals.insert(tech, Signal { rssi_dbm: rssi, quality_percent: quality });
                        }
                    });
                }),
            )
            .await;
        info!("modem {modem_id} signal-info thresholds programmed: rssi={rssi_threshold} error_rate={error_rate_threshold}");
        Ok(())
    }
}

impl Default for RegistrationTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Clone out the active backend handle under a short read lock, the same
/// pattern `modem::ladder::get_backend` uses, so callers do their own I/O
/// without holding the modem lock across a suspension point (spec.md §5).
async fn backend_of(state: &Arc<tokio::sync::RwLock<State>>) -> Result<Backend, Error> {
    let guard = state.read().await;
    match &guard.backend {
        Some(Backend::At(at)) => Ok(Backend::At(at.clone())),
        Some(Backend::Qmi(qmi)) => Ok(Backend::Qmi(qmi.clone())),
        None => Err(Error::Transport("transport not open".into())),
    }
}

async fn refresh_once(
    modem_id: u64,
    state: &Arc<tokio::sync::RwLock<State>>,
    inner: &Arc<RwLock<Inner>>,
) -> Result<(), Error> {
    let backend = backend_of(state).await?;

    let readings: Vec<(Technology, i32)> = match backend {
        Backend::At(at) => {
            let resp = at
                .command(&crate::at::AtCommand::new("AT+CSQ", Duration::from_secs(3)))
                .await?;
            let rssi = parse_csq(&resp.join(" ")).unwrap_or(-113);
            vec![(Technology::Gsm, rssi)]
        }
        Backend::Qmi(qmi) => {
            let client = qmi.allocate_client(Service::Nas).await?;
            let message_id = if client.supports(1, 8) { 0x004F } else { 0x0020 };
            let output = qmi.invoke(client, message_id, &[], Duration::from_secs(3)).await?;
            parse_qmi_signal(&output)
        }
    };

    let mut guard = inner.write().await;
    for (tech, rssi) in readings {
        let quality = rssi_to_quality(rssi);
        guard.signals.insert(tech, Signal { rssi_dbm: rssi, quality_percent: quality });
    }
    info!("modem {modem_id} signal refresh: {} readings", guard.signals.len());
    Ok(())
}

fn parse_csq(response: &str) -> Option<i32> {
    let body = response.split("+CSQ:").nth(1)?;
    let rssi_field = body.split(',').next()?.trim();
    let raw: i32 = rssi_field.parse().ok()?;
    if raw == 99 {
        return None;
    }
    Some(-113 + raw * 2)
}

fn parse_qmi_signal(tlvs: &[Tlv]) -> Vec<(Technology, i32)> {
    let mut out = Vec::new();
    // TLV layout mirrors the public NAS get-signal-info response: each
    // per-RAT TLV carries a single signed-byte RSSI.
    let map = [
        (0x11, Technology::Cdma),
        (0x12, Technology::Evdo),
        (0x13, Technology::Gsm),
        (0x14, Technology::Umts),
        (0x15, Technology::Lte),
        (0x16, Technology::Nr5g),
    ];
    for (ty, tech) in map {
        if let Some(tlv) = tlv::find(tlvs, ty) {
            if let Some(&byte) = tlv.value.first() {
                out.push((tech, byte as i8 as i32));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_table() {
        assert_eq!(normalize("registered", true, false), RegState::Home);
        assert_eq!(normalize("registered", true, true), RegState::Roaming);
        assert_eq!(normalize("searching", true, false), RegState::Searching);
        assert_eq!(normalize("not-registered", false, false), RegState::Idle);
        assert_eq!(normalize("denied", false, false), RegState::Denied);
        assert_eq!(normalize("unknown", false, false), RegState::Unknown);
    }

    #[test]
    fn rssi_clamping() {
        assert_eq!(rssi_to_quality(-51), 100);
        assert_eq!(rssi_to_quality(-113), 0);
        assert_eq!(rssi_to_quality(-30), 100);
        assert_eq!(rssi_to_quality(-120), 0);
    }

    #[test]
    fn operator_code_with_explicit_pcs_flag() {
        let oc = synthesize_operator_code(310, 4, Some(true));
        assert_eq!(oc.code, "310004");
        assert!(!oc.heuristic_used);
    }

    #[test]
    fn operator_code_heuristic_three_digits_over_100() {
        let oc = synthesize_operator_code(310, 260, None);
        assert_eq!(oc.code, "310260");
        assert!(oc.heuristic_used);
    }

    #[test]
    fn csq_99_is_unknown() {
        assert_eq!(parse_csq("+CSQ: 99,99"), None);
    }

    #[test]
    fn csq_converts_to_dbm() {
        assert_eq!(parse_csq("+CSQ: 16,99"), Some(-81));
    }

    async fn at_backed_modem() -> Modem {
        let file = tokio::fs::OpenOptions::new().read(true).write(true).open("/dev/null").await.unwrap();
        let port = crate::at::AtPort::open(file, true, &[]).await.unwrap();
        let session = Arc::new(crate::transport::AtSession::new(port));
        let modem = Modem::new(crate::config::Config::new(crate::config::BackendKind::At, "/dev/ttyUSB2"));
        modem.state.write().await.backend = Some(Backend::At(session));
        modem
    }

    #[tokio::test]
    async fn set_thresholds_nonzero_on_at_backend_is_unsupported() {
        let modem = at_backed_modem().await;
        let tracker = RegistrationTracker::new();
        let err = tracker.set_thresholds(&modem, -90, 5).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported));
    }

    #[tokio::test]
    async fn set_thresholds_zero_on_at_backend_is_a_no_op() {
        let modem = at_backed_modem().await;
        let tracker = RegistrationTracker::new();
        tracker.set_thresholds(&modem, 0, 0).await.unwrap();
    }
}
