//! SIM object (C8): PIN/PUK state, unlock retries, facility locks.
//! Mutated only via SIM operations; refreshed from the modem after any
//! unlock attempt (spec.md §4.8).

use std::time::Duration;

use crate::at::parser::split_fields;
use crate::at::AtCommand;
use crate::error::Error;
use crate::modem::{Backend, Modem};
use crate::qmi::tlv::{self, Tlv};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    None,
    Pin,
    Puk,
    Pin2,
    Puk2,
    NetworkPerso,
    Unknown,
}

/// Per-lock remaining-retries counters (spec.md §3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Retries {
    pub pin1: Option<u32>,
    pub puk1: Option<u32>,
    pub pin2: Option<u32>,
    pub puk2: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Sim {
    pub iccid: Option<String>,
    pub imsi: Option<String>,
    pub lock: LockState,
    pub retries: Retries,
}

impl Sim {
    pub fn from_at_cpin(cpin_response: String, ccid_response: String) -> Result<Self, Error> {
        let lock = parse_cpin_status(&cpin_response)?;
        let iccid = extract_iccid(&ccid_response);
        Ok(Sim { iccid, imsi: None, lock, retries: Retries::default() })
    }

    pub fn from_qmi_pin_status(tlvs: &[Tlv]) -> Result<Self, Error> {
        let lock = tlv::find(tlvs, 0x11)
            .and_then(|t| t.value.first().copied())
            .map(lock_state_from_qmi)
            .unwrap_or(LockState::Unknown);
        Ok(Sim { iccid: None, imsi: None, lock, retries: retries_from_qmi(tlvs) })
    }

    /// Record a pessimistic local decrement after a PIN attempt fails with
    /// "incorrect password", pending the authoritative re-read (spec.md
    /// §4.8).
    pub fn pessimistic_decrement(&mut self, lock: LockState) {
        match lock {
            LockState::Pin => {
                if let Some(n) = &mut self.retries.pin1 {
                    *n = n.saturating_sub(1);
                }
            }
            LockState::Puk => {
                if let Some(n) = &mut self.retries.puk1 {
                    *n = n.saturating_sub(1);
                }
            }
            LockState::Pin2 => {
                if let Some(n) = &mut self.retries.pin2 {
                    *n = n.saturating_sub(1);
                }
            }
            LockState::Puk2 => {
                if let Some(n) = &mut self.retries.puk2 {
                    *n = n.saturating_sub(1);
                }
            }
            _ => {}
        }
    }
}

fn parse_cpin_status(response: &str) -> Result<LockState, Error> {
    let body = response
        .split("+CPIN:")
        .nth(1)
        .ok_or_else(|| Error::SimFailure("malformed +CPIN response".into()))?;
    let code = body.trim();
    Ok(match code {
        "READY" => LockState::None,
        "SIM PIN" => LockState::Pin,
        "SIM PUK" => LockState::Puk,
        "SIM PIN2" => LockState::Pin2,
        "SIM PUK2" => LockState::Puk2,
        "PH-NET PIN" => LockState::NetworkPerso,
        _ => LockState::Unknown,
    })
}

fn extract_iccid(response: &str) -> Option<String> {
    let digits: String = response.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

fn lock_state_from_qmi(code: u8) -> LockState {
    match code {
        0 => LockState::None,
        1 => LockState::Pin,
        2 => LockState::Puk,
        _ => LockState::Unknown,
    }
}

pub(crate) fn retries_from_qmi(tlvs: &[Tlv]) -> Retries {
    // TLV 0x12: pin1-retries, puk1-retries; TLV 0x13: pin2/puk2, mirroring
    // the public DMS uim-get-pin-status TLV layout.
    let mut retries = Retries::default();
    if let Some(t) = tlv::find(tlvs, 0x12) {
        if t.value.len() >= 2 {
            retries.pin1 = Some(t.value[0] as u32);
            retries.puk1 = Some(t.value[1] as u32);
        }
    }
    if let Some(t) = tlv::find(tlvs, 0x13) {
        if t.value.len() >= 2 {
            retries.pin2 = Some(t.value[0] as u32);
            retries.puk2 = Some(t.value[1] as u32);
        }
    }
    retries
}

/// Parse the vendor `%CPININFO: <pin1>,<puk1>,<pin2>,<puk2>` response.
///
/// Open question (spec.md §9.2): the reference parser accepts any line with
/// at least 4 comma-separated integer fields and only rejects fewer; a
/// malformed-but-4-field line is accepted as-is. Preserved here rather than
/// tightened.
pub fn parse_cpininfo(response: &str) -> Option<Retries> {
    let body = response.split("%CPININFO:").nth(1)?;
    let fields = split_fields(body);
    if fields.len() < 4 {
        return None;
    }
    let parse = |s: &str| s.trim().parse::<u32>().ok();
    Some(Retries {
        pin1: parse(&fields[0]),
        puk1: parse(&fields[1]),
        pin2: parse(&fields[2]),
        puk2: parse(&fields[3]),
    })
}

async fn backend_of(modem: &Modem) -> Result<Backend, Error> {
    let state = modem.state.read().await;
    match &state.backend {
        Some(Backend::At(at)) => Ok(Backend::At(at.clone())),
        Some(Backend::Qmi(qmi)) => Ok(Backend::Qmi(qmi.clone())),
        None => Err(Error::WrongState("transport not open".into())),
    }
}

async fn refresh_sim(modem: &Modem) -> Result<(), Error> {
    let backend = backend_of(modem).await?;
    let refreshed = match backend {
        Backend::At(at) => {
            let cpin = at.command(&AtCommand::new("AT+CPIN?", Duration::from_secs(5))).await?;
            Sim::from_at_cpin(cpin.join(" "), String::new())?
        }
        Backend::Qmi(qmi) => {
            let client = qmi.allocate_client(crate::qmi::Service::Dms).await?;
            let output = qmi
                .invoke(client, 0x002B, &[], Duration::from_secs(5))
                .await?;
            Sim::from_qmi_pin_status(&output)?
        }
    };
    let mut state = modem.state.write().await;
    if let Some(sim) = state.sim.as_mut() {
        let iccid = sim.iccid.clone();
        let imsi = sim.imsi.clone();
        *sim = refreshed;
        if sim.iccid.is_none() {
            sim.iccid = iccid;
        }
        if sim.imsi.is_none() {
            sim.imsi = imsi;
        }
    } else {
        state.sim = Some(refreshed);
    }
    Ok(())
}

fn incorrect_password(err: &Error) -> bool {
    // 3GPP 27.007 +CME ERROR 16 is "incorrect password".
    matches!(err, Error::At(crate::at::AtError::EquipmentError(16)))
}

/// Send a SIM PIN to unlock the card. On completion the modem re-reads the
/// unlock-retries counters and re-evaluates the lock state (spec.md §4.8).
pub async fn send_pin(modem: &Modem, pin: &str) -> Result<(), Error> {
    let backend = backend_of(modem).await?;
    let result = match &backend {
        Backend::At(at) => {
            at.command(&AtCommand::new(format!("AT+CPIN=\"{pin}\""), Duration::from_secs(5))).await.map(|_| ())
        }
        Backend::Qmi(qmi) => {
            let client = qmi.allocate_client(crate::qmi::Service::Dms).await?;
            let input = [Tlv::string(0x01, pin)];
            qmi.invoke(client, 0x0028, &input, Duration::from_secs(5)).await.map(|_| ())
        }
    };
    if let Err(e) = &result {
        if incorrect_password(e) {
            let mut state = modem.state.write().await;
            if let Some(sim) = state.sim.as_mut() {
                sim.pessimistic_decrement(LockState::Pin);
            }
        }
    }
    refresh_sim(modem).await?;
    result
}

/// Send a PUK plus a new PIN to recover from a PUK-locked card.
pub async fn send_puk(modem: &Modem, puk: &str, new_pin: &str) -> Result<(), Error> {
    let backend = backend_of(modem).await?;
    let result = match &backend {
        Backend::At(at) => {
            at.command(&AtCommand::new(format!("AT+CPIN=\"{puk}\",\"{new_pin}\""), Duration::from_secs(5)))
                .await
                .map(|_| ())
        }
        Backend::Qmi(qmi) => {
            let client = qmi.allocate_client(crate::qmi::Service::Dms).await?;
            let input = [Tlv::string(0x01, puk), Tlv::string(0x02, new_pin)];
            qmi.invoke(client, 0x0029, &input, Duration::from_secs(5)).await.map(|_| ())
        }
    };
    if let Err(e) = &result {
        if incorrect_password(e) {
            let mut state = modem.state.write().await;
            if let Some(sim) = state.sim.as_mut() {
                sim.pessimistic_decrement(LockState::Puk);
            }
        }
    }
    refresh_sim(modem).await?;
    result
}

/// Change the SIM PIN from `old` to `new`.
pub async fn change_pin(modem: &Modem, old: &str, new: &str) -> Result<(), Error> {
    let backend = backend_of(modem).await?;
    let result = match &backend {
        Backend::At(at) => {
            at.command(&AtCommand::new(format!("AT+CPWD=\"SC\",\"{old}\",\"{new}\""), Duration::from_secs(5)))
                .await
                .map(|_| ())
        }
        Backend::Qmi(qmi) => {
            let client = qmi.allocate_client(crate::qmi::Service::Dms).await?;
            let input = [Tlv::string(0x01, old), Tlv::string(0x02, new)];
            qmi.invoke(client, 0x002A, &input, Duration::from_secs(5)).await.map(|_| ())
        }
    };
    refresh_sim(modem).await?;
    result
}

/// Enable or disable the PIN-required facility lock.
pub async fn enable_pin(modem: &Modem, pin: &str, enable: bool) -> Result<(), Error> {
    let backend = backend_of(modem).await?;
    let result = match &backend {
        Backend::At(at) => {
            let flag = if enable { 1 } else { 0 };
            at.command(&AtCommand::new(format!("AT+CLCK=\"SC\",{flag},\"{pin}\""), Duration::from_secs(5)))
                .await
                .map(|_| ())
        }
        Backend::Qmi(qmi) => {
            let client = qmi.allocate_client(crate::qmi::Service::Dms).await?;
            let input = [Tlv::u8(0x01, enable as u8), Tlv::string(0x02, pin)];
            qmi.invoke(client, 0x002C, &input, Duration::from_secs(5)).await.map(|_| ())
        }
    };
    refresh_sim(modem).await?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpin_ready_maps_to_none() {
        assert_eq!(parse_cpin_status("+CPIN: READY").unwrap(), LockState::None);
    }

    #[test]
    fn cpin_sim_pin_maps_to_pin_lock() {
        assert_eq!(parse_cpin_status("+CPIN: SIM PIN").unwrap(), LockState::Pin);
    }

    #[test]
    fn cpininfo_four_fields_parses() {
        let retries = parse_cpininfo("%CPININFO: 3,10,3,10").unwrap();
        assert_eq!(retries.pin1, Some(3));
        assert_eq!(retries.puk1, Some(10));
    }

    #[test]
    fn cpininfo_fewer_than_four_fields_rejected() {
        assert!(parse_cpininfo("%CPININFO: 3,10").is_none());
    }

    #[test]
    fn iccid_extracts_digits_only() {
        assert_eq!(extract_iccid("8931234567890123456F").as_deref(), Some("8931234567890123456"));
    }

    #[test]
    fn pessimistic_decrement_floors_at_zero() {
        let mut sim = Sim { iccid: None, imsi: None, lock: LockState::Pin, retries: Retries { pin1: Some(0), ..Default::default() } };
        sim.pessimistic_decrement(LockState::Pin);
        assert_eq!(sim.retries.pin1, Some(0));
    }
}
