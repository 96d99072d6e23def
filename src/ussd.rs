//! USSD surface (C-adjacent; spec.md §1 scopes USSD "only at the interface").
//! Grounded in `mm-iface-modem-3gpp-ussd.c`: the session state machine and
//! the `initiate`/`respond`/`cancel` entry points, with no network-side text
//! encoding — request and response strings pass through verbatim.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::at::parser::split_fields;
use crate::at::AtCommand;
use crate::error::Error;
use crate::modem::{Backend, Modem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    ResponseReceived,
}

/// `initiate`, `respond`, `cancel` against a modem's USSD session.
#[async_trait]
pub trait Ussd {
    async fn initiate(&self, request: &str) -> Result<String, Error>;
    async fn respond(&self, response: &str) -> Result<String, Error>;
    async fn cancel(&self) -> Result<(), Error>;
    async fn ussd_state(&self) -> SessionState;
}

/// Per-modem USSD session state, mirroring the original's
/// `MMIfaceModem3gppUssd` skeleton minus the D-Bus plumbing.
pub struct UssdSession {
    state: Mutex<SessionState>,
}

impl UssdSession {
    pub fn new() -> Self {
        Self { state: Mutex::new(SessionState::Idle) }
    }
}

impl Default for UssdSession {
    fn default() -> Self {
        Self::new()
    }
}

/// `+CUSD: <n>[,"<text>"[,<dcs>]]`, a result-code response the modem may
/// fold into a command's own payload. `n`: 0 = no further action (session
/// ends), 1 = further action required (network awaits a response), 2 =
/// session terminated by the network.
fn parse_cusd(line: &str) -> Option<(u8, Option<String>)> {
    let body = line.strip_prefix("+CUSD:")?;
    let fields = split_fields(body);
    let n: u8 = fields.first()?.trim().parse().ok()?;
    let text = fields.get(1).filter(|s| !s.is_empty()).cloned();
    Some((n, text))
}

fn find_cusd(payload: &[String]) -> Option<(u8, Option<String>)> {
    payload.iter().find_map(|line| parse_cusd(line))
}

async fn backend_of(modem: &Modem) -> Result<Backend, Error> {
    let state = modem.state.read().await;
    match &state.backend {
        Some(Backend::At(at)) => Ok(Backend::At(at.clone())),
        Some(Backend::Qmi(qmi)) => Ok(Backend::Qmi(qmi.clone())),
        None => Err(Error::WrongState("transport not open".into())),
    }
}

/// Run one `AT+CUSD=1,"<text>",15` exchange, apply the resulting session
/// transition, and return the network's reply text (empty if none arrived).
async fn exchange(modem: &Modem, text: &str) -> Result<String, Error> {
    let backend = backend_of(modem).await?;
    let payload = match backend {
        Backend::At(at) => {
            let escaped = text.replace('"', "");
            at.command(&AtCommand::new(format!("AT+CUSD=1,\"{escaped}\",15"), Duration::from_secs(30))).await?
        }
        Backend::Qmi(_) => return Err(Error::Unsupported),
    };

    let (n, reply) = find_cusd(&payload).unwrap_or((0, None));
    let mut guard = modem.ussd.state.lock().await;
    *guard = if n == 1 { SessionState::ResponseReceived } else { SessionState::Idle };
    Ok(reply.unwrap_or_default())
}

#[async_trait]
impl Ussd for Modem {
    async fn initiate(&self, request: &str) -> Result<String, Error> {
        {
            let mut guard = self.ussd.state.lock().await;
            if *guard != SessionState::Idle {
                return Err(Error::WrongState("USSD session already active".into()));
            }
            *guard = SessionState::Active;
        }
        exchange(self, request).await
    }

    async fn respond(&self, response: &str) -> Result<String, Error> {
        {
            let guard = self.ussd.state.lock().await;
            if *guard != SessionState::ResponseReceived {
                return Err(Error::WrongState("no USSD response pending".into()));
            }
        }
        exchange(self, response).await
    }

    async fn cancel(&self) -> Result<(), Error> {
        {
            let guard = self.ussd.state.lock().await;
            if *guard == SessionState::Idle {
                return Err(Error::WrongState("no USSD session to cancel".into()));
            }
        }
        let backend = backend_of(self).await?;
        let result = match backend {
            Backend::At(at) => at.command(&AtCommand::new("AT+CUSD=2", Duration::from_secs(5))).await.map(|_| ()),
            Backend::Qmi(_) => Err(Error::Unsupported),
        };
        *self.ussd.state.lock().await = SessionState::Idle;
        result
    }

    async fn ussd_state(&self) -> SessionState {
        *self.ussd.state.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_further_action_required() {
        let (n, text) = parse_cusd("+CUSD: 1,\"Enter PIN\",15").unwrap();
        assert_eq!(n, 1);
        assert_eq!(text.as_deref(), Some("Enter PIN"));
    }

    #[test]
    fn parses_no_further_action_without_text() {
        let (n, text) = parse_cusd("+CUSD: 0").unwrap();
        assert_eq!(n, 0);
        assert_eq!(text, None);
    }

    #[test]
    fn non_cusd_line_is_none() {
        assert!(parse_cusd("+CREG: 0,1").is_none());
    }

    #[tokio::test]
    async fn respond_without_pending_response_is_wrong_state() {
        let modem = Modem::new(crate::config::Config::new(crate::config::BackendKind::At, "/dev/ttyUSB2"));
        let err = modem.respond("1234").await.unwrap_err();
        assert!(matches!(err, Error::WrongState(_)));
    }

    #[tokio::test]
    async fn cancel_with_no_session_is_wrong_state() {
        let modem = Modem::new(crate::config::Config::new(crate::config::BackendKind::At, "/dev/ttyUSB2"));
        let err = modem.cancel().await.unwrap_err();
        assert!(matches!(err, Error::WrongState(_)));
    }
}
