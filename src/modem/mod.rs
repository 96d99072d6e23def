//! Modem state machine (C6): the initialization → enabling → enabled →
//! connected ladder and the disable path, realized as ordered sequences of
//! asynchronous probes (spec.md §4.6). Each probe step's failure is either
//! recorded as "unsupported" (ladder continues) or promotes the modem to
//! `Failed` (any other error).

pub mod ladder;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use log::{info, warn};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::bearer::Bearer;
use crate::config::{BackendKind, Config};
use crate::error::Error;
use crate::registration::RegistrationTracker;
use crate::serializer::Serializer;
use crate::sim::Sim;
use crate::sms::SmsStore;
use crate::transport::{AtSession, QmiSession};
use crate::ussd::UssdSession;

pub type AtBackend = AtSession<tokio::fs::File>;
pub type QmiBackend = QmiSession<tokio::fs::File>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Off,
    Low,
    On,
    Unknown,
}

/// Lifecycle states and permitted transitions, per the ladder diagram in
/// spec.md §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unknown,
    Initializing,
    Disabled,
    Enabling,
    Enabled,
    Searching,
    Registered,
    Connecting,
    Connected,
    Disconnecting,
    Disabling,
    Failed,
}

impl Lifecycle {
    /// The transport session is non-null iff lifecycle >= enabling
    /// (spec.md §3 invariant).
    pub fn requires_open_transport(self) -> bool {
        !matches!(self, Lifecycle::Unknown | Lifecycle::Initializing | Lifecycle::Disabled | Lifecycle::Failed)
    }
}

/// Capability mask: which radio access families the modem supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityMask(u8);

impl CapabilityMask {
    pub const GSM_UMTS: CapabilityMask = CapabilityMask(1 << 0);
    pub const CDMA_EVDO: CapabilityMask = CapabilityMask(1 << 1);
    pub const LTE: CapabilityMask = CapabilityMask(1 << 2);
    pub const NR5G: CapabilityMask = CapabilityMask(1 << 3);

    pub fn none() -> Self {
        CapabilityMask(0)
    }

    pub fn contains(self, other: CapabilityMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: CapabilityMask) {
        self.0 |= other.0;
    }

    /// LTE-only modems short-circuit several initializing steps (spec.md
    /// §4.6, step 2).
    pub fn is_lte_only(self) -> bool {
        self.0 == Self::LTE.0
    }
}

impl std::ops::BitOr for CapabilityMask {
    type Output = CapabilityMask;
    fn bitor(self, rhs: CapabilityMask) -> CapabilityMask {
        CapabilityMask(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    PrimaryAt,
    SecondaryAt,
    QmiControl,
    NetworkData,
    Ignored,
}

#[derive(Debug, Clone)]
pub struct Port {
    pub kind: PortKind,
    pub device_path: String,
    pub open: bool,
    pub connected: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub manufacturer: String,
    pub model: String,
    pub revision: String,
    pub equipment_identifier: String,
    pub ati_response: String,
    pub ati1_response: String,
    pub iccid: Option<String>,
}

pub(crate) enum Backend {
    At(Arc<AtBackend>),
    Qmi(Arc<QmiBackend>),
}

pub(crate) struct State {
    pub lifecycle: Lifecycle,
    pub power_state: PowerState,
    pub identity: Identity,
    pub capabilities: CapabilityMask,
    pub ports: Vec<Port>,
    pub backend: Option<Backend>,
    pub sim: Option<Sim>,
    pub bearers: Vec<Bearer>,
    pub unsupported_steps: HashSet<String>,
    pub device_identifier: Option<String>,
    pub max_bearers: usize,
    pub sms: SmsStore,
}

static NEXT_MODEM_ID: AtomicU64 = AtomicU64::new(1);

/// A single managed modem. Mutated only by the operation serialized onto
/// its own [`Serializer`] (spec.md §3 "Mutated only by the serializer
/// owning the modem").
pub struct Modem {
    pub id: u64,
    pub config: Config,
    pub(crate) state: Arc<RwLock<State>>,
    pub serializer: Serializer,
    pub registration: RegistrationTracker,
    pub(crate) ussd: UssdSession,
}

impl Modem {
    pub fn new(config: Config) -> Self {
        let id = NEXT_MODEM_ID.fetch_add(1, AtomicOrdering::Relaxed);
        let mut ports = vec![Port {
            kind: match config.backend {
                BackendKind::At => PortKind::PrimaryAt,
                BackendKind::Qmi => PortKind::QmiControl,
            },
            device_path: config.primary_port.clone(),
            open: false,
            connected: false,
        }];
        if let Some(secondary) = &config.secondary_port {
            ports.push(Port { kind: PortKind::SecondaryAt, device_path: secondary.clone(), open: false, connected: false });
        }
        if let Some(data) = &config.data_port {
            ports.push(Port { kind: PortKind::NetworkData, device_path: data.clone(), open: false, connected: false });
        }

        let state = State {
            lifecycle: Lifecycle::Unknown,
            power_state: PowerState::Unknown,
            identity: Identity::default(),
            capabilities: CapabilityMask::none(),
            ports,
            backend: None,
            sim: None,
            bearers: Vec::new(),
            unsupported_steps: HashSet::new(),
            device_identifier: None,
            max_bearers: 4,
            sms: SmsStore::new(),
        };

        Self {
            id,
            config,
            state: Arc::new(RwLock::new(state)),
            serializer: Serializer::new(),
            registration: RegistrationTracker::new(),
            ussd: UssdSession::new(),
        }
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        self.state.read().await.lifecycle
    }

    pub async fn power_state(&self) -> PowerState {
        self.state.read().await.power_state
    }

    async fn set_lifecycle(&self, lifecycle: Lifecycle) {
        let mut state = self.state.write().await;
        info!("modem {} lifecycle {:?} -> {:?}", self.id, state.lifecycle, lifecycle);
        state.lifecycle = lifecycle;
    }

    async fn mark_step_unsupported(&self, step: &str) {
        warn!("modem {} step '{step}' unsupported, continuing ladder", self.id);
        self.state.write().await.unsupported_steps.insert(step.to_string());
    }

    async fn fail(&self, step: &str, err: &Error) {
        warn!("modem {} step '{step}' failed fatally: {err}", self.id);
        self.set_lifecycle(Lifecycle::Failed).await;
        if let Some(Backend::At(at)) = &self.state.read().await.backend {
            at.port().flush_cache().await;
        }
    }

    /// Run the full initializing ladder once per physical plug-in.
    pub async fn initialize(&self) -> Result<(), Error> {
        let serializer = self.serializer.clone();
        serializer
            .run(|token| async move {
                self.set_lifecycle(Lifecycle::Initializing).await;
                if let Err(e) = ladder::run_initializing(self, &token).await {
                    self.fail("initializing", &e).await;
                    return Err(e);
                }
                self.set_lifecycle(Lifecycle::Disabled).await;
                Ok(())
            })
            .await
    }

    /// Drive the enabling ladder; on success the modem ends in `Enabled`
    /// (registration proceeds independently via the registration tracker).
    pub async fn enable(&self) -> Result<(), Error> {
        if self.lifecycle().await != Lifecycle::Disabled {
            return Err(Error::WrongState("enable requires Disabled".into()));
        }
        let serializer = self.serializer.clone();
        serializer
            .run(|token| async move {
                self.set_lifecycle(Lifecycle::Enabling).await;
                if let Err(e) = ladder::run_enabling(self, &token).await {
                    self.fail("enabling", &e).await;
                    return Err(e);
                }
                self.set_lifecycle(Lifecycle::Enabled).await;
                Ok(())
            })
            .await
    }

    /// Inverse of `enable`: disable unsolicited events, clean up handlers,
    /// power down.
    pub async fn disable(&self) -> Result<(), Error> {
        let serializer = self.serializer.clone();
        serializer
            .run(|token| async move {
                self.set_lifecycle(Lifecycle::Disabling).await;
                ladder::run_disabling(self, &token).await?;
                self.set_lifecycle(Lifecycle::Disabled).await;
                Ok(())
            })
            .await
    }

    /// The SHA-256 device-identifier hash from spec.md §7.
    pub async fn compute_device_identifier(&self) -> String {
        let identity = self.state.read().await.identity.clone();
        let mut hasher = Sha256::new();
        hasher.update(identity.manufacturer.as_bytes());
        hasher.update(b"\x00");
        hasher.update(identity.model.as_bytes());
        hasher.update(b"\x00");
        hasher.update(identity.revision.as_bytes());
        hasher.update(b"\x00");
        hasher.update(identity.ati_response.as_bytes());
        hasher.update(b"\x00");
        hasher.update(identity.ati1_response.as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub async fn identity(&self) -> Identity {
        self.state.read().await.identity.clone()
    }

    pub async fn bearers_len(&self) -> usize {
        self.state.read().await.bearers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_mask_lte_only() {
        let mut caps = CapabilityMask::none();
        caps.insert(CapabilityMask::LTE);
        assert!(caps.is_lte_only());
        caps.insert(CapabilityMask::GSM_UMTS);
        assert!(!caps.is_lte_only());
    }

    #[test]
    fn requires_open_transport_matches_invariant() {
        assert!(!Lifecycle::Disabled.requires_open_transport());
        assert!(Lifecycle::Enabling.requires_open_transport());
        assert!(Lifecycle::Connected.requires_open_transport());
        assert!(!Lifecycle::Failed.requires_open_transport());
    }
}
