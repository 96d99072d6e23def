//! QMUX-framed binary transport (C3): service-client allocation over a
//! control service, transaction-correlated request/response, and
//! asynchronous indication dispatch.

pub mod frame;
pub mod port;
pub mod tlv;

use thiserror::Error;

pub use frame::{ControlFlags, QmuxFrame};
pub use port::QmiPort;
pub use tlv::Tlv;

/// The QMI services this crate allocates clients against (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    /// Control service (client id 0, never allocated explicitly).
    Ctl,
    /// Device Management Service.
    Dms,
    /// Network Access Service.
    Nas,
    /// Wireless Messaging Service.
    Wms,
    /// Wireless Data Service.
    Wds,
    /// Position Determination Service.
    Pds,
}

impl Service {
    /// Wire service-type byte, per the public QMI service numbering.
    pub fn id(self) -> u8 {
        match self {
            Service::Ctl => 0x00,
            Service::Wds => 0x01,
            Service::Dms => 0x02,
            Service::Nas => 0x03,
            Service::Wms => 0x05,
            Service::Pds => 0x06,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QmiError {
    #[error("qmi protocol error: code {code}")]
    ProtocolError { code: u16 },
    #[error("qmi framing error: {0}")]
    Framing(String),
    #[error("qmi port closed")]
    PortClosed,
    #[error("qmi command timed out")]
    Timeout,
    #[error("no client allocated for service {0:?}")]
    NoClient(Service),
    #[error("message {message_id:#06x} requires version >= {major}.{minor}")]
    VersionTooOld { message_id: u16, major: u16, minor: u16 },
}

/// A negative QMI result, carried in the universal `Result` TLV (0x02).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QmiResult {
    pub success: bool,
    pub error_code: u16,
}

/// `no-effect` (0x0067 in the public enum) is treated as success by callers
/// that set state that may already be set, per spec.md §4.3.
pub const QMI_ERR_NO_EFFECT: u16 = 0x0067;
/// `call-failed`, surfaced with call-end-reason detail by the bearer engine.
pub const QMI_ERR_CALL_FAILED: u16 = 0x0031;

/// An allocated client: a (service, client-id) pair plus the modem-reported
/// version the caller should gate newer messages on.
#[derive(Debug, Clone, Copy)]
pub struct ClientHandle {
    pub service: Service,
    pub client_id: u8,
    pub version: (u16, u16),
}

impl ClientHandle {
    /// Whether this client's reported service version is at least
    /// `(major, minor)`. Callers test this before sending messages
    /// introduced in a later revision and fall back to older equivalents
    /// on `false` (spec.md §4.3 "Version gating").
    pub fn supports(&self, major: u16, minor: u16) -> bool {
        self.version >= (major, minor)
    }
}
