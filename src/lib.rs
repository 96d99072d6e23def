//! `cellbroker` — a user-space broker for cellular modems.
//!
//! Discovers nothing itself (device discovery and classification are a host
//! concern); given a configured AT or QMI endpoint, it drives the modem from
//! an unusable state up to registered and connected, decodes and encodes SMS
//! PDUs, and exposes the resulting modems, SIMs, and bearers as addressable
//! objects with stable string paths.
//!
//! The crate is organized by concern rather than by backend: [`at`] and
//! [`qmi`] are the two wire transports; [`modem`], [`bearer`], [`sim`],
//! [`registration`], and [`sms`] are backend-agnostic objects that pick a
//! concrete transport at construction time via [`config::Config`].

pub mod at;
pub mod bearer;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod hex;
pub mod modem;
pub mod pdu;
pub mod qmi;
pub mod registration;
pub mod registry;
pub mod serializer;
pub mod sim;
pub mod sleep;
pub mod sms;
pub mod transport;
pub mod ussd;

pub use config::{BackendKind, Config};
pub use error::Error;
pub use modem::Modem;
pub use registry::Registry;
